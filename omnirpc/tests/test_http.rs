mod common;

use std::time::Duration;

use common::{init_tracing, start_http_server};
use omnirpc::{Client, ClientConfig, ClientEvent, ErrorKind, RemoteError};
use serde_json::json;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn http_client(address: String) -> Client {
    let config = ClientConfig {
        address: Some(address),
        ..Default::default()
    };
    Client::create(&config, None).unwrap()
}

#[tokio::test]
async fn test_http_round_trip() {
    init_tracing();
    let addr = start_http_server().await;
    let client = http_client(format!("http://{addr}/rpc"));
    timeout(WAIT, client.wait_until_active()).await.unwrap();

    let reply = client.call("echo", json!([1, "two"]), "h1").recv().await;
    assert_eq!(reply.tag.as_deref(), Some("h1"));
    assert_eq!(reply.result, Ok(json!([1, "two"])));

    let reply = client.call("fail", json!({}), "").recv().await;
    assert_eq!(reply.result, Err(RemoteError::new(500, "failed on purpose")));

    // keep-alive connections are shared by concurrent calls
    let receivers: Vec<_> = (0..16).map(|i| client.call("echo", json!(i), "")).collect();
    for (i, receiver) in receivers.into_iter().enumerate() {
        let reply = timeout(WAIT, receiver.recv()).await.unwrap();
        assert_eq!(reply.result, Ok(json!(i)));
    }
}

#[tokio::test]
async fn test_http_status_error() {
    init_tracing();
    let addr = start_http_server().await;
    let client = http_client(format!("http://{addr}/missing"));
    timeout(WAIT, client.wait_until_active()).await.unwrap();

    let reply = client.call("echo", json!({}), "h2").recv().await;
    assert_eq!(reply.tag.as_deref(), Some("h2"));
    assert_eq!(
        reply.result,
        Err(RemoteError::new(404, "Unexpected http code 404"))
    );
}

#[tokio::test]
async fn test_http_invalid_body() {
    init_tracing();
    let addr = start_http_server().await;
    let client = http_client(format!("http://{addr}/rpc"));
    timeout(WAIT, client.wait_until_active()).await.unwrap();

    let reply = client.call("garbage", json!({}), "").recv().await;
    assert_eq!(
        reply.result,
        Err(RemoteError::new(400, "The server returned invalid JSON string."))
    );
    assert!(client.is_active());
}

#[tokio::test]
async fn test_http_connect_refused() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = http_client(format!("http://{addr}/rpc"));
    let mut events = client.subscribe();
    timeout(WAIT, client.wait_until_active()).await.unwrap();
    assert_eq!(events.recv().await.unwrap(), ClientEvent::Open);

    let reply = timeout(WAIT, client.call("echo", json!({}), "").recv())
        .await
        .unwrap();
    assert_eq!(reply.result.unwrap_err().code, 400);

    let ClientEvent::Error(err) = events.recv().await.unwrap() else {
        panic!("expected a connect error");
    };
    assert_eq!(err.kind, ErrorKind::HttpConnectFailed);
    // http never closes
    assert!(client.is_active());
    assert!(!client.is_reconnect());
}
