#![allow(dead_code)]

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use omnirpc::{Client, ClientConfig, OutgoingPacket, Transport, TransportSink};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{
    Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// In-memory transport driven by the test: it records what the client sends
/// and lets the test raise lifecycle signals and responses by hand.
#[derive(Default)]
pub struct ManualTransport {
    sink: OnceLock<TransportSink>,
    sent: Mutex<Vec<OutgoingPacket>>,
}

impl ManualTransport {
    fn sink(&self) -> &TransportSink {
        self.sink.get().expect("transport not started")
    }

    pub fn open(&self) {
        self.sink().open();
    }

    pub fn close(&self, code: Option<u16>, reason: &str) {
        self.sink().close(code, reason);
    }

    pub fn respond(&self, value: Value) {
        self.sink().deliver_value(value);
    }

    pub fn respond_raw(&self, bytes: &[u8]) {
        self.sink().deliver(bytes);
    }

    pub fn fail(&self, packet: &OutgoingPacket, code: i64, message: &str) {
        self.sink().fail(packet, code, message);
    }

    pub fn sent(&self) -> Vec<OutgoingPacket> {
        self.sent.lock().clone()
    }

    pub fn last_sent(&self) -> OutgoingPacket {
        self.sent.lock().last().cloned().expect("nothing sent")
    }
}

impl Transport for ManualTransport {
    fn start(&self, sink: TransportSink) {
        assert!(self.sink.set(sink).is_ok(), "started twice");
    }

    fn send(&self, packet: OutgoingPacket) {
        self.sent.lock().push(packet);
    }
}

pub fn manual_client(config: ClientConfig) -> (Client, Arc<ManualTransport>) {
    let transport = Arc::new(ManualTransport::default());
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let client = Client::create(&config, Some(dyn_transport)).unwrap();
    (client, transport)
}

/// Answers `{"method", "args", "tag", "id"}` requests by echoing `args` as the
/// result. `silent` gets no answer, `fail` an error object.
fn answer(request: &Value) -> Option<Value> {
    match request["method"].as_str() {
        Some("silent") => None,
        Some("fail") => Some(json!({
            "id": request["id"],
            "tag": request["tag"],
            "error": {"code": 500, "message": "failed on purpose"},
        })),
        _ => Some(json!({
            "id": request["id"],
            "tag": request["tag"],
            "result": request["args"],
        })),
    }
}

/// WebSocket echo server. A `close` request makes it close the connection
/// with code 1000 instead of answering.
pub async fn start_ws_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_ws(stream));
        }
    });
    addr
}

async fn serve_ws(stream: TcpStream) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let request: Value = serde_json::from_str(&text).unwrap();
        if request["method"] == "close" {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            };
            let _ = ws.send(Message::Close(Some(frame))).await;
            return;
        }
        if let Some(response) = answer(&request) {
            ws.send(Message::Text(response.to_string().into()))
                .await
                .unwrap();
        }
    }
}

/// HTTP echo server on `/rpc`. Other paths answer 404, a `garbage` request
/// gets a body that is not JSON.
pub async fn start_http_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(handle_http))
                    .await;
            });
        }
    });
    addr
}

async fn handle_http(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/rpc" {
        let mut rsp = Response::new(Full::new(Bytes::from_static(b"not found")));
        *rsp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(rsp);
    }

    let body = req.into_body().collect().await.unwrap().to_bytes();
    let request: Value = serde_json::from_slice(&body).unwrap();
    let body = match request["method"].as_str() {
        Some("garbage") => Bytes::from_static(b"<html>oops</html>"),
        _ => Bytes::from(answer(&request).unwrap_or(Value::Null).to_string()),
    };
    Ok(Response::new(Full::new(body)))
}
