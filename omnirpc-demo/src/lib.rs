use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

pub const CODE_METHOD_NOT_FOUND: i64 = 404;
pub const CODE_INVALID_ARGS: i64 = 422;

#[derive(Deserialize, Debug)]
struct DemoRequest {
    method: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    tag: Value,
    id: Value,
}

/// Echo and greet methods behind the `{method, args, tag, id}` envelope.
#[derive(Default, Debug)]
pub struct DemoService {
    greeted: AtomicU64,
}

impl DemoService {
    /// Answers one raw request. Returns `None` when the payload is not a
    /// request at all, since there is no id to answer to.
    pub fn handle(&self, raw: &[u8]) -> Option<Value> {
        let request: DemoRequest = match serde_json::from_slice(raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("drop invalid request: {e}");
                return None;
            }
        };

        let outcome = match request.method.as_str() {
            "echo" => Ok(request.args),
            "greet" => match request.args.get("name").and_then(Value::as_str) {
                Some(name) => {
                    let idx = self.greeted.fetch_add(1, Ordering::AcqRel);
                    Ok(json!(format!("hello {name}({idx})!")))
                }
                None => Err((CODE_INVALID_ARGS, "greet expects {\"name\": string}".to_string())),
            },
            other => Err((CODE_METHOD_NOT_FOUND, format!("method not found: {other}"))),
        };

        Some(match outcome {
            Ok(result) => json!({"id": request.id, "tag": request.tag, "result": result}),
            Err((code, message)) => json!({
                "id": request.id,
                "tag": request.tag,
                "error": {"code": code, "message": message},
            }),
        })
    }

    /// Serves requests as HTTP POST bodies, one response body per request.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        while let Ok((stream, peer)) = listener.accept().await {
            let this = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| this.clone().handle_http(req));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!("http connection {peer} closed: {e}");
                }
            });
        }
    }

    async fn handle_http(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let body = match req.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(e) => return Ok(status_response(StatusCode::BAD_REQUEST, e.to_string())),
        };
        Ok(match self.handle(&body) {
            Some(rsp) => Response::new(Full::new(Bytes::from(rsp.to_string()))),
            None => status_response(StatusCode::BAD_REQUEST, "invalid request".to_string()),
        })
    }

    /// Serves requests as WebSocket text frames, answered on the same
    /// connection.
    pub async fn serve_ws(self: Arc<Self>, listener: TcpListener) {
        while let Ok((stream, peer)) = listener.accept().await {
            tokio::spawn(self.clone().handle_ws(stream, peer));
        }
    }

    async fn handle_ws(self: Arc<Self>, stream: TcpStream, peer: std::net::SocketAddr) {
        let mut ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!("websocket handshake with {peer} failed: {e}");
                return;
            }
        };
        tracing::info!("websocket {peer} connected");

        while let Some(msg) = ws.next().await {
            let raw = match msg {
                Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("websocket {peer} read failed: {e}");
                    break;
                }
            };
            if let Some(rsp) = self.handle(&raw)
                && let Err(e) = ws.send(Message::Text(rsp.to_string().into())).await
            {
                tracing::debug!("websocket {peer} write failed: {e}");
                break;
            }
        }
        tracing::info!("websocket {peer} disconnected");
    }
}

fn status_response(status: StatusCode, msg: String) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(Bytes::from(msg)));
    *rsp.status_mut() = status;
    rsp
}
