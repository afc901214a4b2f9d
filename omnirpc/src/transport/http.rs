use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    StatusCode,
    client::conn::http1::{self, SendRequest},
    header,
};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::{net::TcpStream, sync::Mutex};

use super::{Transport, TransportSink};
use crate::{
    OutgoingPacket, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    packet::CODE_BAD_REQUEST,
};

/// Issues one HTTP POST per request.
///
/// HTTP has no connection state worth reporting, so the transport opens as
/// soon as it is started and never closes. Keep-alive connections are reused
/// across requests.
pub struct HttpTransport {
    connections: Arc<Connections>,
    sink: OnceLock<TransportSink>,
    task_supervisor: TaskSupervisor,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidAddress` when the URL has no host.
    pub fn new(url: url::Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidAddress, format!("missing host: {url}")))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let path = url[url::Position::BeforePath..].to_string();

        Ok(Self {
            connections: Arc::new(Connections {
                authority: format!("{host}:{port}"),
                host,
                port,
                path,
                idle: Mutex::default(),
            }),
            sink: OnceLock::new(),
            task_supervisor: TaskSupervisor::default(),
        })
    }

    fn handle_response(sink: &TransportSink, packet: &OutgoingPacket, status: StatusCode, body: &[u8]) {
        if status != StatusCode::OK {
            let code = status.as_u16();
            sink.fail(packet, i64::from(code), &format!("Unexpected http code {code}"));
            return;
        }

        match serde_json::from_slice::<Value>(body) {
            Ok(value @ Value::Object(_)) => sink.deliver_value(value),
            _ => sink.fail(
                packet,
                CODE_BAD_REQUEST,
                "The server returned invalid JSON string.",
            ),
        }
    }
}

impl Transport for HttpTransport {
    fn start(&self, sink: TransportSink) {
        if self.sink.set(sink.clone()).is_err() {
            tracing::warn!("http transport already started");
            return;
        }
        sink.debug(format!(
            "http transport ready for {}",
            self.connections.authority
        ));
        sink.open();
    }

    fn send(&self, packet: OutgoingPacket) {
        let Some(sink) = self.sink.get().cloned() else {
            tracing::error!("http transport used before start, drop request {}", packet.id);
            return;
        };

        let body = match serde_json::to_vec(&packet) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                sink.fail(&packet, CODE_BAD_REQUEST, &e.to_string());
                return;
            }
        };

        let connections = self.connections.clone();
        self.task_supervisor.spawn(async move {
            match connections.post(body).await {
                Ok((status, body)) => Self::handle_response(&sink, &packet, status, &body),
                Err(err) => {
                    sink.error(err.clone());
                    sink.fail(&packet, CODE_BAD_REQUEST, &err.msg);
                }
            }
        });
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("authority", &self.connections.authority)
            .field("path", &self.connections.path)
            .finish()
    }
}

#[derive(Debug)]
struct Connections {
    host: String,
    port: u16,
    authority: String,
    path: String,
    idle: Mutex<Vec<SendRequest<Full<Bytes>>>>,
}

impl Connections {
    async fn post(&self, body: Bytes) -> Result<(StatusCode, Bytes)> {
        // 1. acquire connection.
        let mut sender = match self.acquire().await {
            Some(sender) => sender,
            None => self.connect().await?,
        };
        sender
            .ready()
            .await
            .map_err(|e| Error::new(ErrorKind::HttpSendReqFailed, e.to_string()))?;

        // 2. build request.
        let req = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.path)
            .header(header::HOST, &self.authority)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| Error::new(ErrorKind::HttpBuildReqFailed, e.to_string()))?;

        // 3. send request.
        let rsp = sender
            .send_request(req)
            .await
            .map_err(|e| Error::new(ErrorKind::HttpSendReqFailed, e.to_string()))?;
        let status = rsp.status();

        // 4. collect body bytes.
        let body = rsp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::new(ErrorKind::HttpWaitRspFailed, e.to_string()))?
            .to_bytes();

        // 5. restore connection.
        self.idle.lock().await.push(sender);

        Ok((status, body))
    }

    async fn acquire(&self) -> Option<SendRequest<Full<Bytes>>> {
        let mut idle = self.idle.lock().await;
        while let Some(sender) = idle.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    async fn connect(&self) -> Result<SendRequest<Full<Bytes>>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::new(ErrorKind::HttpConnectFailed, e.to_string()))?;

        let (sender, conn) = http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| Error::new(ErrorKind::HttpConnectFailed, e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("http connection closed: {e}");
            }
        });

        Ok(sender)
    }
}
