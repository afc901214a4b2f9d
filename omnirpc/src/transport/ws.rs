use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, error::TrySendError},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};

use super::{Transport, TransportOptions, TransportSink};
use crate::{
    OutgoingPacket, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    packet::CODE_BAD_REQUEST,
};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WRITE_QUEUE_SIZE: usize = 1024;
const SEND_FAILED: &str = "Unable to send packet via WS.";

/// One persistent WebSocket connection, re-established `reconnect_period`
/// after every close.
pub struct WsTransport {
    url: String,
    reconnect_period: Duration,
    writer: Arc<Mutex<Option<mpsc::Sender<OutgoingPacket>>>>,
    sink: OnceLock<TransportSink>,
    task_supervisor: TaskSupervisor,
}

impl WsTransport {
    #[must_use]
    pub fn new(url: url::Url, options: &TransportOptions) -> Self {
        Self {
            url: url.into(),
            reconnect_period: options.reconnect_period,
            writer: Arc::default(),
            sink: OnceLock::new(),
            task_supervisor: TaskSupervisor::default(),
        }
    }

    /// Whether a connection is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.writer.lock().is_some()
    }

    async fn start_connect_loop(
        url: String,
        reconnect_period: Duration,
        writer: Arc<Mutex<Option<mpsc::Sender<OutgoingPacket>>>>,
        sink: TransportSink,
    ) {
        loop {
            sink.debug(format!("connecting to {url}"));
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    let (sender, receiver) = mpsc::channel(WRITE_QUEUE_SIZE);
                    *writer.lock() = Some(sender);
                    sink.open();

                    let (code, reason) = Self::serve(stream, receiver, &sink).await;
                    writer.lock().take();
                    tracing::info!("websocket {url} closed: {code:?} {reason}");
                    sink.close(code, reason);
                }
                Err(e) => {
                    sink.error(Error::new(ErrorKind::WebSocketConnectFailed, e.to_string()));
                    sink.close(None, e.to_string());
                }
            }

            if sink.is_closed() {
                return;
            }
            sink.debug(format!("reconnecting in {reconnect_period:?}"));
            tokio::time::sleep(reconnect_period).await;
        }
    }

    async fn serve(
        stream: Stream,
        mut receiver: mpsc::Receiver<OutgoingPacket>,
        sink: &TransportSink,
    ) -> (Option<u16>, String) {
        let (mut send_stream, mut recv_stream) = stream.split();

        let closed = loop {
            tokio::select! {
                msg = recv_stream.next() => {
                    if let Some(closed) = Self::handle_incoming(msg, sink) {
                        break closed;
                    }
                }
                Some(packet) = receiver.recv() => {
                    if let Err(e) = Self::write(&mut send_stream, &packet).await {
                        sink.error(e.clone());
                        sink.fail(&packet, CODE_BAD_REQUEST, SEND_FAILED);
                        break (None, e.msg);
                    }
                }
            }
        };

        // anything still queued will never reach this connection.
        receiver.close();
        while let Ok(packet) = receiver.try_recv() {
            sink.fail(&packet, CODE_BAD_REQUEST, SEND_FAILED);
        }
        closed
    }

    fn handle_incoming(
        msg: Option<std::result::Result<tungstenite::Message, tungstenite::Error>>,
        sink: &TransportSink,
    ) -> Option<(Option<u16>, String)> {
        match msg {
            Some(Ok(tungstenite::Message::Text(text))) => sink.deliver(text.as_bytes()),
            Some(Ok(tungstenite::Message::Binary(bytes))) => sink.deliver(&bytes),
            Some(Ok(tungstenite::Message::Close(frame))) => {
                return Some(match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                    None => (None, String::new()),
                });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                sink.error(Error::new(ErrorKind::WebSocketRecvFailed, e.to_string()));
                return Some((None, e.to_string()));
            }
            None => return Some((None, "connection closed".to_string())),
        }
        None
    }

    async fn write(
        send_stream: &mut SplitSink<Stream, tungstenite::Message>,
        packet: &OutgoingPacket,
    ) -> Result<()> {
        let text = serde_json::to_string(packet)?;
        send_stream
            .send(tungstenite::Message::Text(text.into()))
            .await
            .map_err(|e| Error::new(ErrorKind::WebSocketSendFailed, e.to_string()))
    }
}

impl Transport for WsTransport {
    fn start(&self, sink: TransportSink) {
        if self.sink.set(sink.clone()).is_err() {
            tracing::warn!("websocket transport already started");
            return;
        }
        self.task_supervisor.spawn(Self::start_connect_loop(
            self.url.clone(),
            self.reconnect_period,
            self.writer.clone(),
            sink,
        ));
    }

    fn send(&self, packet: OutgoingPacket) {
        let Some(sink) = self.sink.get() else {
            tracing::error!("websocket transport used before start, drop request {}", packet.id);
            return;
        };

        let writer = self.writer.lock().clone();
        let Some(writer) = writer else {
            sink.fail(&packet, CODE_BAD_REQUEST, SEND_FAILED);
            return;
        };
        if let Err(e) = writer.try_send(packet) {
            let (TrySendError::Full(packet) | TrySendError::Closed(packet)) = e;
            sink.fail(&packet, CODE_BAD_REQUEST, SEND_FAILED);
        }
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}
