//! Byte transports behind a uniform contract.
//!
//! A transport is started once with a [`TransportSink`] and from then on
//! reports its lifecycle (`open`, `close`, `error`, `debug`) and every response
//! it receives through that sink. Requests are handed over with
//! [`Transport::send`]; a packet that cannot be dispatched is answered locally
//! with an error envelope instead of a returned error.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    IncomingEnvelope, OutgoingPacket,
    error::{Error, ErrorKind, Result},
    packet::{compose_local_error, parse_envelope, validate_envelope},
};

mod http;
pub use http::HttpTransport;

mod mqtt;
pub use mqtt::MqttTransport;

mod ws;
pub use ws::WsTransport;

/// Schemes understood by [`create_transport`].
pub const SUPPORTED_SCHEMES: [&str; 3] = ["http", "ws", "mqtt"];

/// A byte transport the client can issue requests over.
pub trait Transport: Send + Sync + 'static {
    /// Begins connecting and binds the sink all signals are reported to.
    /// Called exactly once by the owning client.
    fn start(&self, sink: TransportSink);

    /// Hands a request to the wire. Failures to dispatch are reported through
    /// [`TransportSink::fail`], never returned.
    fn send(&self, packet: OutgoingPacket);
}

/// Signals emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Close { code: Option<u16>, reason: String },
    Error(Error),
    Debug(String),
    Response(IncomingEnvelope),
}

/// The transport's handle back into its client.
#[derive(Clone, Debug)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    debug: bool,
}

impl TransportSink {
    #[must_use]
    pub fn new(debug: bool) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, debug }, rx)
    }

    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn close(&self, code: Option<u16>, reason: impl Into<String>) {
        self.emit(TransportEvent::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn error(&self, error: Error) {
        tracing::error!("transport error: {error}");
        self.emit(TransportEvent::Error(error));
    }

    /// Emits a diagnostic, only when the transport was configured with `debug`.
    pub fn debug(&self, info: impl Into<String>) {
        if self.debug {
            self.emit(TransportEvent::Debug(info.into()));
        }
    }

    /// Parses a received payload and dispatches it. Unparseable or malformed
    /// payloads become an `error` signal and are otherwise dropped.
    pub fn deliver(&self, bytes: &[u8]) {
        match parse_envelope(bytes) {
            Ok(envelope) => self.emit(TransportEvent::Response(envelope)),
            Err(err) => self.error(err),
        }
    }

    /// Like [`deliver`](Self::deliver) for an already decoded payload.
    pub fn deliver_value(&self, value: Value) {
        match validate_envelope(value) {
            Ok(envelope) => self.emit(TransportEvent::Response(envelope)),
            Err(err) => self.error(err),
        }
    }

    /// Resolves `packet` locally with an error envelope, as if the remote end
    /// had answered with `code` and `message`.
    pub fn fail(&self, packet: &OutgoingPacket, code: i64, message: &str) {
        tracing::warn!("request {} failed locally: {code} {message}", packet.id);
        self.deliver_value(compose_local_error(packet, code, message));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn emit(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("transport sink closed, event dropped");
        }
    }
}

/// Transport specific settings.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct TransportOptions {
    /// Delay before reconnecting after a close (WebSocket, MQTT).
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub reconnect_period: Duration,
    /// MQTT client identifier, a random UUID when unset.
    #[serde_inline_default(None)]
    pub client_id: Option<String>,
    /// MQTT keep-alive interval.
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Builds the transport matching the scheme of `address`.
///
/// # Errors
///
/// Returns `ErrorKind::InvalidAddress` when the address does not parse and
/// `ErrorKind::UnsupportedScheme` for schemes other than `http`, `ws` and
/// `mqtt`.
pub fn create_transport(
    address: &str,
    options: &TransportOptions,
) -> Result<Arc<dyn Transport>> {
    let url = url::Url::parse(address)?;
    match url.scheme() {
        "http" => Ok(Arc::new(HttpTransport::new(url)?)),
        "ws" => Ok(Arc::new(WsTransport::new(url, options))),
        "mqtt" => Ok(Arc::new(MqttTransport::new(&url, options)?)),
        other => Err(Error::new(
            ErrorKind::UnsupportedScheme,
            format!(
                "Unrecognized protocol [{other}]. Supported protocols: {}",
                SUPPORTED_SCHEMES.join(", ")
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RemoteError, RequestId, packet::build_request};
    use serde_json::json;

    #[test]
    fn test_default_options() {
        let options = TransportOptions::default();
        assert_eq!(options.reconnect_period, Duration::from_secs(10));
        assert_eq!(options.client_id, None);

        let options: TransportOptions =
            serde_json::from_value(json!({"reconnect_period": "250ms", "client_id": "dev-1"}))
                .unwrap();
        assert_eq!(options.reconnect_period, Duration::from_millis(250));
        assert_eq!(options.client_id.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn test_create_transport() {
        let options = TransportOptions::default();
        assert!(create_transport("http://127.0.0.1:8000/rpc", &options).is_ok());
        assert!(create_transport("ws://127.0.0.1:8000", &options).is_ok());
        assert!(create_transport("MQTT://127.0.0.1/device", &options).is_ok());

        let err = create_transport("ftp://127.0.0.1", &options).err().unwrap();
        assert_eq!(err.kind, ErrorKind::UnsupportedScheme);
        assert_eq!(
            err.msg,
            "Unrecognized protocol [ftp]. Supported protocols: http, ws, mqtt"
        );

        let err = create_transport("no scheme here", &options).err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidAddress);
    }

    #[test]
    fn test_sink() {
        let (sink, mut rx) = TransportSink::new(false);
        sink.open();
        sink.debug("hidden");
        sink.deliver(br#"{"id": 1, "result": true}"#);
        sink.deliver(b"garbage");
        sink.close(Some(1000), "bye");

        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Open);
        let TransportEvent::Response(envelope) = rx.try_recv().unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(envelope.id, Some(RequestId(1)));
        let TransportEvent::Error(err) = rx.try_recv().unwrap() else {
            panic!("expected an error");
        };
        assert_eq!(err.kind, ErrorKind::ParseFailed);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Close {
                code: Some(1000),
                reason: "bye".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sink_fail() {
        let (sink, mut rx) = TransportSink::new(true);
        sink.debug("visible");
        let packet = build_request("m", json!({}), "t", RequestId(2));
        sink.fail(&packet, 400, "Unable to send packet via WS.");

        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Debug("visible".into()));
        let TransportEvent::Response(envelope) = rx.try_recv().unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(envelope.id, Some(RequestId(2)));
        assert_eq!(envelope.tag.as_deref(), Some("t"));
        assert_eq!(
            envelope.outcome,
            Err(RemoteError::new(400, "Unable to send packet via WS."))
        );
    }
}
