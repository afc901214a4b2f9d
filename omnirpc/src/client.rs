use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::Instant,
};
use tokio_util::sync::DropGuard;

use crate::{
    Completion, Ledger, RemoteError, Reply, ReplyReceiver, RequestId, Sweeper, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    packet::{CODE_BAD_REQUEST, build_request},
    transport::{Transport, TransportEvent, TransportOptions, TransportSink, create_transport},
};

const EVENT_CAPACITY: usize = 256;

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Deadline of a single call, checked once per sweep interval.
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Endpoint URL, mutually exclusive with a pre-built transport.
    #[serde_inline_default(None)]
    pub address: Option<String>,
    #[serde(default)]
    pub transport_options: TransportOptions,
    #[serde_inline_default(false)]
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Lifecycle notifications of a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Open,
    Close { code: Option<u16>, reason: String },
    /// Follows `Open` for every open after the first close.
    Reconnect,
    Error(Error),
    Debug(String),
}

/// Request/response correlation over one transport.
///
/// Each call gets a fresh identity, is recorded in the ledger and handed to
/// the transport. The matching response, a transport failure or the expiry
/// sweep resolves it exactly once.
///
/// Dropping the client stops its background tasks; calls still pending then
/// resolve with code 503.
pub struct Client {
    inner: Arc<ClientInner>,
    _drop_guard: DropGuard,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    ledger: Arc<Ledger>,
    next_id: AtomicU32,
    active: watch::Sender<bool>,
    first_connect: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
    sweeper: Arc<Sweeper>,
    task_supervisor: TaskSupervisor,
}

impl Client {
    /// Builds a client over `transport`, or over a transport created from
    /// `config.address`. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidConfig` unless exactly one of address and
    /// transport is given, and the errors of [`create_transport`] for a bad
    /// address.
    pub fn create(config: &ClientConfig, transport: Option<Arc<dyn Transport>>) -> Result<Self> {
        let transport = match (&config.address, transport) {
            (Some(_), Some(_)) => {
                return Err(Error::new(
                    ErrorKind::InvalidConfig,
                    "Address and Transport cannot be specified simultaneously.",
                ));
            }
            (None, None) => {
                return Err(Error::new(
                    ErrorKind::InvalidConfig,
                    "You must specify Address OR Transport options.",
                ));
            }
            (Some(address), None) => create_transport(address, &config.transport_options)?,
            (None, Some(transport)) => transport,
        };

        let ledger = Arc::new(Ledger::default());
        let (active, active_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sweeper = Arc::new(Sweeper::new(ledger.clone(), active_rx, config.timeout));
        let task_supervisor = TaskSupervisor::default();
        let drop_guard = task_supervisor.drop_guard();

        let inner = Arc::new(ClientInner {
            config: config.clone(),
            transport,
            ledger,
            next_id: AtomicU32::new(u32::from(rand::random::<u16>())),
            active,
            first_connect: AtomicBool::new(true),
            events,
            sweeper,
            task_supervisor,
        });

        let (sink, rx) = TransportSink::new(config.debug);
        inner
            .task_supervisor
            .spawn(ClientInner::start_event_loop(inner.clone(), rx));
        inner.transport.start(sink);

        Ok(Self {
            inner,
            _drop_guard: drop_guard,
        })
    }

    /// Issues a call.
    ///
    /// When the transport is not active the returned receiver is already
    /// resolved with code 400 and nothing is sent.
    pub fn call(&self, method: &str, args: Value, tag: &str) -> ReplyReceiver {
        let inner = &self.inner;
        if !inner.is_active() {
            inner.debug(format!("reject call {method}: transport is not active"));
            return ReplyReceiver::Ready(Reply::error(RemoteError::inactive(), None));
        }

        let id = RequestId(
            inner
                .next_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1),
        );
        let packet = build_request(method, args, tag, id);

        let (completion, rx) = Completion::channel();
        if let Err(e) = inner
            .ledger
            .enqueue(packet.clone(), Instant::now(), completion)
        {
            inner.emit(ClientEvent::Error(e));
            return ReplyReceiver::Ready(Reply::error(
                RemoteError::new(CODE_BAD_REQUEST, "Request identity already in use."),
                Some(packet.tag).filter(|tag| !tag.is_empty()),
            ));
        }
        let receiver = ReplyReceiver::pending(rx, &inner.ledger, id);

        inner.sweeper.ensure_running(&inner.task_supervisor);
        inner.debug(format!("send request {id}: {method}"));
        inner.transport.send(packet);
        receiver
    }

    /// Callback form of [`call`](Self::call). `handler` runs exactly once:
    /// inline for an immediate rejection, otherwise on a spawned task.
    pub fn call_with<F>(&self, method: &str, args: Value, tag: &str, handler: F)
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        match self.call(method, args, tag) {
            ReplyReceiver::Ready(reply) => handler(reply),
            receiver => {
                tokio::spawn(async move { handler(receiver.recv().await) });
            }
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Whether the transport has closed at least once.
    #[must_use]
    pub fn is_reconnect(&self) -> bool {
        !self.inner.first_connect.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.ledger.len()
    }

    /// Resolves as soon as the transport is open.
    pub async fn wait_until_active(&self) {
        let mut active = self.inner.active.subscribe();
        // the sender lives as long as `self`.
        let _ = active.wait_for(|active| *active).await;
    }

    /// Subscribes to lifecycle notifications emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("active", &self.is_active())
            .field("pending", &self.pending_count())
            .field("sweeper", &self.inner.sweeper)
            .finish()
    }
}

impl ClientInner {
    fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    fn emit(&self, event: ClientEvent) {
        // no subscribers is fine.
        let _ = self.events.send(event);
    }

    fn debug(&self, info: String) {
        tracing::debug!("{info}");
        if self.config.debug {
            self.emit(ClientEvent::Debug(info));
        }
    }

    async fn start_event_loop(this: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            this.handle_event(event);
        }
        tracing::debug!("transport sink dropped, event loop exits");
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.active.send_replace(true);
                tracing::info!("transport open");
                self.emit(ClientEvent::Open);
                if !self.first_connect.load(Ordering::Acquire) {
                    self.emit(ClientEvent::Reconnect);
                }
            }
            TransportEvent::Close { code, reason } => {
                self.active.send_replace(false);
                self.first_connect.store(false, Ordering::Release);
                tracing::info!("transport closed: {code:?} {reason}");
                // fail whatever was sent just before the connection dropped.
                self.sweeper.ensure_running(&self.task_supervisor);
                self.emit(ClientEvent::Close { code, reason });
            }
            TransportEvent::Error(error) => self.emit(ClientEvent::Error(error)),
            TransportEvent::Debug(info) => self.emit(ClientEvent::Debug(info)),
            TransportEvent::Response(envelope) => {
                let Some(id) = envelope.id else {
                    self.debug("drop response without a usable id".to_string());
                    return;
                };
                if self.ledger.resolve(id, envelope) {
                    self.debug(format!("request {id} resolved"));
                    self.sweeper.stop_if_idle();
                }
            }
        }
    }
}
