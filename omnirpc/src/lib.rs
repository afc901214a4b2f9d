#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

pub mod packet;
pub use packet::{IncomingEnvelope, OutgoingPacket, RemoteError, Reply, RequestId};

mod ledger;
pub use ledger::{Completion, Ledger, PendingRequest};

mod receiver;
pub use receiver::{LedgerCleaner, ReplyReceiver};

mod task_supervisor;
pub use task_supervisor::TaskSupervisor;

mod sweeper;
pub use sweeper::{SWEEP_INTERVAL, Sweeper};

pub mod transport;
pub use transport::{
    HttpTransport, MqttTransport, Transport, TransportEvent, TransportOptions, TransportSink,
    WsTransport, create_transport,
};

mod client;
pub use client::{Client, ClientConfig, ClientEvent};
