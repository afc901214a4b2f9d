use std::sync::{Arc, Weak};

use tokio::sync::oneshot;

use crate::{Ledger, RemoteError, Reply, RequestId};

/// Removes a pending request from the ledger when its receiver is dropped
/// before the reply came in.
pub struct LedgerCleaner {
    ledger: Option<Weak<Ledger>>,
    id: RequestId,
}

impl LedgerCleaner {
    fn disarm(mut self) {
        self.ledger = None;
    }
}

impl Drop for LedgerCleaner {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take().and_then(|ledger| ledger.upgrade())
            && ledger.remove(self.id)
        {
            tracing::debug!("request {} abandoned by its caller", self.id);
        }
    }
}

/// The caller's side of one call.
pub enum ReplyReceiver {
    /// Resolved without being sent, e.g. rejected because the transport is down.
    Ready(Reply),
    /// Waiting for a response, a transport failure or expiry.
    Pending(oneshot::Receiver<Reply>, LedgerCleaner),
}

impl ReplyReceiver {
    pub(crate) fn pending(rx: oneshot::Receiver<Reply>, ledger: &Arc<Ledger>, id: RequestId) -> Self {
        ReplyReceiver::Pending(
            rx,
            LedgerCleaner {
                ledger: Some(Arc::downgrade(ledger)),
                id,
            },
        )
    }

    /// Identity of the request, `None` when it was never enqueued.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ReplyReceiver::Ready(_) => None,
            ReplyReceiver::Pending(_, cleaner) => Some(cleaner.id),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, ReplyReceiver::Ready(_))
    }

    /// Waits for the reply of this call.
    pub async fn recv(self) -> Reply {
        match self {
            ReplyReceiver::Ready(reply) => reply,
            ReplyReceiver::Pending(rx, cleaner) => {
                let reply = rx.await.unwrap_or_else(|_| {
                    // the ledger went away together with its client.
                    Reply::error(RemoteError::unavailable(), None)
                });
                // resolved entries are already gone from the ledger.
                cleaner.disarm();
                reply
            }
        }
    }
}

impl std::fmt::Debug for ReplyReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyReceiver::Ready(reply) => f.debug_tuple("Ready").field(reply).finish(),
            ReplyReceiver::Pending(_, cleaner) => {
                f.debug_tuple("Pending").field(&cleaner.id).finish()
            }
        }
    }
}
