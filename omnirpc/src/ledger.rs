use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use foldhash::fast::RandomState;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    IncomingEnvelope, OutgoingPacket, RemoteError, Reply, RequestId,
    error::{Error, ErrorKind, Result},
};

/// One-shot completion for a single call.
///
/// The sender is taken on first use, so a second `complete` is a no-op that
/// reports `false`.
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<Reply>>,
}

impl Completion {
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn complete(&mut self, reply: Reply) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // the caller may have stopped listening, the resolution still counts.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }
}

/// A call that was sent and has not been resolved yet.
#[derive(Debug)]
pub struct PendingRequest {
    pub payload: OutgoingPacket,
    pub enqueued_at: Instant,
    pub completion: Completion,
}

/// Outstanding requests keyed by identity.
///
/// An entry is removed in the same step that completes it, so each call is
/// resolved at most once no matter which path (response, expiry, cleanup)
/// gets there first.
#[derive(Default)]
pub struct Ledger {
    pending: DashMap<RequestId, PendingRequest, RandomState>,
}

impl Ledger {
    /// Stores a pending request.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::DuplicateRequestId` if the identity is still
    /// outstanding. Identities are allocated from a counter, so this indicates
    /// a bug rather than a caller mistake.
    pub fn enqueue(
        &self,
        payload: OutgoingPacket,
        enqueued_at: Instant,
        completion: Completion,
    ) -> Result<()> {
        match self.pending.entry(payload.id) {
            Entry::Occupied(entry) => {
                tracing::error!("request id {} is already pending", entry.key());
                Err(Error::new(
                    ErrorKind::DuplicateRequestId,
                    format!("request id {} is already pending", entry.key()),
                ))
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingRequest {
                    payload,
                    enqueued_at,
                    completion,
                });
                Ok(())
            }
        }
    }

    /// Completes the request matching `id` with the envelope's outcome.
    ///
    /// Returns `false` when nothing is pending under that identity: a
    /// duplicate, a foreign id, or a response that lost the race against
    /// expiry.
    pub fn resolve(&self, id: RequestId, envelope: IncomingEnvelope) -> bool {
        let Some((_, mut request)) = self.pending.remove(&id) else {
            tracing::warn!("drop response for unknown request id {id}");
            return false;
        };
        request.completion.complete(envelope.into())
    }

    /// Fails every request when the transport is down, otherwise every request
    /// older than `timeout`. Returns the number of resolved requests.
    pub fn sweep_expired(&self, now: Instant, is_active: bool, timeout: Duration) -> usize {
        let mut resolved = 0;
        self.pending.retain(|id, request| {
            let error = if !is_active {
                RemoteError::unavailable()
            } else if now.saturating_duration_since(request.enqueued_at) >= timeout {
                RemoteError::timed_out()
            } else {
                return true;
            };
            tracing::debug!("expire request {id}: {error}");
            if request.completion.complete(Reply::error(error, None)) {
                resolved += 1;
            }
            false
        });
        resolved
    }

    /// Drops a pending request without completing it.
    pub fn remove(&self, id: RequestId) -> bool {
        self.pending.remove(&id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("pending", &self.pending.len())
            .finish()
    }
}
