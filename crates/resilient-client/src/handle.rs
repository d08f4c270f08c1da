//! Caller-side request handles
//!
//! A submitted request is settled exactly once, either by its result or by
//! cancellation, whichever happens first. `Responder` is the settling side; it
//! travels with the request through retries and the offline queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::Response;
use crate::error::{Error, Result};
use crate::queue::RequestQueue;

/// Settling side of a request.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Result<Response>>,
    settled: Arc<AtomicBool>,
}

impl Responder {
    /// Deliver the final result. A caller that stopped waiting is not an error.
    pub fn send(self, result: Result<Response>) {
        self.settled.store(true, Ordering::SeqCst);
        let _ = self.tx.send(result);
    }
}

/// Cancels one request. Cheap to clone and usable from another task while the
/// owner awaits `RequestHandle::response`.
#[derive(Debug, Clone)]
pub struct Canceller {
    id: Uuid,
    token: CancellationToken,
    settled: Arc<AtomicBool>,
    queue: Arc<RequestQueue>,
}

impl Canceller {
    /// Cancel the request. Returns `false` if it was already cancelled or
    /// already settled; only the first effective call returns `true`.
    pub fn cancel(&self) -> bool {
        if self.settled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        if self.queue.cancel(self.id) {
            debug!(request_id = %self.id, "cancelled request removed from offline queue");
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Caller's view of a submitted request.
#[derive(Debug)]
pub struct RequestHandle {
    id: Uuid,
    canceller: Canceller,
    rx: oneshot::Receiver<Result<Response>>,
}

impl RequestHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Wait for the request to settle.
    pub async fn response(mut self) -> Result<Response> {
        let token = self.canceller.token.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = &mut self.rx => result.unwrap_or_else(|_| {
                Err(Error::Unknown("request task ended without a result".into()))
            }),
        }
    }
}

/// Create the handle, its responder and the token the executor observes.
pub(crate) fn request_channel(
    id: Uuid,
    queue: Arc<RequestQueue>,
) -> (RequestHandle, Responder, CancellationToken) {
    let (tx, rx) = oneshot::channel();
    let token = CancellationToken::new();
    let settled = Arc::new(AtomicBool::new(false));
    let handle = RequestHandle {
        id,
        canceller: Canceller {
            id,
            token: token.clone(),
            settled: settled.clone(),
            queue,
        },
        rx,
    };
    (handle, Responder { tx, settled }, token)
}
