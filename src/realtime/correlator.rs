//! Request correlation.
//!
//! Every correlated request gets a connection-unique id and a one-shot
//! completion slot. A slot completes exactly once: with the response, with a
//! timeout, or with the connection loss that drained it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::realtime::error::{RequestError, SendError, ServerError};
use crate::realtime::proto::{Release, ResponseBody, RtRequest};
use crate::realtime::state::ConnectionState;
use crate::realtime::transport::DisconnectInfo;

pub type RequestResult = Result<ResponseBody, RequestError>;

/// What the worker needs to know about a request when its response arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RequestDescriptor {
    pub kind: &'static str,
    pub release: Option<Release>,
}

impl RequestDescriptor {
    pub fn for_request(request: &RtRequest) -> Self {
        Self {
            kind: request.kind(),
            release: request.release(),
        }
    }
}

/// A request removed from the pending table, not yet completed.
pub(crate) struct PendingRequest {
    cid: u64,
    descriptor: RequestDescriptor,
    sink: oneshot::Sender<RequestResult>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    pub fn complete(mut self, result: RequestResult) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if self.sink.send(result).is_err() {
            tracing::trace!(event = "request_caller_gone", cid = self.cid);
        }
    }
}

struct Inner {
    next_id: u64,
    /// Current connection epoch; `None` while not accepting requests.
    epoch: Option<u64>,
    last_epoch: u64,
    pending: HashMap<u64, PendingRequest>,
}

/// Pending-request table shared by callers and the connection worker.
pub struct RequestCorrelator {
    inner: Mutex<Inner>,
}

impl RequestCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                epoch: None,
                last_epoch: 0,
                pending: HashMap::new(),
            }),
        })
    }

    /// Opens a new connection epoch and starts accepting requests.
    ///
    /// Ids restart at 1 when nothing from an earlier epoch is still pending.
    pub fn begin_epoch(&self) -> u64 {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            inner.next_id = 1;
        }
        inner.last_epoch = inner.last_epoch.wrapping_add(1);
        inner.epoch = Some(inner.last_epoch);
        inner.last_epoch
    }

    /// Epoch currently accepting requests.
    pub fn epoch(&self) -> Option<u64> {
        self.inner.lock().epoch
    }

    /// Registers a pending request and returns its id, epoch and handle.
    ///
    /// Fails without registering anything when no epoch is open.
    pub(crate) fn submit(
        self: &Arc<Self>,
        descriptor: RequestDescriptor,
        timeout: Option<Duration>,
        state: ConnectionState,
    ) -> Result<(u64, u64, ResponseHandle), SendError> {
        let (sink, rx) = oneshot::channel();
        let (cid, epoch) = {
            let mut inner = self.inner.lock();
            let Some(epoch) = inner.epoch else {
                return Err(match state {
                    ConnectionState::Closed => SendError::Closed,
                    ConnectionState::Connected => {
                        SendError::NotConnected(ConnectionState::Reconnecting)
                    }
                    other => SendError::NotConnected(other),
                });
            };
            let cid = allocate_id(&mut inner);
            inner.pending.insert(
                cid,
                PendingRequest {
                    cid,
                    descriptor,
                    sink,
                    timer: None,
                },
            );
            (cid, epoch)
        };

        if let Some(timeout) = timeout {
            let timer = spawn_deadline(Arc::downgrade(self), cid, timeout);
            let mut inner = self.inner.lock();
            match inner.pending.get_mut(&cid) {
                Some(entry) => entry.timer = Some(timer),
                None => timer.abort(),
            }
        }

        Ok((cid, epoch, ResponseHandle { cid, rx }))
    }

    /// Removes a pending request without completing it.
    pub(crate) fn take(&self, cid: u64) -> Option<PendingRequest> {
        self.inner.lock().pending.remove(&cid)
    }

    /// Completes the request `cid` with a server reply.
    ///
    /// Returns `false` when `cid` is unknown or already completed.
    pub fn resolve(&self, cid: u64, result: Result<ResponseBody, ServerError>) -> bool {
        match self.take(cid) {
            Some(pending) => {
                pending.complete(result.map_err(RequestError::Server));
                true
            }
            None => false,
        }
    }

    /// Drops a pending request whose frame never left the client.
    pub fn cancel(&self, cid: u64) -> bool {
        match self.take(cid) {
            Some(mut pending) => {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Fails the request `cid` with a timeout, if still pending.
    pub fn expire(&self, cid: u64, after: Duration) -> bool {
        let Some(mut pending) = self.take(cid) else {
            return false;
        };
        // Called from the deadline task itself; let it finish.
        drop(pending.timer.take());
        tracing::warn!(
            event = "request_timed_out",
            cid,
            kind = pending.descriptor.kind,
            after_ms = after.as_millis() as u64
        );
        pending.complete(Err(RequestError::Timeout { cid, after }));
        true
    }

    /// Closes the current epoch and fails every pending request.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self, info: &DisconnectInfo) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.inner.lock();
            inner.epoch = None;
            inner.pending.drain().map(|(_, pending)| pending).collect()
        };
        let count = drained.len();
        for pending in drained {
            pending.complete(Err(RequestError::ConnectionLost(info.clone())));
        }
        if count > 0 {
            tracing::info!(event = "pending_requests_failed", count, reason = ?info.reason);
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_pending(&self, cid: u64) -> bool {
        self.inner.lock().pending.contains_key(&cid)
    }
}

fn allocate_id(inner: &mut Inner) -> u64 {
    loop {
        let cid = inner.next_id;
        inner.next_id = match inner.next_id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        if !inner.pending.contains_key(&cid) {
            return cid;
        }
    }
}

fn spawn_deadline(
    correlator: Weak<RequestCorrelator>,
    cid: u64,
    after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(correlator) = correlator.upgrade() {
            correlator.expire(cid, after);
        }
    })
}

/// Caller side of a correlated request. Resolves to the request outcome.
#[derive(Debug)]
pub struct ResponseHandle {
    cid: u64,
    rx: oneshot::Receiver<RequestResult>,
}

impl ResponseHandle {
    pub fn cid(&self) -> u64 {
        self.cid
    }
}

impl Future for ResponseHandle {
    type Output = RequestResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(RequestError::ConnectionLost(DisconnectInfo::client_closed()))
            })
        })
    }
}
