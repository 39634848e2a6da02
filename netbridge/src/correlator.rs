//! Bridges the asynchronous tunnel with synchronous request/response HTTP.
//!
//! Each in-flight proxied request registers a waiter keyed by message id.
//! A per-id oneshot slot guarantees at-most-one delivery; a shared channel
//! would mis-deliver as soon as two requests were in flight.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::WaitError;
use crate::protocol::{HttpResponseEnvelope, Message};

type Slot = oneshot::Sender<Result<HttpResponseEnvelope, WaitError>>;

struct Waiter {
    slot: Slot,
    registered_at: Instant,
}

/// Maps outgoing request ids to single-delivery response slots.
#[derive(Default)]
pub struct Correlator {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl Correlator {
    pub fn new() -> Self {
        Correlator::default()
    }

    /// Insert a waiter for `id`. Dropping the returned future unresolved
    /// removes the waiter again, so an abandoned HTTP handler cannot leak.
    pub fn register(self: &Arc<Self>, id: impl Into<String>) -> ResponseFuture {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            slot: tx,
            registered_at: Instant::now(),
        };
        if let Some(stale) = self
            .waiters
            .lock()
            .expect("waiter lock poisoned")
            .insert(id.clone(), waiter)
        {
            // Ids are unique per session; a collision means the old request
            // can never be answered.
            let _ = stale.slot.send(Err(WaitError::Cancelled));
        }
        ResponseFuture {
            id,
            rx,
            correlator: Arc::clone(self),
            finished: false,
        }
    }

    /// Resolve the waiter for `id`. Returns false (and counts the event)
    /// when no waiter matches — an unsolicited or late response.
    pub fn deliver(&self, id: &str, envelope: HttpResponseEnvelope) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("waiter lock poisoned")
            .remove(id);
        match waiter {
            Some(waiter) => {
                debug!(
                    id,
                    waited_ms = waiter.registered_at.elapsed().as_millis() as u64,
                    status = envelope.status_code,
                    "response correlated"
                );
                let _ = waiter.slot.send(Ok(envelope));
                true
            }
            None => {
                counter!("netbridge_unmatched_responses").increment(1);
                debug!(id, "dropping response with no waiter");
                false
            }
        }
    }

    /// Fail the waiter for `id` with `cancelled`.
    pub fn cancel(&self, id: &str) {
        let waiter = self
            .waiters
            .lock()
            .expect("waiter lock poisoned")
            .remove(id);
        if let Some(waiter) = waiter {
            let _ = waiter.slot.send(Err(WaitError::Cancelled));
        }
    }

    /// Fail every outstanding waiter, e.g. when the session disconnects.
    pub fn fail_all(&self, error: WaitError) {
        let drained: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
            waiters.drain().map(|(_, waiter)| waiter).collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), %error, "failing outstanding waiters");
        }
        for waiter in drained {
            let _ = waiter.slot.send(Err(error));
        }
    }

    /// Number of in-flight waiters.
    pub fn pending(&self) -> usize {
        self.waiters.lock().expect("waiter lock poisoned").len()
    }

    fn discard(&self, id: &str) {
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .remove(id);
    }

    /// Consume the session's `response` subscription until it ends, then
    /// fail whatever is still outstanding. Payloads that do not decode are
    /// dropped; they must never take the session down.
    pub async fn dispatch(self: Arc<Self>, mut responses: mpsc::Receiver<Message>) {
        while let Some(message) = responses.recv().await {
            match serde_json::from_slice::<HttpResponseEnvelope>(&message.payload) {
                Ok(envelope) => {
                    self.deliver(&message.id, envelope);
                }
                Err(err) => {
                    warn!(id = %message.id, error = %err, "undecodable response envelope");
                }
            }
        }
        self.fail_all(WaitError::Disconnected);
    }
}

/// Resolves to the correlated response, or to how the wait ended.
pub struct ResponseFuture {
    id: String,
    rx: oneshot::Receiver<Result<HttpResponseEnvelope, WaitError>>,
    correlator: Arc<Correlator>,
    finished: bool,
}

impl Future for ResponseFuture {
    type Output = Result<HttpResponseEnvelope, WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                this.finished = true;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                // Slot dropped without a send: the correlator was torn down.
                this.finished = true;
                Poll::Ready(Err(WaitError::Disconnected))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.finished {
            self.correlator.discard(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;

    fn envelope(status_code: u16) -> HttpResponseEnvelope {
        HttpResponseEnvelope {
            status_code,
            headers: StdHashMap::new(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn deliver_resolves_the_matching_waiter() {
        let correlator = Arc::new(Correlator::new());
        let future = correlator.register("msg_1");
        assert!(correlator.deliver("msg_1", envelope(200)));
        assert_eq!(future.await.unwrap().status_code, 200);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn second_delivery_is_unmatched() {
        let correlator = Arc::new(Correlator::new());
        let future = correlator.register("msg_2");
        assert!(correlator.deliver("msg_2", envelope(200)));
        assert!(!correlator.deliver("msg_2", envelope(500)));
        assert_eq!(future.await.unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn cancel_fails_the_waiter() {
        let correlator = Arc::new(Correlator::new());
        let future = correlator.register("msg_3");
        correlator.cancel("msg_3");
        assert_eq!(future.await.unwrap_err(), WaitError::Cancelled);
    }

    #[tokio::test]
    async fn concurrent_deliver_and_cancel_resolve_exactly_once() {
        for _ in 0..100 {
            let correlator = Arc::new(Correlator::new());
            let future = correlator.register("msg_4");
            let deliver = {
                let correlator = correlator.clone();
                tokio::spawn(async move { correlator.deliver("msg_4", envelope(200)) })
            };
            let cancel = {
                let correlator = correlator.clone();
                tokio::spawn(async move { correlator.cancel("msg_4") })
            };
            let outcome = future.await;
            deliver.await.unwrap();
            cancel.await.unwrap();
            match outcome {
                Ok(env) => assert_eq!(env.status_code, 200),
                Err(err) => assert_eq!(err, WaitError::Cancelled),
            }
            assert_eq!(correlator.pending(), 0);
        }
    }

    #[tokio::test]
    async fn fail_all_resolves_everything_with_disconnected() {
        let correlator = Arc::new(Correlator::new());
        let first = correlator.register("msg_5");
        let second = correlator.register("msg_6");
        correlator.fail_all(WaitError::Disconnected);
        assert_eq!(first.await.unwrap_err(), WaitError::Disconnected);
        assert_eq!(second.await.unwrap_err(), WaitError::Disconnected);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn dropping_the_future_removes_the_waiter() {
        let correlator = Arc::new(Correlator::new());
        let future = correlator.register("msg_7");
        assert_eq!(correlator.pending(), 1);
        drop(future);
        assert_eq!(correlator.pending(), 0);
        assert!(!correlator.deliver("msg_7", envelope(200)));
    }

    #[tokio::test]
    async fn dispatch_delivers_and_fails_leftovers_on_close() {
        let correlator = Arc::new(Correlator::new());
        let answered = correlator.register("msg_8");
        let orphaned = correlator.register("msg_9");

        let (tx, rx) = mpsc::channel(4);
        let dispatch = tokio::spawn(correlator.clone().dispatch(rx));

        let payload = envelope(201).to_payload().unwrap();
        tx.send(Message {
            id: "msg_8".to_string(),
            topic: crate::protocol::Topic::Response,
            payload: payload.into(),
        })
        .await
        .unwrap();

        assert_eq!(answered.await.unwrap().status_code, 201);

        drop(tx); // session closed
        dispatch.await.unwrap();
        assert_eq!(orphaned.await.unwrap_err(), WaitError::Disconnected);
    }
}
