// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IQ request/response correlation.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{trace, warn};
use tokio::sync::oneshot;

use crate::stanza::Iq;

type Callback = Box<dyn FnOnce(Iq) + Send>;

/// Matches IQ responses to pending requests by id.
///
/// Two modes coexist: rendezvous waiters for synchronous requests, and
/// one-shot callbacks for fire-and-forget requests. Arrived responses
/// transit through a third map so a response is handed to exactly one
/// consumer.
#[derive(Default)]
pub(crate) struct IqTracker {
    waiters: Mutex<HashMap<String, oneshot::Sender<Iq>>>,
    callbacks: Mutex<HashMap<String, Callback>>,
    responses: Mutex<HashMap<String, Iq>>,
}

impl IqTracker {
    /// Install a rendezvous for the request with the given id.
    pub(crate) fn register_waiter(&self, id: String) -> oneshot::Receiver<Iq> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, tx);
        rx
    }

    /// Install a completion callback for the request with the given id.
    pub(crate) fn register_callback(&self, id: String, callback: Callback) {
        self.callbacks.lock().unwrap().insert(id, callback);
    }

    /// Drop any pending state for the given id (timeout, failed send).
    pub(crate) fn remove(&self, id: &str) {
        self.waiters.lock().unwrap().remove(id);
        self.callbacks.lock().unwrap().remove(id);
        self.responses.lock().unwrap().remove(id);
    }

    /// Route an inbound response to its waiter or callback.
    pub(crate) fn handle_response(&self, iq: Iq) {
        let Some(id) = iq.id.clone() else {
            warn!("dropping iq response without id");
            return;
        };
        self.responses.lock().unwrap().insert(id.clone(), iq);

        if let Some(waiter) = self.waiters.lock().unwrap().remove(&id) {
            if let Some(response) = self.responses.lock().unwrap().remove(&id) {
                let _ = waiter.send(response);
            }
            return;
        }
        if let Some(callback) = self.callbacks.lock().unwrap().remove(&id) {
            if let Some(response) = self.responses.lock().unwrap().remove(&id) {
                // Callbacks run on a worker task, never on the reader.
                tokio::spawn(async move { callback(response) });
            }
            return;
        }
        self.responses.lock().unwrap().remove(&id);
        trace!("no pending request for iq response id {}", id);
    }

    /// Fail every pending request: waiters observe a closed rendezvous,
    /// callbacks are dropped without being invoked.
    pub(crate) fn fail_all(&self) {
        self.waiters.lock().unwrap().clear();
        self.callbacks.lock().unwrap().clear();
        self.responses.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn responses_len(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::IqKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn response(id: &str) -> Iq {
        Iq {
            id: Some(id.to_owned()),
            ..Iq::result(id, None)
        }
    }

    #[tokio::test]
    async fn waiter_receives_response() {
        let tracker = IqTracker::default();
        let rx = tracker.register_waiter("42".to_owned());
        tracker.handle_response(response("42"));
        let iq = rx.await.unwrap();
        assert_eq!(iq.kind, IqKind::Result);
        assert_eq!(tracker.responses_len(), 0);
    }

    #[tokio::test]
    async fn callbacks_fire_in_arrival_order_and_once() {
        let tracker = Arc::new(IqTracker::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in ["a", "b"] {
            let counter = counter.clone();
            let order = order.clone();
            tracker.register_callback(
                id.to_owned(),
                Box::new(move |iq| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    order.lock().unwrap().push((n, iq.id.unwrap()));
                }),
            );
        }

        // The server answers B first.
        tracker.handle_response(response("b"));
        tracker.handle_response(response("a"));
        // Duplicate response: no pending entry anymore, must be dropped.
        tracker.handle_response(response("b"));

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let order = order.lock().unwrap();
        assert_eq!(&*order, &[(0, "b".to_owned()), (1, "a".to_owned())]);
        assert_eq!(tracker.responses_len(), 0);
    }

    #[tokio::test]
    async fn fail_all_unblocks_waiters() {
        let tracker = IqTracker::default();
        let rx = tracker.register_waiter("1".to_owned());
        tracker.fail_all();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn removed_waiter_gets_nothing() {
        let tracker = IqTracker::default();
        let rx = tracker.register_waiter("7".to_owned());
        tracker.remove("7");
        tracker.handle_response(response("7"));
        assert!(rx.await.is_err());
        assert_eq!(tracker.responses_len(), 0);
    }
}
