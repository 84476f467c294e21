// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Application-facing events and their serialized delivery.
//!
//! Inbound stanzas and session notifications are queued into an inbox
//! channel; a dedicated task drains it and invokes the registered
//! callbacks one at a time, so the application observes events in exactly
//! the order the stream produced them.

use std::sync::{Arc, Mutex};

use log::{debug, trace};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::stanza::{Iq, Message, Presence};

/// An entry in the inbox FIFO.
#[derive(Debug)]
pub(crate) enum InboxEvent {
    /// An inbound IQ of kind get or set.
    IqRequest(Iq),
    /// An inbound message.
    Message(Message),
    /// An inbound presence.
    Presence(Presence),
    /// A background failure surfaced to the application.
    Error(Error),
    /// Stream management was enabled (or re-enabled after reconnect).
    SmEnabled,
    /// The stream was resumed without loss of state.
    StreamResumed,
}

type StanzaHandler<T> = Arc<dyn Fn(T) + Send + Sync>;
type UnitHandler = Arc<dyn Fn() + Send + Sync>;

/// Registered application callbacks, each invoked serially by the inbox
/// task.
#[derive(Default)]
pub(crate) struct Handlers {
    error: Mutex<Option<StanzaHandler<Error>>>,
    iq: Mutex<Option<StanzaHandler<Iq>>>,
    message: Mutex<Option<StanzaHandler<Message>>>,
    presence: Mutex<Option<StanzaHandler<Presence>>>,
    sm_enabled: Mutex<Option<UnitHandler>>,
    stream_resumed: Mutex<Option<UnitHandler>>,
}

impl Handlers {
    pub(crate) fn set_error(&self, f: impl Fn(Error) + Send + Sync + 'static) {
        *self.error.lock().unwrap() = Some(Arc::new(f));
    }

    pub(crate) fn set_iq(&self, f: impl Fn(Iq) + Send + Sync + 'static) {
        *self.iq.lock().unwrap() = Some(Arc::new(f));
    }

    pub(crate) fn set_message(&self, f: impl Fn(Message) + Send + Sync + 'static) {
        *self.message.lock().unwrap() = Some(Arc::new(f));
    }

    pub(crate) fn set_presence(&self, f: impl Fn(Presence) + Send + Sync + 'static) {
        *self.presence.lock().unwrap() = Some(Arc::new(f));
    }

    pub(crate) fn set_sm_enabled(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.sm_enabled.lock().unwrap() = Some(Arc::new(f));
    }

    pub(crate) fn set_stream_resumed(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.stream_resumed.lock().unwrap() = Some(Arc::new(f));
    }

    fn error(&self) -> Option<StanzaHandler<Error>> {
        self.error.lock().unwrap().clone()
    }

    fn iq(&self) -> Option<StanzaHandler<Iq>> {
        self.iq.lock().unwrap().clone()
    }

    fn message(&self) -> Option<StanzaHandler<Message>> {
        self.message.lock().unwrap().clone()
    }

    fn presence(&self) -> Option<StanzaHandler<Presence>> {
        self.presence.lock().unwrap().clone()
    }

    fn sm_enabled(&self) -> Option<UnitHandler> {
        self.sm_enabled.lock().unwrap().clone()
    }

    fn stream_resumed(&self) -> Option<UnitHandler> {
        self.stream_resumed.lock().unwrap().clone()
    }
}

/// Drain the inbox FIFO, invoking callbacks one at a time.
pub(crate) async fn run_inbox(handlers: Arc<Handlers>, mut rx: mpsc::Receiver<InboxEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            InboxEvent::IqRequest(iq) => match handlers.iq() {
                Some(handler) => handler(iq),
                None => debug!("no iq handler registered, dropping request {:?}", iq.id),
            },
            InboxEvent::Message(message) => match handlers.message() {
                Some(handler) => handler(message),
                None => trace!("no message handler registered"),
            },
            InboxEvent::Presence(presence) => match handlers.presence() {
                Some(handler) => handler(presence),
                None => trace!("no presence handler registered"),
            },
            InboxEvent::Error(error) => match handlers.error() {
                Some(handler) => handler(error),
                None => debug!("unhandled session error: {}", error),
            },
            InboxEvent::SmEnabled => {
                if let Some(handler) = handlers.sm_enabled() {
                    handler();
                }
            }
            InboxEvent::StreamResumed => {
                if let Some(handler) = handlers.stream_resumed() {
                    handler();
                }
            }
        }
    }
    trace!("inbox closed, dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn events_delivered_in_order() {
        let handlers = Arc::new(Handlers::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let order = order.clone();
            let counter = counter.clone();
            handlers.set_message(move |m| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push((n, m.payloads[0].text()));
            });
        }

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run_inbox(handlers, rx));

        for body in ["one", "two", "three"] {
            let msg = crate::stanza::Message::default().body(body);
            tx.send(InboxEvent::Message(msg)).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let order = order.lock().unwrap();
        assert_eq!(
            &*order,
            &[
                (0, "one".to_owned()),
                (1, "two".to_owned()),
                (2, "three".to_owned())
            ]
        );
    }
}
