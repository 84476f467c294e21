// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The post-negotiation read loop: routes inbound elements to the IQ
//! correlator, the application inbox or the stream-management engine.

use std::sync::Weak;

use futures::StreamExt;
use log::{debug, trace, warn};

use crate::client::{alive, Inner};
use crate::element::Element;
use crate::error::{Error, ProtocolError};
use crate::event::InboxEvent;
use crate::ns;
use crate::stanza::Stanza;
use crate::xmlstream::{Packet, StreamReader};

/// Read frames until the stream dies, then run the teardown protocol.
///
/// The task holds the session only weakly so that dropping the last
/// [`Client`][crate::Client] handle tears the connection down.
pub(crate) async fn run_reader(weak: Weak<Inner>, mut reader: StreamReader, generation: u64) {
    let error = loop {
        match reader.next().await {
            Some(Ok(Packet::Stanza(el))) => {
                let Some(inner) = alive(&weak) else { return };
                match inner.dispatch_element(el).await {
                    Ok(()) => (),
                    Err(e) => break e,
                }
            }
            Some(Ok(Packet::Text(_))) => trace!("ignoring inter-stanza text"),
            Some(Ok(Packet::StreamStart(_))) => {
                break ProtocolError::UnexpectedElement("stream:stream".to_owned()).into()
            }
            Some(Ok(Packet::StreamEnd)) => break Error::Disconnected,
            Some(Err(e)) => break e,
            None => break Error::Disconnected,
        }
    };
    let Some(inner) = alive(&weak) else { return };
    inner.handle_stream_drop(generation, error).await;
}

impl Inner {
    /// Route one top-level element. An `Err` is fatal for the stream.
    pub(crate) async fn dispatch_element(&self, el: Element) -> Result<(), Error> {
        if el.ns() == Some(ns::SM) {
            return self.dispatch_sm(el).await;
        }
        match el.name() {
            "iq" | "message" | "presence" => self.dispatch_stanza(el).await,
            "error" => {
                let condition = el
                    .children()
                    .next()
                    .map(|child| child.name().to_owned())
                    .unwrap_or_else(|| "undefined-condition".to_owned());
                warn!("received stream error: {}", condition);
                Err(ProtocolError::StreamError(condition).into())
            }
            other => {
                debug!("ignoring unsupported element <{}>", other);
                Ok(())
            }
        }
    }

    async fn dispatch_stanza(&self, el: Element) -> Result<(), Error> {
        let stanza = match Stanza::from_element(&el) {
            Ok(stanza) => stanza,
            Err(e) => {
                warn!("failed to parse inbound stanza: {}", e);
                self.emit(InboxEvent::Error(e.into())).await;
                return Ok(());
            }
        };
        {
            let mut sm = self.sm.lock().unwrap();
            if sm.enabled {
                sm.inbound_seq = sm.inbound_seq.wrapping_add(1);
            }
        }
        match stanza {
            Stanza::Iq(iq) => {
                if iq.is_request() {
                    self.emit(InboxEvent::IqRequest(iq)).await;
                } else {
                    self.iq.handle_response(iq);
                }
            }
            Stanza::Message(message) => self.emit(InboxEvent::Message(message)).await,
            Stanza::Presence(presence) => self.emit(InboxEvent::Presence(presence)).await,
        }
        Ok(())
    }

    async fn dispatch_sm(&self, el: Element) -> Result<(), Error> {
        match el.name() {
            "r" => {
                let h = self.sm.lock().unwrap().inbound_seq;
                let ack = Element::builder("a", ns::SM).attr("h", h).build();
                if let Err(e) = self.send_nonza(&ack).await {
                    debug!("failed to answer <r/>: {}", e);
                }
                Ok(())
            }
            "a" => {
                let h = parse_h(&el)?;
                let result = self.sm.lock().unwrap().remote_acked(h);
                result.map_err(Error::Sm)
            }
            "enabled" => self.handle_enabled(&el).await,
            "resumed" => {
                // Resumption replies are consumed by the engine while it
                // owns the parser; one here means the peer is confused.
                warn!("ignoring unexpected <resumed/> on an active stream");
                Ok(())
            }
            "failed" => {
                self.handle_enable_failed(&el).await;
                Ok(())
            }
            other => Err(ProtocolError::InvalidSmFrame(format!("<{}>", other)).into()),
        }
    }

    /// Read error teardown: cancel IQ waiters, mark disconnected, surface
    /// the cause, and leave recovery to the stream-management tick.
    pub(crate) async fn handle_stream_drop(&self, generation: u64, error: Error) {
        use core::sync::atomic::Ordering;
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!("stale reader exiting quietly");
            return;
        }
        if self.is_closed() {
            return;
        }
        debug!("stream dropped: {}", error);
        self.mark_disconnected();
        self.iq.fail_all();
        self.emit(InboxEvent::Error(error)).await;
    }
}

pub(crate) fn parse_h(el: &Element) -> Result<u32, ProtocolError> {
    el.attr("h")
        .ok_or_else(|| ProtocolError::InvalidSmFrame("missing h attribute".to_owned()))?
        .parse()
        .map_err(|_| ProtocolError::InvalidSmFrame("unparseable h attribute".to_owned()))
}
