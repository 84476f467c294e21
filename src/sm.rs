// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0198 Stream Management: counters, acknowledgements, resumption
//! and the reconnect state machine.
//!
//! All recovery is driven by a single periodic tick, so at most one
//! resumption or reconnect attempt is ever in flight:
//!
//! ```text
//! Idle ──silence / transport loss──► Resuming ──<resumed/>──► Idle
//! Resuming ──budget exhausted──► Reconnecting ──bind+enable──► Idle
//! Reconnecting ──budget exhausted──► Failed (terminal)
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, warn};
use tokio::time::MissedTickBehavior;

use crate::client::dispatch::parse_h;
use crate::client::{alive, establish, install_stream, login, write_all, Inner};
use crate::element::Element;
use crate::error::{Error, SmError};
use crate::event::InboxEvent;
use crate::ns;
use crate::stanza::Stanza;

// Counters wrap mod 2^32; a queue at half the number space would make
// ack arithmetic ambiguous (RFC 1982), so cap well below it.
const MAX_QUEUE_SIZE: usize = (u32::MAX / 2 - 1) as usize;

/// Per-session stream-management state.
///
/// Invariant at every quiescent point:
/// `replay_cache.len() == outbound_seq - last_server_ack` (mod 2^32).
#[derive(Debug)]
pub(crate) struct SmState {
    pub(crate) enabled: bool,
    pub(crate) resumption_requested: bool,
    pub(crate) resumption_enabled: bool,
    pub(crate) resumption_id: Option<String>,
    pub(crate) max_resume_seconds: u32,
    pub(crate) outbound_seq: u32,
    pub(crate) inbound_seq: u32,
    pub(crate) last_server_ack: u32,
    pub(crate) last_server_ack_time: Instant,
    pub(crate) replay_cache: VecDeque<Stanza>,
    pub(crate) pending_resume_h: Option<u32>,
}

impl Default for SmState {
    fn default() -> Self {
        SmState {
            enabled: false,
            resumption_requested: false,
            resumption_enabled: false,
            resumption_id: None,
            max_resume_seconds: 0,
            outbound_seq: 0,
            inbound_seq: 0,
            last_server_ack: 0,
            last_server_ack_time: Instant::now(),
            replay_cache: VecDeque::new(),
            pending_resume_h: None,
        }
    }
}

impl SmState {
    pub(crate) fn touch(&mut self) {
        self.last_server_ack_time = Instant::now();
    }

    /// Count a stanza as sent and keep it until the server acks it.
    pub(crate) fn record_sent(&mut self, stanza: &Stanza) {
        if self.replay_cache.len() >= MAX_QUEUE_SIZE {
            panic!("too many unacknowledged stanzas");
        }
        self.replay_cache.push_back(stanza.clone());
        self.outbound_seq = self.outbound_seq.wrapping_add(1);
    }

    /// Process a remote `h` value: trim acked stanzas off the cache front.
    pub(crate) fn remote_acked(&mut self, h: u32) -> Result<(), SmError> {
        let to_drop = h.wrapping_sub(self.last_server_ack) as usize;
        if to_drop == 0 {
            self.touch();
            return Ok(());
        }
        if to_drop > self.replay_cache.len() {
            // A wrapping difference above half the number space is a
            // negative difference in RFC 1982 terms: h went backwards.
            return Err(SmError::AckOutOfRange {
                h,
                outbound_seq: self.outbound_seq,
            });
        }
        self.replay_cache.drain(..to_drop);
        self.last_server_ack = h;
        self.touch();
        debug!("server acked {} stanzas, {} pending", to_drop, self.replay_cache.len());
        Ok(())
    }

    /// The unacked stanzas, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<Stanza> {
        self.replay_cache.iter().cloned().collect()
    }
}

/// Recovery phase of the reconnect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    Idle,
    Resuming { attempts: u32 },
    Reconnecting { attempts: u32 },
    Failed,
}

fn r_element() -> Element {
    Element::builder("r", ns::SM).build()
}

fn enable_element(resume: bool, max: u32) -> Element {
    Element::builder("enable", ns::SM)
        .attr("resume", resume)
        .attr("max", max)
        .build()
}

/// Periodic maintenance: ack requests, drop detection, recovery driving.
pub(crate) async fn run_tick(weak: Weak<Inner>) {
    let period = match alive(&weak) {
        Some(inner) => inner.config.timeouts.tick,
        None => return,
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = alive(&weak) else { return };
        if inner.is_closed() {
            continue;
        }
        tick_once(&inner).await;
    }
}

async fn tick_once(inner: &Arc<Inner>) {
    if !inner.sm.lock().unwrap().enabled {
        return;
    }
    let state = *inner.recovery.lock().unwrap();
    match state {
        Recovery::Failed => (),
        Recovery::Idle => {
            if inner.is_connected() {
                let (request_ack, silent) = {
                    let sm = inner.sm.lock().unwrap();
                    let elapsed = sm.last_server_ack_time.elapsed();
                    let cadence = sm.outbound_seq > 0 && sm.outbound_seq % 3 == 0;
                    (
                        cadence || elapsed > inner.config.timeouts.ack_request,
                        elapsed > inner.config.timeouts.silence_to_resume,
                    )
                };
                if request_ack {
                    if let Err(e) = inner.send_nonza(&r_element()).await {
                        debug!("ack request failed: {}", e);
                    }
                }
                if silent {
                    debug!("no ack from server in too long, starting resumption");
                    *inner.recovery.lock().unwrap() = Recovery::Resuming { attempts: 0 };
                    drive_resume(inner, 0).await;
                }
            } else {
                *inner.recovery.lock().unwrap() = Recovery::Resuming { attempts: 0 };
                drive_resume(inner, 0).await;
            }
        }
        Recovery::Resuming { attempts } => drive_resume(inner, attempts).await,
        Recovery::Reconnecting { attempts } => drive_reconnect(inner, attempts).await,
    }
}

async fn drive_resume(inner: &Arc<Inner>, attempts: u32) {
    let resumable = {
        let sm = inner.sm.lock().unwrap();
        sm.resumption_enabled && sm.resumption_id.is_some()
    };
    if !resumable || attempts >= inner.config.timeouts.max_resume_attempts {
        *inner.recovery.lock().unwrap() = Recovery::Reconnecting { attempts: 0 };
        drive_reconnect(inner, 0).await;
        return;
    }
    *inner.recovery.lock().unwrap() = Recovery::Resuming {
        attempts: attempts + 1,
    };
    match tokio::time::timeout(inner.config.timeouts.resume_attempt, attempt_resume(inner)).await
    {
        Ok(Ok(())) => (),
        Ok(Err(e)) => warn!("resumption attempt failed: {}", e),
        Err(_) => warn!("resumption attempt timed out"),
    }
}

async fn drive_reconnect(inner: &Arc<Inner>, attempts: u32) {
    if attempts >= inner.config.timeouts.max_reconnect_attempts {
        *inner.recovery.lock().unwrap() = Recovery::Failed;
        inner
            .emit(InboxEvent::Error(Error::Sm(SmError::ReconnectFailed)))
            .await;
        return;
    }
    *inner.recovery.lock().unwrap() = Recovery::Reconnecting {
        attempts: attempts + 1,
    };
    match tokio::time::timeout(
        inner.config.timeouts.reconnect_attempt,
        attempt_reconnect(inner),
    )
    .await
    {
        Ok(Ok(())) => {
            *inner.recovery.lock().unwrap() = Recovery::Idle;
        }
        Ok(Err(e)) => {
            if matches!(e, Error::Auth(_)) {
                // Bad credentials will not get better by retrying.
                *inner.recovery.lock().unwrap() = Recovery::Failed;
                inner.emit(InboxEvent::Error(e)).await;
            } else {
                warn!("reconnect attempt failed: {}", e);
            }
        }
        Err(_) => warn!("reconnect attempt timed out"),
    }
}

/// One resumption attempt: fresh transport, negotiate without binding,
/// `<resume/>`, then replay the unacked suffix.
async fn attempt_resume(inner: &Arc<Inner>) -> Result<(), Error> {
    let transport = inner.connector.connect().await?;
    let opts = login::Negotiation {
        to: inner.config.hostname.clone(),
        lang: inner.config.language.clone(),
        tls: inner.config.tls,
        verifier: inner.config.verifier.clone(),
        creds: inner.creds.read().unwrap().clone(),
        resource: inner.resource.read().unwrap().clone(),
        bind: false,
    };
    let outcome = login::negotiate(transport, &opts).await?;
    let mut stream = outcome.stream;

    let (h, previd) = {
        let sm = inner.sm.lock().unwrap();
        let previd = sm
            .resumption_id
            .clone()
            .ok_or(Error::Sm(SmError::ReconnectFailed))?;
        (sm.last_server_ack, previd)
    };
    stream
        .send_element(
            &Element::builder("resume", ns::SM)
                .attr("h", h)
                .attr("previd", previd)
                .build(),
        )
        .await?;

    let el = stream.next_element(Some(&["resumed", "failed"])).await?;
    if el.name() == "resumed" {
        let k = parse_h(&el)?;
        let snapshot = {
            let mut sm = inner.sm.lock().unwrap();
            sm.remote_acked(k).map_err(Error::Sm)?;
            sm.snapshot()
        };
        install_stream(inner, stream, &snapshot).await;
        *inner.recovery.lock().unwrap() = Recovery::Idle;
        debug!("stream resumed, {} stanzas replayed", snapshot.len());
        inner.emit(InboxEvent::StreamResumed).await;
        return Ok(());
    }

    // <failed/>
    if el.has_child("item-not-found", ns::XMPP_STANZAS) {
        // The server forgot the session but may still report how far it
        // got; remember that for the post-reconnect enable.
        if let Some(h) = el.attr("h").and_then(|h| h.parse().ok()) {
            inner.sm.lock().unwrap().pending_resume_h = Some(h);
        }
        debug!("resumption rejected with item-not-found, rebinding on this stream");
        let resource = inner.resource.read().unwrap().clone();
        let jid = login::bind(&mut stream, resource.as_deref()).await?;
        *inner.jid.write().unwrap() = Some(jid);
        install_stream(inner, stream, &[]).await;
        *inner.recovery.lock().unwrap() = Recovery::Idle;
        let (resume, max) = {
            let sm = inner.sm.lock().unwrap();
            (sm.resumption_requested, sm.max_resume_seconds)
        };
        inner.send_nonza(&enable_element(resume, max)).await?;
        Ok(())
    } else {
        let condition = el
            .children()
            .next()
            .map(|child| child.name().to_owned())
            .unwrap_or_else(|| "undefined-condition".to_owned());
        warn!("resumption failed: {}", condition);
        inner
            .emit(InboxEvent::Error(Error::Sm(SmError::ResumeFailed(condition))))
            .await;
        *inner.recovery.lock().unwrap() = Recovery::Reconnecting { attempts: 0 };
        Ok(())
    }
}

/// One full reconnect attempt: complete bring-up with binding, then
/// re-enable stream management.
async fn attempt_reconnect(inner: &Arc<Inner>) -> Result<(), Error> {
    establish(inner, true).await?;
    let (resume, max) = {
        let sm = inner.sm.lock().unwrap();
        (sm.resumption_requested, sm.max_resume_seconds)
    };
    inner.send_nonza(&enable_element(resume, max)).await?;
    Ok(())
}

impl Inner {
    /// `<enabled/>`: adopt the server's resumption grant, then flush the
    /// cache through the counted send path on the fresh session.
    pub(crate) async fn handle_enabled(&self, el: &Element) -> Result<(), Error> {
        let id = el.attr("id").map(str::to_owned);
        let resume = matches!(el.attr("resume"), Some("true") | Some("1"));
        let max = el.attr("max").and_then(|max| max.parse().ok());

        let snapshot = {
            let mut sm = self.sm.lock().unwrap();
            if let Some(h) = sm.pending_resume_h.take() {
                if let Err(e) = sm.remote_acked(h) {
                    warn!("ignoring bogus h from failed resume: {}", e);
                }
            }
            let snapshot: Vec<Stanza> = sm.replay_cache.drain(..).collect();
            sm.outbound_seq = 0;
            sm.inbound_seq = 0;
            sm.last_server_ack = 0;
            sm.resumption_enabled = resume && id.is_some();
            sm.resumption_id = id;
            if let Some(max) = max {
                sm.max_resume_seconds = max;
            }
            sm.pending_resume_h = None;
            sm.touch();
            snapshot
        };

        // Everything unacked on the old session goes out again and is
        // counted on the new one. The writer lock is held across the
        // whole replay so application sends cannot interleave.
        let mut guard = self.writer.lock().await;
        for stanza in &snapshot {
            if self.is_connected() {
                if let Some(writer) = guard.as_mut() {
                    if let Err(e) = write_all(writer, &stanza.to_element().to_xml()).await {
                        warn!("replay interrupted: {}", e);
                        self.mark_disconnected();
                    }
                }
            }
            self.sm.lock().unwrap().record_sent(stanza);
        }
        drop(guard);

        debug!(
            "stream management enabled (resumable: {})",
            self.sm.lock().unwrap().resumption_enabled
        );
        self.emit(InboxEvent::SmEnabled).await;
        Ok(())
    }

    /// `<failed/>` answering `<enable/>` on a live stream.
    pub(crate) async fn handle_enable_failed(&self, el: &Element) {
        let condition = el
            .children()
            .next()
            .map(|child| child.name().to_owned())
            .unwrap_or_else(|| "undefined-condition".to_owned());
        warn!("server refused stream management: {}", condition);
        *self.sm.lock().unwrap() = SmState::default();
        self.emit(InboxEvent::Error(Error::Sm(SmError::EnableFailed(condition))))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Message;

    fn msg(n: usize) -> Stanza {
        Stanza::Message(Message::default().body(&format!("m{}", n)))
    }

    fn invariant(sm: &SmState) {
        assert_eq!(
            sm.replay_cache.len() as u32,
            sm.outbound_seq.wrapping_sub(sm.last_server_ack),
        );
    }

    #[test]
    fn cache_tracks_send_and_ack() {
        let mut sm = SmState::default();
        sm.enabled = true;
        for n in 0..5 {
            sm.record_sent(&msg(n));
            invariant(&sm);
        }
        assert_eq!(sm.outbound_seq, 5);

        sm.remote_acked(3).unwrap();
        invariant(&sm);
        assert_eq!(sm.last_server_ack, 3);
        assert_eq!(sm.replay_cache.len(), 2);

        sm.remote_acked(5).unwrap();
        invariant(&sm);
        assert!(sm.replay_cache.is_empty());
    }

    #[test]
    fn ack_is_idempotent() {
        let mut sm = SmState::default();
        sm.record_sent(&msg(0));
        sm.remote_acked(1).unwrap();
        sm.remote_acked(1).unwrap();
        invariant(&sm);
        assert_eq!(sm.last_server_ack, 1);
    }

    #[test]
    fn overacking_is_rejected() {
        let mut sm = SmState::default();
        sm.record_sent(&msg(0));
        assert!(matches!(
            sm.remote_acked(2),
            Err(SmError::AckOutOfRange { h: 2, .. })
        ));
    }

    #[test]
    fn backwards_ack_is_rejected() {
        let mut sm = SmState::default();
        for n in 0..4 {
            sm.record_sent(&msg(n));
        }
        sm.remote_acked(4).unwrap();
        assert!(sm.remote_acked(2).is_err());
    }

    #[test]
    fn counters_wrap() {
        let mut sm = SmState::default();
        sm.outbound_seq = u32::MAX;
        sm.last_server_ack = u32::MAX;
        sm.record_sent(&msg(0));
        assert_eq!(sm.outbound_seq, 0);
        invariant(&sm);
        sm.remote_acked(0).unwrap();
        invariant(&sm);
        assert!(sm.replay_cache.is_empty());
    }

    // Trimming by the server's h and replaying the rest yields exactly
    // the unacked suffix, in send order.
    #[test]
    fn resume_replays_exact_suffix() {
        let mut sm = SmState::default();
        for n in 0..5 {
            sm.record_sent(&msg(n));
        }
        sm.remote_acked(3).unwrap();
        let replayed = sm.snapshot();
        let bodies: Vec<String> = replayed
            .iter()
            .map(|stanza| match stanza {
                Stanza::Message(m) => m.payloads[0].text(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(bodies, vec!["m3", "m4"]);
    }
}
