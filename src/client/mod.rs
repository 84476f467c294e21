// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP client session and its programmatic surface.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as TokioMutex};

use crate::connect::{ServerConnector, TcpServerConnector, TlsVerifier};
use crate::element::Element;
use crate::error::Error;
use crate::event::{run_inbox, Handlers, InboxEvent};
use crate::jid::Jid;
use crate::ns;
use crate::sm::{Recovery, SmState};
use crate::stanza::{make_id, Iq, Message, Presence, Stanza};
use crate::xmlstream::{StreamWriter, XmlStream};

pub(crate) mod dispatch;
mod iq;
pub(crate) mod login;
pub mod sasl;

use iq::IqTracker;
use sasl::Credentials;

/// Intervals and budgets governing the session's periodic maintenance.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Period of the stream-management maintenance tick.
    pub tick: Duration,
    /// Ask for an ack when the server has been silent this long.
    pub ack_request: Duration,
    /// Silence threshold after which a resumption attempt starts.
    pub silence_to_resume: Duration,
    /// Budget for a single resumption attempt.
    pub resume_attempt: Duration,
    /// Resumption attempts before escalating to a full reconnect.
    pub max_resume_attempts: u32,
    /// Budget for a single reconnect attempt.
    pub reconnect_attempt: Duration,
    /// Reconnect attempts before the session fails permanently.
    pub max_reconnect_attempts: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            tick: Duration::from_secs(10),
            ack_request: Duration::from_secs(20),
            silence_to_resume: Duration::from_secs(60),
            resume_attempt: Duration::from_secs(30),
            max_resume_attempts: 3,
            reconnect_attempt: Duration::from_secs(30),
            max_reconnect_attempts: 3,
        }
    }
}

/// Connection parameters for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The XMPP domain to connect to.
    pub hostname: String,
    /// The account localpart; `None` skips authentication.
    pub username: Option<String>,
    /// The account password.
    pub password: Option<String>,
    /// Bypass SRV resolution and connect to this host instead.
    pub server_override: Option<String>,
    /// Fallback port when SRV yields nothing (default 5222).
    pub port: u16,
    /// Whether to upgrade to TLS when the server offers STARTTLS.
    pub tls: bool,
    /// How server certificates are verified.
    pub verifier: TlsVerifier,
    /// The resource to request at bind time; `None` lets the server pick.
    pub resource: Option<String>,
    /// Our stream language tag.
    pub language: String,
    /// Default bound for synchronous IQ requests; `None` waits forever.
    pub iq_timeout: Option<Duration>,
    /// Maintenance intervals and budgets.
    pub timeouts: Timeouts,
}

impl ClientConfig {
    /// A default configuration for the given XMPP domain.
    pub fn new(hostname: &str) -> Self {
        ClientConfig {
            hostname: hostname.to_owned(),
            username: None,
            password: None,
            server_override: None,
            port: 5222,
            tls: true,
            verifier: TlsVerifier::default(),
            resource: None,
            language: "en".to_owned(),
            iq_timeout: None,
            timeouts: Timeouts::default(),
        }
    }

    /// Set the account credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_owned());
        self.password = Some(password.to_owned());
        self
    }
}

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn ServerConnector>,
    pub(crate) handlers: Arc<Handlers>,
    pub(crate) creds: StdRwLock<Option<Credentials>>,
    pub(crate) resource: StdRwLock<Option<String>>,
    pub(crate) writer: TokioMutex<Option<StreamWriter>>,
    pub(crate) sm: StdMutex<SmState>,
    pub(crate) recovery: StdMutex<Recovery>,
    pub(crate) iq: IqTracker,
    pub(crate) jid: StdRwLock<Option<Jid>>,
    pub(crate) language: StdRwLock<String>,
    pub(crate) negotiating: AtomicBool,
    pub(crate) connected: AtomicBool,
    pub(crate) authenticated: AtomicBool,
    pub(crate) encrypted: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) generation: AtomicU64,
    pub(crate) inbox_tx: StdMutex<Option<mpsc::Sender<InboxEvent>>>,
    tick_running: AtomicBool,
}

impl Inner {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Queue an event for the inbox dispatcher.
    pub(crate) async fn emit(&self, event: InboxEvent) {
        let tx = self.inbox_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Serialize and send a non-stanza frame; never cached.
    pub(crate) async fn send_nonza(&self, el: &Element) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let xml = el.to_xml();
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        match write_all(writer, &xml).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_disconnected();
                Err(Error::Io(e))
            }
        }
    }

    /// Serialize and send a stanza, appending it to the replay cache and
    /// bumping the send counter in the same critical section.
    ///
    /// With stream management enabled a write failure (or a disconnected
    /// transport) keeps the stanza cached for replay and the send counts
    /// as accepted; without it the error propagates.
    pub(crate) async fn send_stanza(&self, mut stanza: Stanza) -> Result<(), Error> {
        if self.negotiating.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        stanza.ensure_id();
        let sm_active = self.sm.lock().unwrap().enabled;
        if !sm_active && !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let xml = stanza.to_element().to_xml();
        let mut guard = self.writer.lock().await;
        let mut write_error = None;
        if self.is_connected() {
            if let Some(writer) = guard.as_mut() {
                if let Err(e) = write_all(writer, &xml).await {
                    self.mark_disconnected();
                    write_error = Some(e);
                }
            }
        }
        if sm_active {
            self.sm.lock().unwrap().record_sent(&stanza);
            if let Some(e) = write_error {
                debug!("send failed ({}), stanza stays cached for replay", e);
            }
            Ok(())
        } else {
            drop(guard);
            match write_error {
                Some(e) => Err(Error::Io(e)),
                None => Ok(()),
            }
        }
    }

    /// Tear down the transport without emitting events.
    pub(crate) async fn drop_transport(&self) {
        self.mark_disconnected();
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            let _ = writer.shutdown().await;
        }
        *guard = None;
    }
}

pub(crate) async fn write_all(writer: &mut StreamWriter, xml: &str) -> std::io::Result<()> {
    writer.write_all(xml.as_bytes()).await?;
    writer.flush().await
}

/// Run the full bring-up on a fresh transport and install the resulting
/// stream. Application stanza sends fail fast for the duration.
pub(crate) async fn establish(inner: &Arc<Inner>, bind: bool) -> Result<(), Error> {
    inner.negotiating.store(true, Ordering::SeqCst);
    let result = establish_inner(inner, bind).await;
    inner.negotiating.store(false, Ordering::SeqCst);
    result
}

async fn establish_inner(inner: &Arc<Inner>, bind: bool) -> Result<(), Error> {
    let transport = inner.connector.connect().await?;
    let opts = login::Negotiation {
        to: inner.config.hostname.clone(),
        lang: inner.config.language.clone(),
        tls: inner.config.tls,
        verifier: inner.config.verifier.clone(),
        creds: inner.creds.read().unwrap().clone(),
        resource: inner.resource.read().unwrap().clone(),
        bind,
    };
    let outcome = login::negotiate(transport, &opts).await?;
    inner
        .authenticated
        .store(outcome.authenticated, Ordering::SeqCst);
    inner.encrypted.store(outcome.encrypted, Ordering::SeqCst);
    if let Some(jid) = outcome.jid {
        debug!("session bound to {}", jid);
        *inner.jid.write().unwrap() = Some(jid);
    }
    install_stream(inner, outcome.stream, &[]).await;
    Ok(())
}

/// Hand a negotiated stream to the dispatcher and the shared writer.
///
/// `replay` is written first, under the same writer lock that admits the
/// new write half, so application sends cannot slip in ahead of
/// retransmitted stanzas.
pub(crate) async fn install_stream(inner: &Arc<Inner>, stream: XmlStream, replay: &[Stanza]) {
    *inner.language.write().unwrap() = stream.lang().to_owned();
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (reader, writer, _header) = stream.into_parts();
    {
        let mut writer = writer;
        let mut guard = inner.writer.lock().await;
        inner.connected.store(true, Ordering::SeqCst);
        for stanza in replay {
            if let Err(e) = write_all(&mut writer, &stanza.to_element().to_xml()).await {
                log::warn!("replay interrupted: {}", e);
                inner.mark_disconnected();
                break;
            }
        }
        *guard = Some(writer);
    }
    tokio::spawn(dispatch::run_reader(
        Arc::downgrade(inner),
        reader,
        generation,
    ));
}

fn ensure_inbox(inner: &Arc<Inner>) {
    let mut tx_slot = inner.inbox_tx.lock().unwrap();
    if tx_slot.is_some() {
        return;
    }
    let (tx, rx) = mpsc::channel(64);
    *tx_slot = Some(tx);
    tokio::spawn(run_inbox(inner.handlers.clone(), rx));
}

fn ensure_tick(inner: &Arc<Inner>) {
    if inner.tick_running.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(crate::sm::run_tick(Arc::downgrade(inner)));
}

/// An XMPP client session.
///
/// The client connects, authenticates and binds a resource, then keeps
/// the session alive: inbound stanzas are delivered through the
/// registered callbacks, outbound sends are safe from any task, and with
/// stream management enabled the session transparently survives
/// transient network failures.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a client for the given configuration.
    pub fn new(config: ClientConfig) -> Result<Client, Error> {
        if config.hostname.is_empty() {
            return Err(Error::Argument("hostname must not be empty".to_owned()));
        }
        if config.port == 0 {
            return Err(Error::Argument("port must be non-zero".to_owned()));
        }
        let mut connector = TcpServerConnector::new(&config.hostname, config.port);
        if let Some(ref server) = config.server_override {
            connector = connector.with_server_override(server);
        }
        Ok(Client::with_connector(config, Arc::new(connector)))
    }

    /// Create a client with a custom transport connector.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn ServerConnector>) -> Client {
        let creds = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
                server: config.hostname.clone(),
            }),
            _ => None,
        };
        let resource = config.resource.clone();
        let language = config.language.clone();
        Client {
            inner: Arc::new(Inner {
                config,
                connector,
                handlers: Arc::new(Handlers::default()),
                creds: StdRwLock::new(creds),
                resource: StdRwLock::new(resource),
                writer: TokioMutex::new(None),
                sm: StdMutex::new(SmState::default()),
                recovery: StdMutex::new(Recovery::Idle),
                iq: IqTracker::default(),
                jid: StdRwLock::new(None),
                language: StdRwLock::new(language),
                negotiating: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                encrypted: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                inbox_tx: StdMutex::new(None),
                tick_running: AtomicBool::new(false),
            }),
        }
    }

    /// Connect, negotiate the stream and bind a resource.
    pub async fn connect(&self) -> Result<(), Error> {
        self.connect_with(None, true).await
    }

    /// Connect with an explicit resource and control over binding.
    pub async fn connect_with(&self, resource: Option<&str>, bind: bool) -> Result<(), Error> {
        if self.inner.is_connected() || self.inner.negotiating.load(Ordering::SeqCst) {
            return Err(Error::Argument("already connected".to_owned()));
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        if let Some(resource) = resource {
            *self.inner.resource.write().unwrap() = Some(resource.to_owned());
        }
        ensure_inbox(&self.inner);
        establish(&self.inner, bind).await?;
        ensure_tick(&self.inner);
        Ok(())
    }

    /// Replace the credentials and reconnect with them.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), Error> {
        *self.inner.creds.write().unwrap() = Some(Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
            server: self.inner.config.hostname.clone(),
        });
        self.inner.drop_transport().await;
        self.inner.iq.fail_all();
        *self.inner.sm.lock().unwrap() = SmState::default();
        *self.inner.recovery.lock().unwrap() = Recovery::Idle;
        ensure_inbox(&self.inner);
        establish(&self.inner, true).await?;
        ensure_tick(&self.inner);
        Ok(())
    }

    /// Close the stream and release the session's background tasks.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        {
            let mut guard = self.inner.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                let _ = writer.write_all(b"</stream:stream>").await;
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
            }
            *guard = None;
        }
        self.inner.mark_disconnected();
        self.inner.iq.fail_all();
        *self.inner.inbox_tx.lock().unwrap() = None;
    }

    /// Send a message stanza.
    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        self.inner.send_stanza(Stanza::Message(message)).await
    }

    /// Send a presence stanza.
    pub async fn send_presence(&self, presence: Presence) -> Result<(), Error> {
        self.inner.send_stanza(Stanza::Presence(presence)).await
    }

    /// Send an IQ request and wait for its response.
    ///
    /// `timeout` bounds the wait; `None` falls back to the configured
    /// default, which itself defaults to waiting forever. A timed-out
    /// server ping additionally marks the session disconnected.
    pub async fn iq_request(&self, mut iq: Iq, timeout: Option<Duration>) -> Result<Iq, Error> {
        if !iq.is_request() {
            return Err(Error::Argument(
                "iq_request requires a get or set".to_owned(),
            ));
        }
        let id = iq.id.get_or_insert_with(make_id).clone();
        let server_ping = is_server_ping(&iq);
        let rx = self.inner.iq.register_waiter(id.clone());
        if let Err(e) = self.inner.send_stanza(Stanza::Iq(iq)).await {
            self.inner.iq.remove(&id);
            return Err(e);
        }

        let bound = timeout.or(self.inner.config.iq_timeout);
        let received = match bound {
            None => rx.await.map_err(|_| Error::Disconnected),
            Some(bound) => match tokio::time::timeout(bound, rx).await {
                Ok(result) => result.map_err(|_| Error::Disconnected),
                Err(_elapsed) => {
                    self.inner.iq.remove(&id);
                    if server_ping {
                        // An unanswered ping to our own server means the
                        // stream is dead, not just slow.
                        self.inner.mark_disconnected();
                        self.inner.emit(InboxEvent::Error(Error::Disconnected)).await;
                    }
                    Err(Error::Timeout)
                }
            },
        };
        received
    }

    /// Send an IQ request without waiting; the optional callback fires on
    /// a worker task when the response arrives. Returns the assigned id.
    pub async fn iq_request_async(
        &self,
        mut iq: Iq,
        callback: Option<Box<dyn FnOnce(Iq) + Send>>,
    ) -> Result<String, Error> {
        if !iq.is_request() {
            return Err(Error::Argument(
                "iq_request_async requires a get or set".to_owned(),
            ));
        }
        let id = iq.id.get_or_insert_with(make_id).clone();
        if let Some(callback) = callback {
            self.inner.iq.register_callback(id.clone(), callback);
        }
        if let Err(e) = self.inner.send_stanza(Stanza::Iq(iq)).await {
            self.inner.iq.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Send an IQ response (kind result or error).
    pub async fn iq_response(&self, iq: Iq) -> Result<(), Error> {
        if iq.is_request() {
            return Err(Error::Argument(
                "iq_response requires a result or error".to_owned(),
            ));
        }
        if iq.id.is_none() {
            return Err(Error::Argument("iq_response requires an id".to_owned()));
        }
        self.inner.send_stanza(Stanza::Iq(iq)).await
    }

    /// Ask the server to enable XEP-0198 stream management.
    ///
    /// With `with_resumption` the server is asked to allow resuming the
    /// session for up to `max_seconds` after a connection drop.
    pub async fn enable_stream_management(
        &self,
        with_resumption: bool,
        max_seconds: u32,
    ) -> Result<(), Error> {
        if !self.inner.is_connected() {
            return Err(Error::NotConnected);
        }
        {
            let mut sm = self.inner.sm.lock().unwrap();
            sm.enabled = true;
            sm.resumption_requested = with_resumption;
            sm.max_resume_seconds = max_seconds;
            sm.touch();
        }
        let enable = Element::builder("enable", ns::SM)
            .attr("resume", with_resumption)
            .attr("max", max_seconds)
            .build();
        self.inner.send_nonza(&enable).await
    }

    /// Register the handler for background errors.
    pub fn on_error(&self, f: impl Fn(Error) + Send + Sync + 'static) {
        self.inner.handlers.set_error(f);
    }

    /// Register the handler for inbound IQ requests.
    pub fn on_iq(&self, f: impl Fn(Iq) + Send + Sync + 'static) {
        self.inner.handlers.set_iq(f);
    }

    /// Register the handler for inbound messages.
    pub fn on_message(&self, f: impl Fn(Message) + Send + Sync + 'static) {
        self.inner.handlers.set_message(f);
    }

    /// Register the handler for inbound presence.
    pub fn on_presence(&self, f: impl Fn(Presence) + Send + Sync + 'static) {
        self.inner.handlers.set_presence(f);
    }

    /// Register the handler invoked when stream management is enabled.
    pub fn on_sm_enabled(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.set_sm_enabled(f);
    }

    /// Register the handler invoked after a successful resumption.
    pub fn on_stream_resumed(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.set_stream_resumed(f);
    }

    /// The JID the server bound this session to.
    pub fn jid(&self) -> Option<Jid> {
        self.inner.jid.read().unwrap().clone()
    }

    /// Whether the transport is currently up.
    pub fn connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Whether SASL authentication completed on the current stream.
    pub fn authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the transport was upgraded to TLS.
    pub fn is_encrypted(&self) -> bool {
        self.inner.encrypted.load(Ordering::SeqCst)
    }

    /// The stream language: the server's `xml:lang`, defaulting to `en`.
    pub fn default_language(&self) -> String {
        self.inner.language.read().unwrap().clone()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

fn is_server_ping(iq: &Iq) -> bool {
    let to_server = match iq.to {
        None => true,
        Some(ref to) => to.node().is_none(),
    };
    to_server
        && iq
            .payload
            .as_ref()
            .map(|payload| payload.is("ping", ns::PING))
            .unwrap_or(false)
}

/// Upgrade helper for background tasks; `None` once the session handle
/// is gone.
pub(crate) fn alive(weak: &Weak<Inner>) -> Option<Arc<Inner>> {
    weak.upgrade()
}
