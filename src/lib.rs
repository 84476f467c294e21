// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Asynchronous [XMPP](https://xmpp.org/) client core with asynchronous
//! I/O using [tokio](https://tokio.rs/).
//!
//! The crate covers the session plumbing an instant-messaging (or any
//! other XMPP) application builds on: SRV lookup and TCP connection,
//! stream negotiation with opportunistic STARTTLS, SASL authentication
//! (SCRAM-SHA-1, DIGEST-MD5, PLAIN) and resource binding, a full-duplex
//! stanza engine with IQ correlation, and
//! [XEP-0198](https://xmpp.org/extensions/xep-0198.html) stream
//! management with acknowledgements, resumption and replay.
//!
//! # Getting started
//!
//! ```no_run
//! use jabberwock::{Client, ClientConfig, Message};
//!
//! # async fn run() -> Result<(), jabberwock::Error> {
//! let config = ClientConfig::new("example.org").with_credentials("alice", "hunter2");
//! let client = Client::new(config)?;
//! client.on_message(|message| println!("got {:?}", message));
//! client.connect().await?;
//! client.enable_stream_management(true, 60).await?;
//!
//! let to = "bob@example.org".parse()?;
//! client.send_message(Message::chat(to).body("hi")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Roster handling, presence semantics, MUC and the other XEP layers
//! belong to crates built on top of this one.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

mod client;
pub mod connect;
pub mod element;
pub mod error;
mod event;
pub mod jid;
pub mod ns;
pub mod stanza;
mod sm;
pub mod xmlstream;

#[doc(inline)]
pub use crate::error::Error;
pub use client::sasl;
pub use client::{Client, ClientConfig, Timeouts};
pub use element::Element;
pub use jid::Jid;
pub use stanza::{Iq, IqKind, Message, Presence, Stanza};
