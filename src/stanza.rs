// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The three stanza kinds of RFC 6121: `iq`, `message` and `presence`.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::element::Element;
use crate::error::ProtocolError;
use crate::jid::Jid;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Produce a fresh stanza id, unique for the lifetime of the process.
pub(crate) fn make_id() -> String {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_string()
}

/// The four IQ kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    /// A request for information.
    Get,
    /// A request to change state.
    Set,
    /// A successful response.
    Result,
    /// An error response.
    Error,
}

impl IqKind {
    fn as_str(self) -> &'static str {
        match self {
            IqKind::Get => "get",
            IqKind::Set => "set",
            IqKind::Result => "result",
            IqKind::Error => "error",
        }
    }
}

/// An Info/Query stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    /// The recipient.
    pub to: Option<Jid>,
    /// The sender, as stamped by the server on reception.
    pub from: Option<Jid>,
    /// The id correlating requests and responses. Assigned automatically
    /// before a request is sent if absent.
    pub id: Option<String>,
    /// The `xml:lang` of the stanza.
    pub lang: Option<String>,
    /// Get, Set, Result or Error.
    pub kind: IqKind,
    /// The payload element, opaque to the core.
    pub payload: Option<Element>,
}

impl Iq {
    /// A `get` request carrying `payload`.
    pub fn get(payload: Element) -> Iq {
        Iq {
            to: None,
            from: None,
            id: None,
            lang: None,
            kind: IqKind::Get,
            payload: Some(payload),
        }
    }

    /// A `set` request carrying `payload`.
    pub fn set(payload: Element) -> Iq {
        Iq {
            to: None,
            from: None,
            id: None,
            lang: None,
            kind: IqKind::Set,
            payload: Some(payload),
        }
    }

    /// A `result` response to the request with the given id.
    pub fn result(id: &str, payload: Option<Element>) -> Iq {
        Iq {
            to: None,
            from: None,
            id: Some(id.to_owned()),
            lang: None,
            kind: IqKind::Result,
            payload,
        }
    }

    /// An `error` response to the request with the given id.
    pub fn error(id: &str, error: Element) -> Iq {
        Iq {
            to: None,
            from: None,
            id: Some(id.to_owned()),
            lang: None,
            kind: IqKind::Error,
            payload: Some(error),
        }
    }

    /// Set the recipient.
    pub fn with_to(mut self, to: Jid) -> Iq {
        self.to = Some(to);
        self
    }

    /// Whether this IQ expects a response.
    pub fn is_request(&self) -> bool {
        matches!(self.kind, IqKind::Get | IqKind::Set)
    }
}

/// A message stanza.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// The recipient.
    pub to: Option<Jid>,
    /// The sender.
    pub from: Option<Jid>,
    /// The stanza id.
    pub id: Option<String>,
    /// The `xml:lang` of the stanza.
    pub lang: Option<String>,
    /// The message type (`chat`, `groupchat`, `normal`, …).
    pub type_: Option<String>,
    /// Payload elements, opaque to the core.
    pub payloads: Vec<Element>,
}

impl Message {
    /// A `chat` message to the given recipient.
    pub fn chat(to: Jid) -> Message {
        Message {
            to: Some(to),
            type_: Some("chat".to_owned()),
            ..Message::default()
        }
    }

    /// Append a `<body>` payload.
    pub fn body(mut self, body: &str) -> Message {
        self.payloads
            .push(Element::client_builder("body").text(body).build());
        self
    }
}

/// A presence stanza.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Presence {
    /// The recipient.
    pub to: Option<Jid>,
    /// The sender.
    pub from: Option<Jid>,
    /// The stanza id.
    pub id: Option<String>,
    /// The `xml:lang` of the stanza.
    pub lang: Option<String>,
    /// The presence type (`unavailable`, `subscribe`, …); absent means
    /// available.
    pub type_: Option<String>,
    /// Payload elements, opaque to the core.
    pub payloads: Vec<Element>,
}

impl Presence {
    /// An available presence.
    pub fn available() -> Presence {
        Presence::default()
    }
}

/// A stanza sent/received over the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    /// IQ stanza
    Iq(Iq),
    /// Message stanza
    Message(Message),
    /// Presence stanza
    Presence(Presence),
}

impl Stanza {
    /// Assign a fresh id to the stanza if no id has been assigned yet.
    pub fn ensure_id(&mut self) -> &str {
        match self {
            Stanza::Iq(iq) => iq.id.get_or_insert_with(make_id),
            Stanza::Message(message) => message.id.get_or_insert_with(make_id),
            Stanza::Presence(presence) => presence.id.get_or_insert_with(make_id),
        }
    }

    /// The stanza id, if set.
    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Iq(iq) => iq.id.as_deref(),
            Stanza::Message(message) => message.id.as_deref(),
            Stanza::Presence(presence) => presence.id.as_deref(),
        }
    }

    /// Serialize to the element written to the wire.
    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Iq(iq) => {
                let mut builder = Element::client_builder("iq")
                    .attr_opt("to", iq.to.as_ref())
                    .attr_opt("from", iq.from.as_ref())
                    .attr_opt("id", iq.id.as_deref())
                    .attr("type", iq.kind.as_str())
                    .attr_opt("xml:lang", iq.lang.as_deref());
                if let Some(ref payload) = iq.payload {
                    builder = builder.append(payload.clone());
                }
                builder.build()
            }
            Stanza::Message(message) => {
                let mut builder = Element::client_builder("message")
                    .attr_opt("to", message.to.as_ref())
                    .attr_opt("from", message.from.as_ref())
                    .attr_opt("id", message.id.as_deref())
                    .attr_opt("type", message.type_.as_deref())
                    .attr_opt("xml:lang", message.lang.as_deref());
                for payload in &message.payloads {
                    builder = builder.append(payload.clone());
                }
                builder.build()
            }
            Stanza::Presence(presence) => {
                let mut builder = Element::client_builder("presence")
                    .attr_opt("to", presence.to.as_ref())
                    .attr_opt("from", presence.from.as_ref())
                    .attr_opt("id", presence.id.as_deref())
                    .attr_opt("type", presence.type_.as_deref())
                    .attr_opt("xml:lang", presence.lang.as_deref());
                for payload in &presence.payloads {
                    builder = builder.append(payload.clone());
                }
                builder.build()
            }
        }
    }

    /// Parse a received top-level element into a stanza.
    pub fn from_element(el: &Element) -> Result<Stanza, ProtocolError> {
        let to = parse_jid_attr(el, "to")?;
        let from = parse_jid_attr(el, "from")?;
        let id = el.attr("id").map(str::to_owned);
        let lang = el.attr("xml:lang").map(str::to_owned);
        match el.name() {
            "iq" => {
                let kind = match el.attr("type") {
                    Some("get") => IqKind::Get,
                    Some("set") => IqKind::Set,
                    Some("result") => IqKind::Result,
                    Some("error") => IqKind::Error,
                    other => {
                        return Err(ProtocolError::MalformedStanza(format!(
                            "bad iq type {:?}",
                            other
                        )))
                    }
                };
                Ok(Stanza::Iq(Iq {
                    to,
                    from,
                    id,
                    lang,
                    kind,
                    payload: el.children().next().cloned(),
                }))
            }
            "message" => Ok(Stanza::Message(Message {
                to,
                from,
                id,
                lang,
                type_: el.attr("type").map(str::to_owned),
                payloads: el.children().cloned().collect(),
            })),
            "presence" => Ok(Stanza::Presence(Presence {
                to,
                from,
                id,
                lang,
                type_: el.attr("type").map(str::to_owned),
                payloads: el.children().cloned().collect(),
            })),
            other => Err(ProtocolError::MalformedStanza(format!(
                "not a stanza: <{}>",
                other
            ))),
        }
    }
}

fn parse_jid_attr(el: &Element, name: &str) -> Result<Option<Jid>, ProtocolError> {
    match el.attr(name) {
        None => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|e| ProtocolError::MalformedStanza(format!("bad {} jid: {}", name, e))),
    }
}

impl From<Iq> for Stanza {
    fn from(other: Iq) -> Self {
        Stanza::Iq(other)
    }
}

impl From<Message> for Stanza {
    fn from(other: Message) -> Self {
        Stanza::Message(other)
    }
}

impl From<Presence> for Stanza {
    fn from(other: Presence) -> Self {
        Stanza::Presence(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    #[test]
    fn message_wire_form() {
        let msg = Message::chat("v@example.org".parse().unwrap()).body("hi");
        assert_eq!(
            Stanza::Message(msg).to_element().to_xml(),
            "<message to='v@example.org' type='chat'><body>hi</body></message>"
        );
    }

    #[test]
    fn iq_roundtrip() {
        let iq = Iq::get(Element::builder("ping", ns::PING).build())
            .with_to("example.org".parse().unwrap());
        let mut stanza = Stanza::Iq(iq);
        stanza.ensure_id();
        let el = stanza.to_element();
        let parsed = Stanza::from_element(&el).unwrap();
        match parsed {
            Stanza::Iq(iq) => {
                assert_eq!(iq.kind, IqKind::Get);
                assert!(iq.is_request());
                assert!(iq.payload.unwrap().is("ping", ns::PING));
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn iq_without_type_is_malformed() {
        let el: Element = "<iq id='1'/>".parse().unwrap();
        assert!(Stanza::from_element(&el).is_err());
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a: u64 = make_id().parse().unwrap();
        let b: u64 = make_id().parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn ensure_id_keeps_existing() {
        let mut stanza = Stanza::Message(Message {
            id: Some("keep".to_owned()),
            ..Message::default()
        });
        assert_eq!(stanza.ensure_id(), "keep");
    }

    #[test]
    fn presence_parse() {
        let el: Element = "<presence from='a@b/r' type='unavailable'/>".parse().unwrap();
        match Stanza::from_element(&el).unwrap() {
            Stanza::Presence(p) => {
                assert_eq!(p.type_.as_deref(), Some("unavailable"));
                assert_eq!(p.from.unwrap().resource(), Some("r"));
            }
            other => panic!("parsed as {:?}", other),
        }
    }
}
