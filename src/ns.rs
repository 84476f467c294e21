// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XML namespaces used by the core protocol.

/// RFC 6120: client-to-server stream contents.
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 6120: the `<stream:stream>` root element.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120: STARTTLS negotiation.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// RFC 6120: SASL negotiation.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120: resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// RFC 6120: stanza error conditions.
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// RFC 6120: stream error conditions.
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// XEP-0198: Stream Management.
pub const SM: &str = "urn:xmpp:sm:3";

/// XEP-0199: XMPP Ping.
pub const PING: &str = "urn:xmpp:ping";

/// The `xml:` prefix namespace.
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
