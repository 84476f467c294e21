// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream bring-up: open, features, STARTTLS, SASL, resource binding.

use base64::prelude::*;
use log::{debug, warn};

use crate::client::sasl::{select_mechanism, Credentials};
use crate::connect::{upgrade_tls, TlsVerifier};
use crate::element::Element;
use crate::error::{AuthError, Error, ProtocolError};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{IqKind, Stanza};
use crate::xmlstream::{BoxStream, XmlStream};

const BIND_REQ_ID: &str = "jbw-bind";

/// What the peer's `<stream:features/>` advertised.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamFeatures {
    pub starttls: bool,
    pub tls_required: bool,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    pub sm: bool,
}

pub(crate) fn parse_features(el: &Element) -> StreamFeatures {
    let mut features = StreamFeatures::default();
    if let Some(starttls) = el.get_child("starttls", ns::TLS) {
        features.starttls = true;
        features.tls_required = starttls.get_child("required", ns::TLS).is_some();
    }
    if let Some(mechanisms) = el.get_child("mechanisms", ns::SASL) {
        features.mechanisms = mechanisms
            .children()
            .filter(|child| child.name() == "mechanism")
            .map(|child| child.text())
            .collect();
    }
    features.bind = el.has_child("bind", ns::BIND);
    features.sm = el.has_child("sm", ns::SM);
    features
}

/// Parameters for one bring-up run.
pub(crate) struct Negotiation {
    pub to: String,
    pub lang: String,
    pub tls: bool,
    pub verifier: TlsVerifier,
    pub creds: Option<Credentials>,
    pub resource: Option<String>,
    pub bind: bool,
}

/// A successfully negotiated stream, ready for the dispatcher.
pub(crate) struct Negotiated {
    pub stream: XmlStream,
    pub features: StreamFeatures,
    pub jid: Option<Jid>,
    pub authenticated: bool,
    pub encrypted: bool,
}

async fn read_features(stream: &mut XmlStream) -> Result<StreamFeatures, Error> {
    let el = stream.next_element(Some(&["features"])).await?;
    Ok(parse_features(&el))
}

fn sasl_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_owned()
    } else {
        BASE64_STANDARD.encode(data)
    }
}

fn decode_sasl_payload(el: &Element) -> Result<Vec<u8>, Error> {
    let text = el.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(text)
        .map_err(|e| ProtocolError::MalformedStanza(format!("bad SASL base64: {}", e)).into())
}

/// Drive the bring-up sequence on a fresh transport.
///
/// STARTTLS and SASL each restart the stream; binding is skipped when
/// `bind` is false (resumption) or the feature is absent. Every failure
/// is final for the current stream; the caller decides whether to
/// reconnect.
pub(crate) async fn negotiate(
    transport: BoxStream,
    opts: &Negotiation,
) -> Result<Negotiated, Error> {
    let mut stream = XmlStream::open(transport, &opts.to, &opts.lang).await?;
    let mut features = read_features(&mut stream).await?;
    let mut encrypted = false;

    if features.starttls && opts.tls {
        stream
            .send_element(&Element::builder("starttls", ns::TLS).build())
            .await?;
        let el = stream.next_element(Some(&["proceed", "failure"])).await?;
        if el.name() == "failure" {
            return Err(AuthError::TlsRequired.into());
        }
        debug!("server sent <proceed/>, upgrading to TLS");
        let tls_stream = upgrade_tls(stream.into_inner(), &opts.to, &opts.verifier).await?;
        stream = XmlStream::open(tls_stream, &opts.to, &opts.lang).await?;
        features = read_features(&mut stream).await?;
        encrypted = true;
    } else if features.tls_required && !opts.tls {
        return Err(AuthError::TlsRequired.into());
    } else if opts.tls && !features.starttls {
        warn!("TLS requested but peer does not offer STARTTLS, continuing in the clear");
    }

    let mut authenticated = false;
    if let Some(ref creds) = opts.creds {
        let mut mechanism =
            select_mechanism(&features.mechanisms, creds).ok_or(AuthError::NoMechanism)?;
        debug!("authenticating with {}", mechanism.name());
        let auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", mechanism.name())
            .text(sasl_payload(&mechanism.initial()))
            .build();
        stream.send_element(&auth).await?;

        loop {
            let el = stream
                .next_element(Some(&["challenge", "success", "failure"]))
                .await?;
            match el.name() {
                "challenge" => {
                    let data = decode_sasl_payload(&el)?;
                    let response = mechanism
                        .response(&data)
                        .map_err(|e| AuthError::Sasl(e))?;
                    let response = Element::builder("response", ns::SASL)
                        .text(sasl_payload(&response))
                        .build();
                    stream.send_element(&response).await?;
                }
                "success" => {
                    let data = decode_sasl_payload(&el)?;
                    mechanism
                        .success(&data)
                        .map_err(|_| AuthError::ServerSignature)?;
                    authenticated = true;
                    break;
                }
                _failure => {
                    let condition = el
                        .children()
                        .next()
                        .map(|child| child.name().to_owned())
                        .unwrap_or_else(|| "not-authorized".to_owned());
                    return Err(AuthError::Fail(condition).into());
                }
            }
        }

        stream = stream.restart(&opts.to, &opts.lang).await?;
        features = read_features(&mut stream).await?;
    }

    let jid = if opts.bind && features.bind {
        Some(bind(&mut stream, opts.resource.as_deref()).await?)
    } else {
        None
    };

    Ok(Negotiated {
        stream,
        features,
        jid,
        authenticated,
        encrypted,
    })
}

/// Bind a resource, producing the session's full JID.
pub(crate) async fn bind(
    stream: &mut XmlStream,
    resource: Option<&str>,
) -> Result<Jid, Error> {
    let mut bind_el = Element::builder("bind", ns::BIND);
    if let Some(resource) = resource {
        bind_el = bind_el.append(
            Element::builder("resource", ns::BIND)
                .text(resource)
                .build(),
        );
    }
    let iq = Element::client_builder("iq")
        .attr("id", BIND_REQ_ID)
        .attr("type", "set")
        .append(bind_el.build())
        .build();
    stream.send_element(&iq).await?;

    loop {
        let el = stream.next_element(None).await?;
        if el.name() != "iq" || el.attr("id") != Some(BIND_REQ_ID) {
            debug!("ignoring {} while waiting for bind response", el.name());
            continue;
        }
        let stanza = Stanza::from_element(&el)?;
        let Stanza::Iq(iq) = stanza else {
            return Err(ProtocolError::InvalidBindResponse.into());
        };
        return match iq.kind {
            IqKind::Result => {
                let jid_text = iq
                    .payload
                    .as_ref()
                    .filter(|payload| payload.is("bind", ns::BIND))
                    .and_then(|payload| payload.get_child("jid", ns::BIND))
                    .map(|jid| jid.text())
                    .ok_or(ProtocolError::InvalidBindResponse)?;
                Ok(jid_text.parse()?)
            }
            _ => Err(ProtocolError::InvalidBindResponse.into()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_with_everything() {
        let el: Element = "<stream:features>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
               <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism>\
             </mechanisms>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             <sm xmlns='urn:xmpp:sm:3'/>\
           </stream:features>"
            .parse()
            .unwrap();
        let features = parse_features(&el);
        assert!(features.starttls);
        assert!(features.tls_required);
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-1", "PLAIN"]);
        assert!(features.bind);
        assert!(features.sm);
    }

    #[test]
    fn empty_features() {
        let el: Element = "<stream:features/>".parse().unwrap();
        let features = parse_features(&el);
        assert!(!features.starttls);
        assert!(!features.tls_required);
        assert!(features.mechanisms.is_empty());
        assert!(!features.bind);
        assert!(!features.sm);
    }

    #[test]
    fn sasl_payload_empty_marker() {
        assert_eq!(sasl_payload(b""), "=");
        assert_eq!(sasl_payload(b"ab"), "YWI=");
        let el = Element::builder("challenge", ns::SASL).text("=").build();
        assert!(decode_sasl_payload(&el).unwrap().is_empty());
        let el = Element::builder("challenge", ns::SASL).text("YWI=").build();
        assert_eq!(decode_sasl_payload(&el).unwrap(), b"ab");
    }
}
