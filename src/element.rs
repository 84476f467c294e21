// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A minimal XML element tree for stanza payloads.
//!
//! Stanzas and nonzas are small, fully-materialized trees; this module
//! provides just enough of a DOM for the protocol core: qualified names,
//! an optional `xmlns`, ordered attributes, child elements and text.
//! Parsing is delegated to [`quick_xml`]; serialization produces the
//! canonical single-quoted UTF-8 form written to the wire.

use core::fmt;
use core::str::FromStr;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::ProtocolError;

/// A child of an [`Element`].
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A child element.
    Element(Element),
    /// A text node.
    Text(String),
}

/// An XML element with all descendants materialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Start building an element carrying an explicit `xmlns`.
    pub fn builder(name: &str, ns: &str) -> ElementBuilder {
        ElementBuilder {
            element: Element {
                name: name.to_owned(),
                ns: Some(ns.to_owned()),
                attrs: Vec::new(),
                children: Vec::new(),
            },
        }
    }

    /// Start building an element in the surrounding default namespace.
    pub fn client_builder(name: &str) -> ElementBuilder {
        ElementBuilder {
            element: Element {
                name: name.to_owned(),
                ns: None,
                attrs: Vec::new(),
                children: Vec::new(),
            },
        }
    }

    /// The local name (qualified prefix stripped).
    pub fn name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// The explicit `xmlns` of this element, if any.
    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// Whether this element has the given local name and explicit namespace.
    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name() == name && self.ns.as_deref() == Some(ns)
    }

    /// Look up an attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing value.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        for (k, v) in self.attrs.iter_mut() {
            if k == name {
                *v = value.to_owned();
                return;
            }
        }
        self.attrs.push((name.to_owned(), value.to_owned()));
    }

    /// Iterate over the child elements.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// The first child with the given local name and namespace.
    pub fn get_child(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|el| el.is(name, ns))
    }

    /// The first child with the given local name, regardless of namespace.
    pub fn get_child_named(&self, name: &str) -> Option<&Element> {
        self.children().find(|el| el.name() == name)
    }

    /// Whether a child with the given local name and namespace exists.
    pub fn has_child(&self, name: &str, ns: &str) -> bool {
        self.get_child(name, ns).is_some()
    }

    /// The concatenated text content of this element.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Append a child element.
    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Serialize to the canonical wire form.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, None);
        out
    }

    // `xmlns` is only written where the namespace actually changes.
    fn write_into(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        if let Some(ref ns) = self.ns {
            if parent_ns != Some(ns.as_str()) {
                out.push_str(" xmlns='");
                escape_into(ns, out);
                out.push('\'');
            }
        }
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            escape_into(v, out);
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_into(out, self.ns.as_deref()),
                Node::Text(t) => escape_into(t, out),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse a single complete element from a byte slice.
    pub fn parse_slice(bytes: &[u8]) -> Result<Element, ProtocolError> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().check_end_names = false;
        let mut stack: Vec<Element> = Vec::new();

        loop {
            match reader
                .read_event()
                .map_err(|e| ProtocolError::Parser(e.to_string()))?
            {
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => (),
                Event::Start(start) => {
                    let parent_ns = stack.last().and_then(|parent| parent.ns.clone());
                    stack.push(element_from_tag(&start, parent_ns)?);
                }
                Event::Empty(start) => {
                    let parent_ns = stack.last().and_then(|parent| parent.ns.clone());
                    let el = element_from_tag(&start, parent_ns)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(el)),
                        None => return Ok(el),
                    }
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| ProtocolError::Parser(e.to_string()))?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text.into_owned()));
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .children
                            .push(Node::Text(String::from_utf8_lossy(&data).into_owned()));
                    }
                }
                Event::End(_) => match stack.pop() {
                    Some(el) => match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(el)),
                        None => return Ok(el),
                    },
                    None => {
                        return Err(ProtocolError::Parser("unbalanced end tag".to_owned()));
                    }
                },
                Event::Eof => {
                    return Err(ProtocolError::Parser("truncated element".to_owned()));
                }
            }
        }
    }
}

// Children without an explicit `xmlns` live in their parent's namespace.
fn element_from_tag(
    start: &quick_xml::events::BytesStart,
    parent_ns: Option<String>,
) -> Result<Element, ProtocolError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut ns = parent_ns;
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ProtocolError::Parser(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ProtocolError::Parser(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            ns = Some(value);
        } else {
            attrs.push((key, value));
        }
    }
    Ok(Element {
        name,
        ns,
        attrs,
        children: Vec::new(),
    })
}

impl FromStr for Element {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Element, ProtocolError> {
        Element::parse_slice(s.as_bytes())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&self.to_xml())
    }
}

/// Builder for [`Element`].
pub struct ElementBuilder {
    element: Element,
}

impl ElementBuilder {
    /// Add an attribute.
    pub fn attr(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.element
            .attrs
            .push((name.to_owned(), value.to_string()));
        self
    }

    /// Add an attribute when the value is present.
    pub fn attr_opt(self, name: &str, value: Option<impl fmt::Display>) -> Self {
        match value {
            Some(value) => self.attr(name, value),
            None => self,
        }
    }

    /// Append a child element.
    pub fn append(mut self, child: Element) -> Self {
        self.element.children.push(Node::Element(child));
        self
    }

    /// Append a text node.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.element.children.push(Node::Text(text.into()));
        self
    }

    /// Finish building.
    pub fn build(self) -> Element {
        self.element
    }
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    #[test]
    fn parse_nested() {
        let el: Element =
            "<iq type='result' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>u@example.org/r</jid></bind></iq>"
                .parse()
                .unwrap();
        assert_eq!(el.name(), "iq");
        assert_eq!(el.attr("type"), Some("result"));
        let bind = el.get_child("bind", ns::BIND).unwrap();
        let jid = bind.get_child_named("jid").unwrap();
        assert_eq!(jid.text(), "u@example.org/r");
    }

    #[test]
    fn parse_self_closing() {
        let el: Element = "<r xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        assert!(el.is("r", ns::SM));
    }

    #[test]
    fn parse_prefixed_name() {
        let el: Element =
            "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>"
                .parse()
                .unwrap();
        assert_eq!(el.name(), "features");
        assert!(el.has_child("bind", ns::BIND));
    }

    #[test]
    fn serialize_canonical() {
        let el = Element::builder("enable", ns::SM)
            .attr("resume", "true")
            .attr("max", 60)
            .build();
        assert_eq!(
            el.to_xml(),
            "<enable xmlns='urn:xmpp:sm:3' resume='true' max='60'/>"
        );
    }

    #[test]
    fn escaping_roundtrip() {
        let el = Element::client_builder("message")
            .attr("to", "v@example.org")
            .append(
                Element::client_builder("body")
                    .text("a <b> & 'c' \"d\"")
                    .build(),
            )
            .build();
        let xml = el.to_xml();
        assert!(xml.contains("&lt;b&gt; &amp; &apos;c&apos; &quot;d&quot;"));
        let back: Element = xml.parse().unwrap();
        assert_eq!(back.get_child_named("body").unwrap().text(), "a <b> & 'c' \"d\"");
    }

    #[test]
    fn text_ignores_child_elements() {
        let el: Element = "<x>a<y>b</y>c</x>".parse().unwrap();
        assert_eq!(el.text(), "ac");
    }

    #[test]
    fn truncated_input_fails() {
        assert!("<iq type='get'><ping".parse::<Element>().is_err());
    }
}
