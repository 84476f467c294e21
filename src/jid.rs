// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Jabber identifiers (RFC 7622): `node@domain/resource`.

use core::fmt;
use core::str::FromStr;
use std::error::Error as StdError;

/// Error on JID parse or construction.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// The domain part was empty.
    DomainEmpty,
    /// A `@` was present but the node part was empty.
    NodeEmpty,
    /// A `/` was present but the resource part was empty.
    ResourceEmpty,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::DomainEmpty => write!(fmt, "domain part is empty"),
            Error::NodeEmpty => write!(fmt, "node part is empty"),
            Error::ResourceEmpty => write!(fmt, "resource part is empty"),
        }
    }
}

impl StdError for Error {}

/// A Jabber identifier.
///
/// The node and domain parts are lowercased at construction, so equality
/// and hashing are case-insensitive on those parts. The resource is kept
/// and compared verbatim. A `Jid` is immutable once built; derived forms
/// are obtained through [`Jid::bare`] and [`Jid::with_resource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Build a JID from its parts, normalizing node and domain.
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Jid, Error> {
        if domain.is_empty() {
            return Err(Error::DomainEmpty);
        }
        match node {
            Some("") => return Err(Error::NodeEmpty),
            _ => (),
        }
        match resource {
            Some("") => return Err(Error::ResourceEmpty),
            _ => (),
        }
        Ok(Jid {
            node: node.map(|n| n.to_ascii_lowercase()),
            domain: domain.to_ascii_lowercase(),
            resource: resource.map(str::to_owned),
        })
    }

    /// Build a bare `domain` JID.
    pub fn domain(domain: &str) -> Result<Jid, Error> {
        Jid::new(None, domain, None)
    }

    /// The node part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain_part(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether this JID carries a resource.
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// This JID with the resource dropped.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// This JID with the given resource.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, Error> {
        if resource.is_empty() {
            return Err(Error::ResourceEmpty);
        }
        Ok(Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_owned()),
        })
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Jid, Error> {
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (s, None),
        };
        let (node, domain) = match bare.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, bare),
        };
        Jid::new(node, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref node) = self.node {
            write!(fmt, "{}@", node)?;
        }
        write!(fmt, "{}", self.domain)?;
        if let Some(ref resource) = self.resource {
            write!(fmt, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let jid: Jid = "alice@example.org/laptop".parse().unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain_part(), "example.org");
        assert_eq!(jid.resource(), Some("laptop"));
        assert!(jid.is_full());
    }

    #[test]
    fn parse_bare_and_domain() {
        let jid: Jid = "alice@example.org".parse().unwrap();
        assert_eq!(jid.resource(), None);
        let jid: Jid = "example.org".parse().unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain_part(), "example.org");
    }

    #[test]
    fn case_insensitive_node_and_domain() {
        let a: Jid = "Alice@Example.Org/Laptop".parse().unwrap();
        let b: Jid = "alice@example.org/Laptop".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "alice@example.org/Laptop");
    }

    #[test]
    fn case_sensitive_resource() {
        let a: Jid = "alice@example.org/laptop".parse().unwrap();
        let b: Jid = "alice@example.org/Laptop".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_parts_rejected() {
        assert_eq!("@example.org".parse::<Jid>(), Err(Error::NodeEmpty));
        assert_eq!("alice@".parse::<Jid>(), Err(Error::DomainEmpty));
        assert_eq!(
            "alice@example.org/".parse::<Jid>(),
            Err(Error::ResourceEmpty)
        );
        assert_eq!("".parse::<Jid>(), Err(Error::DomainEmpty));
    }

    #[test]
    fn bare_strips_resource() {
        let jid: Jid = "alice@example.org/laptop".parse().unwrap();
        assert_eq!(jid.bare().to_string(), "alice@example.org");
    }

    #[test]
    fn with_resource() {
        let jid: Jid = "alice@example.org".parse().unwrap();
        let full = jid.with_resource("phone").unwrap();
        assert_eq!(full.to_string(), "alice@example.org/phone");
        assert!(jid.with_resource("").is_err());
    }
}
