// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Server connection: SRV resolution and TCP establishment.

use core::future::Future;
use core::pin::Pin;
use std::io;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Error;
use crate::xmlstream::BoxStream;

pub mod starttls;

pub use starttls::{upgrade_tls, CertVerifyCallback, TlsVerifier};

/// Byte-level duplex transport a stream runs over.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// Trait called to produce the transport for an XMPP stream, perhaps
/// multiple times over the life of a session (initial connect, resumption,
/// reconnect).
///
/// The connector hands back the raw (not yet TLS-upgraded, not yet
/// negotiated) byte stream; negotiation including the optional STARTTLS
/// upgrade happens on top of it.
pub trait ServerConnector: Send + Sync + 'static {
    /// Establish a fresh transport.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<BoxStream, Error>> + Send + '_>>;
}

/// An SRV record candidate, ordered by (priority asc, weight asc).
#[derive(Debug, Clone, PartialEq, Eq)]
struct SrvCandidate {
    priority: u16,
    weight: u16,
    target: String,
    port: u16,
}

fn sort_candidates(mut records: Vec<SrvCandidate>) -> Vec<(String, u16)> {
    records.sort_by_key(|r| (r.priority, r.weight));
    records.into_iter().map(|r| (r.target, r.port)).collect()
}

/// Connects over TCP, consulting `_xmpp-client._tcp` SRV records.
#[derive(Debug, Clone)]
pub struct TcpServerConnector {
    host: String,
    port: u16,
    server_override: Option<String>,
}

impl TcpServerConnector {
    /// A connector for `host`, falling back to `port` when SRV resolution
    /// yields nothing.
    pub fn new(host: &str, port: u16) -> Self {
        TcpServerConnector {
            host: host.to_owned(),
            port,
            server_override: None,
        }
    }

    /// Bypass SRV resolution entirely and connect to the given server.
    pub fn with_server_override(mut self, server: &str) -> Self {
        self.server_override = Some(server.to_owned());
        self
    }

    /// The endpoints to try, in order.
    async fn candidates(&self) -> Result<Vec<(String, u16)>, Error> {
        if let Some(ref server) = self.server_override {
            return Ok(vec![(server.clone(), self.port)]);
        }

        let ascii_domain = idna::domain_to_ascii(&self.host)
            .map_err(|_| Error::Argument(format!("bad hostname: {}", self.host)))?;

        if ascii_domain.parse::<std::net::IpAddr>().is_ok() {
            return Ok(vec![(ascii_domain, self.port)]);
        }

        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("failed to load system DNS config ({}), using defaults", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };

        let srv_domain = format!("_xmpp-client._tcp.{}.", ascii_domain);
        match resolver.srv_lookup(srv_domain.clone()).await {
            Ok(lookup) => {
                let records: Vec<_> = lookup
                    .iter()
                    .map(|srv| SrvCandidate {
                        priority: srv.priority(),
                        weight: srv.weight(),
                        target: srv.target().to_ascii().trim_end_matches('.').to_owned(),
                        port: srv.port(),
                    })
                    .collect();
                if records.is_empty() {
                    debug!("{} returned no records, using fallback", srv_domain);
                    Ok(vec![(self.host.clone(), self.port)])
                } else {
                    Ok(sort_candidates(records))
                }
            }
            Err(e) => {
                // SRV lookup error, retry with the hostname itself.
                debug!("SRV lookup for {} failed ({}), using fallback", srv_domain, e);
                Ok(vec![(self.host.clone(), self.port)])
            }
        }
    }
}

impl ServerConnector for TcpServerConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<BoxStream, Error>> + Send + '_>> {
        Box::pin(async move {
            let candidates = self.candidates().await?;
            let mut attempts: Vec<String> = Vec::new();
            for (host, port) in candidates {
                debug!("attempting connection to {}:{}", host, port);
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        return Ok(Box::new(stream) as BoxStream);
                    }
                    Err(e) => attempts.push(format!("{}:{}: {}", host, port, e)),
                }
            }
            Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("all connection attempts failed: [{}]", attempts.join(", ")),
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(priority: u16, weight: u16, target: &str, port: u16) -> SrvCandidate {
        SrvCandidate {
            priority,
            weight,
            target: target.to_owned(),
            port,
        }
    }

    #[test]
    fn candidates_ordered_by_priority_then_weight() {
        let sorted = sort_candidates(vec![
            rec(20, 0, "y.example.org", 5222),
            rec(10, 5, "x2.example.org", 5222),
            rec(10, 1, "x1.example.org", 5269),
        ]);
        assert_eq!(
            sorted,
            vec![
                ("x1.example.org".to_owned(), 5269),
                ("x2.example.org".to_owned(), 5222),
                ("y.example.org".to_owned(), 5222),
            ]
        );
    }

    #[test]
    fn sort_is_a_permutation() {
        let records = vec![
            rec(1, 2, "a", 1),
            rec(3, 0, "b", 2),
            rec(1, 1, "c", 3),
            rec(2, 9, "d", 4),
        ];
        let sorted = sort_candidates(records.clone());
        assert_eq!(sorted.len(), records.len());
        for r in &records {
            assert!(sorted.contains(&(r.target.clone(), r.port)));
        }
        // Ordered pairs respect (priority, weight).
        assert_eq!(sorted[0].0, "c");
        assert_eq!(sorted[1].0, "a");
        assert_eq!(sorted[2].0, "d");
        assert_eq!(sorted[3].0, "b");
    }

    #[tokio::test]
    async fn override_bypasses_srv() {
        let connector =
            TcpServerConnector::new("example.org", 5222).with_server_override("10.0.0.1");
        let candidates = connector.candidates().await.unwrap();
        assert_eq!(candidates, vec![("10.0.0.1".to_owned(), 5222)]);
    }

    #[tokio::test]
    async fn failed_connect_lists_attempts() {
        // Port 1 on loopback is refused essentially everywhere.
        let connector =
            TcpServerConnector::new("127.0.0.1", 1).with_server_override("127.0.0.1");
        match connector.connect().await {
            Err(Error::Io(e)) => {
                let msg = e.to_string();
                assert!(msg.contains("all connection attempts failed"), "{}", msg);
                assert!(msg.contains("127.0.0.1:1"), "{}", msg);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| "stream")),
        }
    }
}
