// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-stream TLS upgrade (`urn:ietf:params:xml:ns:xmpp-tls`).

use core::fmt;
use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::{Error, TlsError};
use crate::xmlstream::BoxStream;

/// Application callback deciding whether to accept a presented certificate
/// chain: `(end_entity, intermediates) -> accept`.
pub type CertVerifyCallback =
    Arc<dyn for<'a> Fn(&CertificateDer<'a>, &[CertificateDer<'a>]) -> bool + Send + Sync>;

/// How server certificates are verified during the TLS upgrade.
#[derive(Clone, Default)]
pub enum TlsVerifier {
    /// Verify against the bundled WebPKI roots.
    #[default]
    WebPki,
    /// Accept any certificate. This disables server authentication
    /// entirely and must only be used for testing.
    AcceptAll,
    /// Delegate the accept/reject decision to an application callback
    /// which receives the presented chain.
    Callback(CertVerifyCallback),
}

impl fmt::Debug for TlsVerifier {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsVerifier::WebPki => fmt.write_str("TlsVerifier::WebPki"),
            TlsVerifier::AcceptAll => fmt.write_str("TlsVerifier::AcceptAll"),
            TlsVerifier::Callback(_) => fmt.write_str("TlsVerifier::Callback(..)"),
        }
    }
}

/// Verifier accepting any chain the callback (if any) does not reject.
///
/// Signatures are still checked so that a handshake with a tampered
/// transcript fails.
struct PermissiveVerifier {
    provider: CryptoProvider,
    callback: Option<CertVerifyCallback>,
}

impl fmt::Debug for PermissiveVerifier {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("PermissiveVerifier")
    }
}

impl ServerCertVerifier for PermissiveVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        if let Some(ref callback) = self.callback {
            if !callback(end_entity, intermediates) {
                return Err(tokio_rustls::rustls::Error::General(
                    "certificate rejected by verification callback".to_owned(),
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn client_config(verifier: &TlsVerifier) -> ClientConfig {
    match verifier {
        TlsVerifier::WebPki => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        TlsVerifier::AcceptAll | TlsVerifier::Callback(_) => {
            let callback = match verifier {
                TlsVerifier::Callback(cb) => Some(cb.clone()),
                _ => None,
            };
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PermissiveVerifier {
                    provider: aws_lc_rs::default_provider(),
                    callback,
                }))
                .with_no_client_auth()
        }
    }
}

/// Upgrade `stream` to TLS for `server_name`, verifying per `verifier`.
pub async fn upgrade_tls(
    stream: BoxStream,
    server_name: &str,
    verifier: &TlsVerifier,
) -> Result<BoxStream, Error> {
    let name = ServerName::try_from(server_name.to_owned())
        .map_err(|_| TlsError::InvalidName(server_name.to_owned()))?;
    let connector = TlsConnector::from(Arc::new(client_config(verifier)));
    let tls_stream = connector
        .connect(name, stream)
        .await
        .map_err(TlsError::Handshake)?;
    Ok(Box::new(tls_stream) as BoxStream)
}
