// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client-side SASL mechanisms: SCRAM-SHA-1, DIGEST-MD5 and PLAIN.
//!
//! SCRAM-SHA-1 per RFC 5802 with server-signature verification,
//! DIGEST-MD5 per RFC 2831 with `rspauth` verification, PLAIN per
//! RFC 4616. Mechanism selection is by strict precedence:
//! SCRAM-SHA-1 > DIGEST-MD5 > PLAIN.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use pbkdf2::pbkdf2_hmac;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use sha1::{Digest as _, Sha1};

/// Credentials a mechanism authenticates with.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// The account's localpart.
    pub username: String,
    /// The account's password.
    pub password: String,
    /// The serving domain, used for the DIGEST-MD5 digest-uri.
    pub server: String,
}

/// A single SASL exchange.
///
/// `initial` produces the payload of `<auth/>`; each `<challenge/>` is
/// answered through `response`; `success` receives the payload of
/// `<success/>` for final verification. Errors are surfaced as
/// human-readable strings which the negotiator wraps in
/// [`AuthError::Sasl`][crate::error::AuthError::Sasl].
pub trait Mechanism: Send {
    /// The SASL mechanism name as advertised in stream features.
    fn name(&self) -> &'static str;

    /// The initial response carried in `<auth/>`.
    fn initial(&mut self) -> Vec<u8> {
        Vec::new()
    }

    /// Answer a server challenge.
    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, String>;

    /// Verify the data carried in `<success/>`. Empty data counts as
    /// verified.
    fn success(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Choose the strongest mechanism offered by the server.
pub fn select_mechanism(
    offered: &[String],
    creds: &Credentials,
) -> Option<Box<dyn Mechanism>> {
    let offers = |name: &str| offered.iter().any(|m| m == name);
    if offers("SCRAM-SHA-1") {
        Some(Box::new(ScramSha1::new(creds)))
    } else if offers("DIGEST-MD5") {
        Some(Box::new(DigestMd5::new(creds)))
    } else if offers("PLAIN") {
        Some(Box::new(Plain::new(creds)))
    } else {
        None
    }
}

fn nonce() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Split a comma-separated `key=value` list, honoring quoted values.
fn parse_pairs(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_owned();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_owned();
            rest = &stripped[(end + 1).min(stripped.len())..];
            rest = rest.strip_prefix(',').unwrap_or(rest);
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].to_owned();
            rest = &rest[(end + 1).min(rest.len())..];
        }
        pairs.push((key, value));
    }
    pairs
}

fn pair<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

// --- PLAIN (RFC 4616) ---

/// Transmits the password in the clear; last resort.
pub struct Plain {
    username: String,
    password: String,
}

impl Plain {
    fn new(creds: &Credentials) -> Self {
        Plain {
            username: creds.username.clone(),
            password: creds.password.clone(),
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial(&mut self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        data.push(0);
        data.extend_from_slice(self.username.as_bytes());
        data.push(0);
        data.extend_from_slice(self.password.as_bytes());
        data
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, String> {
        Err("unexpected challenge for PLAIN".to_owned())
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

// --- SCRAM-SHA-1 (RFC 5802) ---

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    Sha1::digest(data).to_vec()
}

/// Hi() from RFC 5802: PBKDF2-HMAC-SHA1.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut output = vec![0u8; 20];
    pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut output);
    output
}

/// RFC 5802 saslname escaping.
fn encode_sasl_name(name: &str) -> String {
    let mut result = String::new();
    for c in name.chars() {
        match c {
            ',' => result.push_str("=2C"),
            '=' => result.push_str("=3D"),
            _ => result.push(c),
        }
    }
    result
}

enum ScramState {
    Initial,
    SentClientFirst,
    SentClientFinal,
    Done,
}

/// Salted challenge-response with mutual authentication.
pub struct ScramSha1 {
    username: String,
    password: String,
    cnonce: String,
    client_first_bare: String,
    server_signature: Vec<u8>,
    verified: bool,
    state: ScramState,
}

impl ScramSha1 {
    fn new(creds: &Credentials) -> Self {
        ScramSha1 {
            username: creds.username.clone(),
            password: creds.password.clone(),
            cnonce: nonce(),
            client_first_bare: String::new(),
            server_signature: Vec::new(),
            verified: false,
            state: ScramState::Initial,
        }
    }

    fn verify_signature(&mut self, message: &str) -> Result<(), String> {
        let pairs = parse_pairs(message);
        let v = pair(&pairs, "v").ok_or("no server signature in message")?;
        let signature = BASE64_STANDARD
            .decode(v)
            .map_err(|e| format!("bad server signature base64: {}", e))?;
        if signature != self.server_signature {
            return Err("server signature mismatch".to_owned());
        }
        self.verified = true;
        Ok(())
    }
}

impl Mechanism for ScramSha1 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    fn initial(&mut self) -> Vec<u8> {
        self.client_first_bare = format!(
            "n={},r={}",
            encode_sasl_name(&self.username),
            self.cnonce
        );
        self.state = ScramState::SentClientFirst;
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, String> {
        match self.state {
            ScramState::SentClientFirst => {
                let server_first = core::str::from_utf8(challenge)
                    .map_err(|_| "server-first message is not UTF-8".to_owned())?;
                let pairs = parse_pairs(server_first);
                let combined_nonce =
                    pair(&pairs, "r").ok_or("no nonce in server-first message")?;
                if !combined_nonce.starts_with(&self.cnonce) {
                    return Err("server nonce does not extend client nonce".to_owned());
                }
                let salt = BASE64_STANDARD
                    .decode(pair(&pairs, "s").ok_or("no salt in server-first message")?)
                    .map_err(|e| format!("bad salt base64: {}", e))?;
                let iterations: u32 = pair(&pairs, "i")
                    .ok_or("no iteration count in server-first message")?
                    .parse()
                    .map_err(|_| "bad iteration count".to_owned())?;

                let salted_password = hi(self.password.as_bytes(), &salt, iterations);
                let client_key = hmac_sha1(&salted_password, b"Client Key");
                let stored_key = sha1(&client_key);

                let without_proof = format!("c=biws,r={}", combined_nonce);
                let auth_message = format!(
                    "{},{},{}",
                    self.client_first_bare, server_first, without_proof
                );
                let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
                let proof: Vec<u8> = client_key
                    .iter()
                    .zip(client_signature.iter())
                    .map(|(a, b)| a ^ b)
                    .collect();

                let server_key = hmac_sha1(&salted_password, b"Server Key");
                self.server_signature = hmac_sha1(&server_key, auth_message.as_bytes());

                self.state = ScramState::SentClientFinal;
                Ok(format!("{},p={}", without_proof, BASE64_STANDARD.encode(proof))
                    .into_bytes())
            }
            ScramState::SentClientFinal => {
                // Some servers deliver the server-final message as a last
                // challenge instead of inside <success/>.
                let message = core::str::from_utf8(challenge)
                    .map_err(|_| "server-final message is not UTF-8".to_owned())?;
                self.verify_signature(message)?;
                self.state = ScramState::Done;
                Ok(Vec::new())
            }
            _ => Err("unexpected SCRAM challenge".to_owned()),
        }
    }

    fn success(&mut self, data: &[u8]) -> Result<(), String> {
        if self.verified || data.is_empty() {
            return Ok(());
        }
        let message = core::str::from_utf8(data)
            .map_err(|_| "success data is not UTF-8".to_owned())?;
        self.verify_signature(message)
    }
}

// --- DIGEST-MD5 (RFC 2831) ---

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

enum DigestState {
    Initial,
    SentResponse { expected_rspauth: String },
    Done,
}

/// Challenge-response digest authentication; obsolete but still deployed.
pub struct DigestMd5 {
    username: String,
    password: String,
    server: String,
    cnonce: String,
    state: DigestState,
}

impl DigestMd5 {
    fn new(creds: &Credentials) -> Self {
        DigestMd5 {
            username: creds.username.clone(),
            password: creds.password.clone(),
            server: creds.server.clone(),
            cnonce: nonce(),
            state: DigestState::Initial,
        }
    }

    /// RFC 2831 response computation; `a2_prefix` is `AUTHENTICATE` for the
    /// request digest and empty for `rspauth`.
    fn compute(
        &self,
        realm: &str,
        nonce: &str,
        nc: &str,
        qop: &str,
        digest_uri: &str,
        a2_prefix: &str,
    ) -> String {
        let mut a1 = Md5::digest(
            format!("{}:{}:{}", self.username, realm, self.password).as_bytes(),
        )
        .to_vec();
        a1.extend_from_slice(format!(":{}:{}", nonce, self.cnonce).as_bytes());
        let ha1 = md5_hex(&a1);
        let ha2 = md5_hex(format!("{}:{}", a2_prefix, digest_uri).as_bytes());
        md5_hex(
            format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, self.cnonce, qop, ha2).as_bytes(),
        )
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, String> {
        match self.state {
            DigestState::Initial => {
                let challenge = core::str::from_utf8(challenge)
                    .map_err(|_| "challenge is not UTF-8".to_owned())?;
                let pairs = parse_pairs(challenge);
                let nonce = pair(&pairs, "nonce").ok_or("no nonce in challenge")?;
                let realm = pair(&pairs, "realm").unwrap_or(&self.server).to_owned();
                let qop = "auth";
                let nc = "00000001";
                let digest_uri = format!("xmpp/{}", self.server);

                let response =
                    self.compute(&realm, nonce, nc, qop, &digest_uri, "AUTHENTICATE");
                let expected_rspauth =
                    self.compute(&realm, nonce, nc, qop, &digest_uri, "");

                let reply = format!(
                    "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop={},digest-uri=\"{}\",response={},charset=utf-8",
                    self.username, realm, nonce, self.cnonce, nc, qop, digest_uri, response,
                );
                self.state = DigestState::SentResponse { expected_rspauth };
                Ok(reply.into_bytes())
            }
            DigestState::SentResponse {
                ref expected_rspauth,
            } => {
                let expected = expected_rspauth.clone();
                let challenge = core::str::from_utf8(challenge)
                    .map_err(|_| "challenge is not UTF-8".to_owned())?;
                let pairs = parse_pairs(challenge);
                let rspauth = pair(&pairs, "rspauth").ok_or("no rspauth in challenge")?;
                if rspauth != expected {
                    return Err("rspauth mismatch".to_owned());
                }
                self.state = DigestState::Done;
                Ok(Vec::new())
            }
            DigestState::Done => Err("unexpected DIGEST-MD5 challenge".to_owned()),
        }
    }

    fn success(&mut self, data: &[u8]) -> Result<(), String> {
        match self.state {
            DigestState::Done => Ok(()),
            DigestState::SentResponse {
                ref expected_rspauth,
            } => {
                let expected = expected_rspauth.clone();
                if data.is_empty() {
                    return Ok(());
                }
                let message = core::str::from_utf8(data)
                    .map_err(|_| "success data is not UTF-8".to_owned())?;
                let pairs = parse_pairs(message);
                match pair(&pairs, "rspauth") {
                    Some(rspauth) if rspauth == expected => {
                        self.state = DigestState::Done;
                        Ok(())
                    }
                    Some(_) => Err("rspauth mismatch".to_owned()),
                    None => Ok(()),
                }
            }
            DigestState::Initial => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            username: "user".to_owned(),
            password: "pencil".to_owned(),
            server: "example.org".to_owned(),
        }
    }

    #[test]
    fn selection_precedence() {
        let offered = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let creds = creds();
        let mech =
            select_mechanism(&offered(&["PLAIN", "DIGEST-MD5", "SCRAM-SHA-1"]), &creds).unwrap();
        assert_eq!(mech.name(), "SCRAM-SHA-1");
        let mech = select_mechanism(&offered(&["PLAIN", "DIGEST-MD5"]), &creds).unwrap();
        assert_eq!(mech.name(), "DIGEST-MD5");
        let mech = select_mechanism(&offered(&["PLAIN"]), &creds).unwrap();
        assert_eq!(mech.name(), "PLAIN");
        assert!(select_mechanism(&offered(&["EXTERNAL"]), &creds).is_none());
        assert!(select_mechanism(&[], &creds).is_none());
    }

    #[test]
    fn plain_initial() {
        let mut plain = Plain::new(&Credentials {
            username: "u".to_owned(),
            password: "p".to_owned(),
            server: "s".to_owned(),
        });
        assert_eq!(plain.initial(), b"\0u\0p");
        assert!(plain.success(b"").is_ok());
    }

    // RFC 5802 §5 example exchange.
    #[test]
    fn scram_sha1_rfc_vector() {
        let mut scram = ScramSha1::new(&creds());
        scram.cnonce = "fyko+d2lbbFgONRv9qkxdawL".to_owned();

        let first = scram.initial();
        assert_eq!(
            first,
            b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL".to_vec()
        );

        let server_first =
            b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let final_message = scram.response(server_first).unwrap();
        assert_eq!(
            String::from_utf8(final_message).unwrap(),
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );

        scram
            .success(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=")
            .unwrap();
    }

    #[test]
    fn scram_rejects_bad_signature() {
        let mut scram = ScramSha1::new(&creds());
        scram.cnonce = "fyko+d2lbbFgONRv9qkxdawL".to_owned();
        let _ = scram.initial();
        let _ = scram
            .response(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        assert!(scram.success(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_err());
    }

    #[test]
    fn scram_rejects_foreign_nonce() {
        let mut scram = ScramSha1::new(&creds());
        scram.cnonce = "abc".to_owned();
        let _ = scram.initial();
        assert!(scram
            .response(b"r=zzzdifferent,s=QSXCR+Q6sek8bf92,i=4096")
            .is_err());
    }

    #[test]
    fn scram_empty_success_counts_as_verified() {
        let mut scram = ScramSha1::new(&creds());
        let _ = scram.initial();
        assert!(scram.success(b"").is_ok());
    }

    // RFC 2831 §4 example, adapted to our parser.
    #[test]
    fn digest_md5_rfc_vector() {
        let mut digest = DigestMd5::new(&Credentials {
            username: "chris".to_owned(),
            password: "secret".to_owned(),
            server: "elwood.innosoft.com".to_owned(),
        });
        digest.cnonce = "OA6MHXh6VqTrRk".to_owned();

        // The RFC example uses the imap service; the computation only
        // depends on the digest-uri string.
        let response = digest
            .compute(
                "elwood.innosoft.com",
                "OA6MG9tEQGm2hh",
                "00000001",
                "auth",
                "imap/elwood.innosoft.com",
                "AUTHENTICATE",
            );
        assert_eq!(response, "d388dad90d4bbd760a152321f2143af7");

        let rspauth = digest.compute(
            "elwood.innosoft.com",
            "OA6MG9tEQGm2hh",
            "00000001",
            "auth",
            "imap/elwood.innosoft.com",
            "",
        );
        assert_eq!(rspauth, "ea40f60335c427b5527b84dbabcdfffd");
    }

    #[test]
    fn digest_md5_exchange_and_rspauth() {
        let mut digest = DigestMd5::new(&Credentials {
            username: "chris".to_owned(),
            password: "secret".to_owned(),
            server: "elwood.innosoft.com".to_owned(),
        });
        let reply = digest
            .response(
                b"realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
            )
            .unwrap();
        let reply = String::from_utf8(reply).unwrap();
        assert!(reply.contains("username=\"chris\""));
        assert!(reply.contains("digest-uri=\"xmpp/elwood.innosoft.com\""));
        assert!(reply.contains("nc=00000001"));

        // A wrong rspauth must be rejected.
        assert!(digest.response(b"rspauth=0000").is_err());
    }

    #[test]
    fn pair_parsing_handles_quotes() {
        let pairs = parse_pairs("realm=\"a,b\",nonce=\"xyz\",qop=auth");
        assert_eq!(pair(&pairs, "realm"), Some("a,b"));
        assert_eq!(pair(&pairs, "nonce"), Some("xyz"));
        assert_eq!(pair(&pairs, "qop"), Some("auth"));
    }
}
