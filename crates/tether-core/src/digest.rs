//! HTTP Digest access authentication (RFC 7616, RFC 2617) with `qop=auth`.
//!
//! MD5 and SHA-256 are supported, each with its `-sess` variant. A challenge
//! without an `algorithm` parameter means MD5.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use md5::Md5;
use rand::Rng;
use sha2::{Digest as _, Sha256};

use crate::error::{Result, RpcError};

/// Parameters of a `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    /// Protection space.
    pub realm: String,
    /// Server nonce echoed in every response.
    pub nonce: String,
    /// Opaque string returned unchanged.
    pub opaque: Option<String>,
    /// Algorithm as written by the server.
    pub algorithm: Option<String>,
    /// Offered quality-of-protection values.
    pub qop: Vec<String>,
}

impl DigestChallenge {
    /// Parse a header value; returns `None` for non-digest schemes.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return None;
        }
        let params = parse_params(rest);
        Some(DigestChallenge {
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce: params.get("nonce")?.clone(),
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
            qop: params
                .get("qop")
                .map(|q| {
                    q.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        c => value.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    params
}

/// Hash function named by a challenge's `algorithm` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// MD5, the default when no algorithm is named.
    Md5,
    /// MD5 with the session key bound to the client nonce.
    Md5Sess,
    /// SHA-256 (RFC 7616).
    Sha256,
    /// SHA-256 with the session key bound to the client nonce.
    Sha256Sess,
}

impl DigestAlgorithm {
    /// Resolve the `algorithm` parameter; absent means MD5.
    pub fn from_challenge(algorithm: Option<&str>) -> Result<Self> {
        let Some(name) = algorithm else {
            return Ok(DigestAlgorithm::Md5);
        };
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "MD5-SESS" => Ok(DigestAlgorithm::Md5Sess),
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            "SHA-256-SESS" => Ok(DigestAlgorithm::Sha256Sess),
            _ => Err(RpcError::Auth {
                reason: format!("unsupported digest algorithm {}", name),
            }),
        }
    }

    fn is_session(self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    fn hash_hex(self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => hex::encode(Md5::digest(input.as_bytes())),
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(Sha256::digest(input.as_bytes()))
            }
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        })
    }
}

/// Username/password pair answering digest challenges.
pub struct DigestAuth {
    username: String,
    password: String,
    nonce_count: AtomicU32,
}

impl DigestAuth {
    /// Digest credentials for `username`.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        DigestAuth {
            username: username.into(),
            password: password.into(),
            nonce_count: AtomicU32::new(0),
        }
    }

    /// Build the `Authorization` header answering `challenge` for a request
    /// with the given method and request URI.
    pub fn authorization(&self, challenge: &DigestChallenge, method: &str, uri: &str) -> Result<String> {
        let cnonce = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
        self.authorization_with_cnonce(challenge, method, uri, &cnonce)
    }

    fn authorization_with_cnonce(
        &self,
        challenge: &DigestChallenge,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> Result<String> {
        let algorithm = DigestAlgorithm::from_challenge(challenge.algorithm.as_deref())?;
        if !challenge.qop.is_empty() && !challenge.qop.iter().any(|q| q == "auth") {
            return Err(RpcError::Auth {
                reason: format!("unsupported digest qop {:?}", challenge.qop),
            });
        }

        let mut ha1 = algorithm.hash_hex(&format!("{}:{}:{}", self.username, challenge.realm, self.password));
        if algorithm.is_session() {
            ha1 = algorithm.hash_hex(&format!("{}:{}:{}", ha1, challenge.nonce, cnonce));
        }
        let ha2 = algorithm.hash_hex(&format!("{}:{}", method, uri));
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            self.username, challenge.realm, challenge.nonce, uri
        );
        if challenge.algorithm.is_some() {
            header.push_str(&format!(", algorithm={}", algorithm));
        }
        let response = if challenge.qop.is_empty() {
            algorithm.hash_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
        } else {
            let nc = format!("{:08x}", self.nonce_count.fetch_add(1, Ordering::Relaxed) + 1);
            header.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
            algorithm.hash_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, challenge.nonce, nc, cnonce, ha2
            ))
        };
        header.push_str(&format!(", response=\"{}\"", response));
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        Ok(header)
    }
}

impl fmt::Debug for DigestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestAuth")
            .field("username", &self.username)
            .finish()
    }
}

/// Request-URI (path and query) of an absolute URL.
pub fn request_uri(url: &str) -> &str {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match after_scheme.find('/') {
        Some(idx) => &after_scheme[idx..],
        None => "/",
    }
}
