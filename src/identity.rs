//! Caller identity and tier derivation for the gatekeeper.
//!
//! The admission core never parses credentials itself; it only receives an
//! opaque identity string and an already-resolved [`Tier`].

use axum::{
    extract::{ConnectInfo, Request},
    http::{header::AUTHORIZATION, HeaderMap},
};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

use crate::config::{IdentitySettings, Tier};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Who is calling, as far as admission control cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// `user:<credential digest prefix>` or `ip:<address>`
    pub identity: String,
    pub tier: Tier,
}

/// Derives identity and tier from request metadata
pub trait IdentityExtractor: Send + Sync {
    fn extract(&self, request: &Request) -> CallerIdentity;
}

/// Default extractor: authorization credential digest, then forwarded
/// address, then the peer address.
///
/// Credentials are hashed whole before truncation. Tokens with a shared
/// leading segment (every HS256 JWT starts with the same header) still map
/// to distinct identities.
///
/// A [`Tier`] placed in the request extensions by an upstream layer takes
/// precedence over the credential-presence heuristic.
#[derive(Debug, Clone)]
pub struct HeaderIdentityExtractor {
    token_prefix_len: usize,
    trust_forwarded_headers: bool,
}

impl HeaderIdentityExtractor {
    pub fn new(token_prefix_len: usize, trust_forwarded_headers: bool) -> Self {
        Self {
            token_prefix_len,
            trust_forwarded_headers,
        }
    }

    pub fn from_settings(settings: &IdentitySettings) -> Self {
        Self::new(settings.token_prefix_len, settings.trust_forwarded_headers)
    }

    fn credential<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
        // Drop the auth scheme ("Bearer", "Token", ...); a bare scheme carries no credential
        let token = match value.split_once(' ') {
            Some((_, rest)) => rest.trim(),
            None if is_auth_scheme(value) => "",
            None => value,
        };
        (!token.is_empty()).then_some(token)
    }

    /// Hex SHA-256 of the credential, truncated to the configured length
    fn credential_digest(&self, token: &str) -> String {
        let digest = hex::encode(Sha256::digest(token.as_bytes()));
        let len = self.token_prefix_len.clamp(1, digest.len());
        digest[..len].to_string()
    }

    fn client_address(&self, request: &Request) -> String {
        let headers = request.headers();
        if self.trust_forwarded_headers {
            let forwarded = headers
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = forwarded {
                return addr.to_string();
            }

            let real_ip = headers
                .get(X_REAL_IP)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = real_ip {
                return addr.to_string();
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn is_auth_scheme(value: &str) -> bool {
    ["bearer", "basic", "token", "digest"]
        .iter()
        .any(|scheme| value.eq_ignore_ascii_case(scheme))
}

impl Default for HeaderIdentityExtractor {
    fn default() -> Self {
        Self::from_settings(&IdentitySettings::default())
    }
}

impl IdentityExtractor for HeaderIdentityExtractor {
    fn extract(&self, request: &Request) -> CallerIdentity {
        let upstream_tier = request.extensions().get::<Tier>().copied();

        match self.credential(request.headers()) {
            Some(token) => {
                CallerIdentity {
                    identity: format!("user:{}", self.credential_digest(token)),
                    tier: upstream_tier.unwrap_or(Tier::Authenticated),
                }
            }
            None => CallerIdentity {
                identity: format!("ip:{}", self.client_address(request)),
                tier: upstream_tier.unwrap_or(Tier::Public),
            },
        }
    }
}
