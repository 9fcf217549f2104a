//! Window key construction.
//!
//! A key is `"<scope>:<identity>"`. Scopes are validated to never contain
//! `:`, so distinct (scope, identity) pairs cannot produce the same key even
//! when the identity itself contains colons (IPv6 addresses do).

use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Which caller identity a scope is keyed on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyStrategy {
    /// Forwarded address, then peer address.
    #[default]
    ClientAddress,
    /// User id supplied by the upstream auth layer.
    UserId,
    /// `<user>@<address>`
    UserAndAddress,
}

/// Identity signals pulled from an incoming request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub forwarded_for: Option<String>,
    pub peer_addr: Option<SocketAddr>,
    pub user_id: Option<String>,
}

impl RequestContext {
    pub fn from_parts(headers: &HeaderMap, extensions: &Extensions) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        let peer_addr = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0)
            .or_else(|| extensions.get::<SocketAddr>().copied());

        Self {
            forwarded_for: header(FORWARDED_FOR_HEADER),
            peer_addr,
            user_id: header(USER_ID_HEADER),
        }
    }

    /// First forwarded address, else the peer address, else `"unknown"`.
    pub fn client_address(&self) -> String {
        self.forwarded_for
            .as_deref()
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty())
            .map(str::to_string)
            .or_else(|| self.peer_addr.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
    }

    pub fn user(&self) -> String {
        self.user_id
            .as_deref()
            .filter(|user| !user.is_empty())
            .unwrap_or(UNKNOWN_IDENTITY)
            .to_string()
    }

    pub fn identity(&self, strategy: &KeyStrategy) -> String {
        match strategy {
            KeyStrategy::ClientAddress => self.client_address(),
            KeyStrategy::UserId => self.user(),
            KeyStrategy::UserAndAddress => format!("{}@{}", self.user(), self.client_address()),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(&parts.headers, &parts.extensions))
    }
}

/// Store key for one (scope, caller) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Identity is used verbatim.
    pub fn new(scope: &str, identity: &str) -> Self {
        Self(format!("{}:{}", scope, identity))
    }

    pub fn build(scope: &str, strategy: &KeyStrategy, context: &RequestContext) -> Self {
        Self::new(scope, &context.identity(strategy))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scope(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(scope, _)| scope)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn context_with_headers(pairs: &[(&'static str, &'static str)]) -> RequestContext {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(value));
        }
        RequestContext::from_parts(&headers, &Extensions::new())
    }

    #[test]
    fn test_forwarded_header_first_value_wins() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo("10.1.1.1:4000".parse::<SocketAddr>().unwrap()));
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );

        let context = RequestContext::from_parts(&headers, &extensions);
        let key = RateLimitKey::build("admin", &KeyStrategy::ClientAddress, &context);
        assert_eq!(key.as_str(), "admin:203.0.113.7");
    }

    #[test]
    fn test_peer_address_fallback() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo("198.51.100.4:5123".parse::<SocketAddr>().unwrap()));

        let context = RequestContext::from_parts(&HeaderMap::new(), &extensions);
        assert_eq!(context.client_address(), "198.51.100.4");
    }

    #[test]
    fn test_bare_socket_addr_extension() {
        let mut extensions = Extensions::new();
        extensions.insert("[2001:db8::1]:443".parse::<SocketAddr>().unwrap());

        let context = RequestContext::from_parts(&HeaderMap::new(), &extensions);
        let key = RateLimitKey::build("api", &KeyStrategy::ClientAddress, &context);
        assert_eq!(key.as_str(), "api:2001:db8::1");
        assert_eq!(key.scope(), "api");
    }

    #[test]
    fn test_empty_forwarded_value_falls_through() {
        let context = context_with_headers(&[(FORWARDED_FOR_HEADER, " , 10.0.0.1")]);
        assert_eq!(context.client_address(), UNKNOWN_IDENTITY);
    }

    #[test]
    fn test_unidentified_callers_share_a_key() {
        let first = RateLimitKey::build("api", &KeyStrategy::ClientAddress, &RequestContext::default());
        let second = RateLimitKey::build("api", &KeyStrategy::ClientAddress, &RequestContext::default());
        assert_eq!(first.as_str(), "api:unknown");
        assert_eq!(first, second);
    }

    #[test]
    fn test_user_strategies() {
        let context = context_with_headers(&[
            (USER_ID_HEADER, "user123"),
            (FORWARDED_FOR_HEADER, "192.168.1.1"),
        ]);

        assert_eq!(
            RateLimitKey::build("api", &KeyStrategy::UserId, &context).as_str(),
            "api:user123"
        );
        assert_eq!(
            RateLimitKey::build("api", &KeyStrategy::UserAndAddress, &context).as_str(),
            "api:user123@192.168.1.1"
        );
        assert_eq!(
            RateLimitKey::build("api", &KeyStrategy::UserId, &RequestContext::default()).as_str(),
            "api:unknown"
        );
    }

    #[test]
    fn test_identity_is_not_normalized() {
        let context = context_with_headers(&[(FORWARDED_FOR_HEADER, "ClientHost.Example")]);
        assert_eq!(context.client_address(), "ClientHost.Example");
    }

    #[test]
    fn test_scopes_do_not_collide() {
        let context = context_with_headers(&[(FORWARDED_FOR_HEADER, "203.0.113.7")]);
        let api = RateLimitKey::build("api", &KeyStrategy::ClientAddress, &context);
        let admin = RateLimitKey::build("admin", &KeyStrategy::ClientAddress, &context);
        assert_ne!(api, admin);
    }
}
