//! Authorization.
//!
//! Caches are guarded by a shared bearer token. The binary cache
//! surface receives it base64-wrapped as `user:token` (the form Nix
//! substituters send for netrc credentials); the node API receives the
//! raw token. Either way the token suffix must match the cache token
//! exactly, otherwise the request terminates with 401.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::CacheState;

/// Checks a base64-wrapped `user:token` credential.
pub fn binary_cache_authorized(token: &str, headers: &HeaderMap) -> bool {
    let Some(credential) = bearer_value(headers) else {
        return false;
    };

    let Ok(decoded) = BASE64_STANDARD.decode(credential) else {
        return false;
    };

    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };

    match decoded.split_once(':') {
        Some((_, suffix)) => suffix == token,
        None => false,
    }
}

/// Checks a raw bearer token.
pub fn api_authorized(token: &str, headers: &HeaderMap) -> bool {
    bearer_value(headers).map_or(false, |value| value == token)
}

fn bearer_value(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .split_whitespace()
        .nth(1)
}

/// Performs auth on the binary cache surface.
///
/// Public caches pass everything through; private caches terminate
/// unauthenticated requests here.
pub async fn apply_cache_auth<B>(req: Request<B>, next: Next<B>) -> Response {
    let cache = req
        .extensions()
        .get::<Arc<CacheState>>()
        .expect("cache state not injected")
        .clone();

    if cache.is_private() && !binary_cache_authorized(&cache.token, req.headers()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_binary_cache_credential() {
        let wrapped = BASE64_STANDARD.encode("builder:secret");

        assert!(binary_cache_authorized(
            "secret",
            &headers(&format!("Basic {}", wrapped))
        ));
        assert!(!binary_cache_authorized(
            "other",
            &headers(&format!("Basic {}", wrapped))
        ));
        assert!(!binary_cache_authorized("secret", &headers("Basic ****")));
        assert!(!binary_cache_authorized("secret", &HeaderMap::new()));
    }

    #[test]
    fn test_api_token() {
        assert!(api_authorized("secret", &headers("Bearer secret")));
        assert!(!api_authorized("secret", &headers("Bearer nope")));
        assert!(!api_authorized("secret", &HeaderMap::new()));
    }
}
