//! Upgrade-time authentication.
//!
//! A connection is bound to exactly one user, resolved from a bearer token
//! before the WebSocket upgrade happens.

use std::fmt;

use axum::http::{header, HeaderMap};
use parley_shared::types::UserId;
use subtle::ConstantTimeEq;

/// Maps an opaque bearer token to the user it authenticates.
pub trait TokenResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<UserId>;
}

/// Fixed token table, loaded from configuration.
#[derive(Clone, Default)]
pub struct StaticTokens {
    entries: Vec<(String, UserId)>,
}

impl StaticTokens {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, UserId)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(token, user)| (token.into(), user))
                .collect(),
        }
    }

    /// Parse `token:user_id` pairs separated by commas. Blank entries are
    /// skipped.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut entries = Vec::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (token, user) = pair
                .rsplit_once(':')
                .ok_or_else(|| format!("expected token:user_id, got {pair:?}"))?;
            let token = token.trim();
            if token.is_empty() {
                return Err("empty token".into());
            }
            let user = user
                .trim()
                .parse::<i64>()
                .map(UserId)
                .map_err(|e| format!("invalid user id in {pair:?}: {e}"))?;
            if !user.is_valid() {
                return Err(format!("user id must be positive in {pair:?}"));
            }
            entries.push((token.to_string(), user));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TokenResolver for StaticTokens {
    fn resolve(&self, token: &str) -> Option<UserId> {
        // Every entry is compared so the lookup time does not depend on
        // which entry (if any) matched.
        let presented = token.as_bytes();
        let mut found = None;
        for (candidate, user) in &self.entries {
            let candidate = candidate.as_bytes();
            let equal = candidate.len() == presented.len()
                && candidate.ct_eq(presented).unwrap_u8() == 1;
            if equal && found.is_none() {
                found = Some(*user);
            }
        }
        found
    }
}

impl fmt::Debug for StaticTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokens")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Pick the presented token: `Authorization: Bearer ...` wins over the
/// `token` query parameter, which browsers need since they cannot set
/// headers on a WebSocket handshake.
pub fn presented_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    from_header
        .or(query_token)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parse_and_resolve() {
        let tokens = StaticTokens::parse(" alpha:1 , beta:22,").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.resolve("alpha"), Some(UserId(1)));
        assert_eq!(tokens.resolve("beta"), Some(UserId(22)));
        assert_eq!(tokens.resolve("gamma"), None);
        assert_eq!(tokens.resolve("alph"), None);
        assert_eq!(tokens.resolve(""), None);
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(StaticTokens::parse("alpha").is_err());
        assert!(StaticTokens::parse(":1").is_err());
        assert!(StaticTokens::parse("alpha:x").is_err());
        assert!(StaticTokens::parse("alpha:0").is_err());
        assert!(StaticTokens::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_debug_hides_tokens() {
        let tokens = StaticTokens::new([("s3cret", UserId(1))]);
        let shown = format!("{tokens:?}");
        assert!(!shown.contains("s3cret"));
    }

    #[test]
    fn test_header_preferred_over_query() {
        let mut headers = HeaderMap::new();
        assert_eq!(presented_token(&headers, Some("q")), Some("q"));
        assert_eq!(presented_token(&headers, None), None);
        assert_eq!(presented_token(&headers, Some("")), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer h"));
        assert_eq!(presented_token(&headers, Some("q")), Some("h"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(presented_token(&headers, None), None);
    }
}
