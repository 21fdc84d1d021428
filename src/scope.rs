//! Scope key derivation.
//!
//! A scope key identifies one `(URL, audience)` pair in the counter index:
//!
//! - `{normalized_uri}|u:{username}` counts annotations only their owner can see
//! - `{normalized_uri}|g:{groupid}` counts annotations shared with a group
//!
//! The `u:` / `g:` markers keep the two families disjoint, so a username
//! and a group id that happen to be equal never share a counter.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::models::Annotation;

/// Prefix of the per-annotation marker records.
pub const MARKER_PREFIX: &str = "ann|";
/// Prefix of the counter records.
pub const COUNT_PREFIX: &str = "count|";
/// Prefix of the cached principal records.
pub const PROFILE_PREFIX: &str = "profile|";
/// Key holding the indexer's watermark.
pub const WATERMARK_KEY: &str = "indexer|last_indexed_date";

static USERID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^acct:([^@]+)@[^@]+$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("Exactly one of username or group must be set")]
    InvalidScope,
    #[error("Unrecognized account identifier: {0}")]
    InvalidUserid(String),
}

/// The audience a count is computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Only the owning user.
    User(String),
    /// Every member of the group.
    Group(String),
}

impl Scope {
    /// Build a scope from optional parts, requiring exactly one non-empty value.
    pub fn from_parts(username: Option<&str>, group: Option<&str>) -> Result<Self, ScopeError> {
        let username = username.filter(|s| !s.is_empty());
        let group = group.filter(|s| !s.is_empty());
        match (username, group) {
            (Some(u), None) => Ok(Scope::User(u.to_string())),
            (None, Some(g)) => Ok(Scope::Group(g.to_string())),
            _ => Err(ScopeError::InvalidScope),
        }
    }

    /// Owner scope for an `acct:<name>@<domain>` account identifier.
    pub fn for_userid(userid: &str) -> Result<Self, ScopeError> {
        username_from_userid(userid)
            .map(|name| Scope::User(name.to_string()))
            .ok_or_else(|| ScopeError::InvalidUserid(userid.to_string()))
    }

    fn marker(&self) -> String {
        match self {
            Scope::User(name) => format!("u:{}", name),
            Scope::Group(id) => format!("g:{}", id),
        }
    }
}

/// Extract `name` from an `acct:<name>@<domain>` identifier.
pub fn username_from_userid(userid: &str) -> Option<&str> {
    USERID_PATTERN
        .captures(userid)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Canonicalize a URI so cosmetically different spellings share counters.
///
/// Scheme and host are lower-cased, default ports dropped and percent-encoding
/// made consistent by the URL parser. The fragment, `utm_*` tracking
/// parameters and a trailing slash on a non-root path are removed. Strings
/// that are not absolute URLs are only trimmed.
pub fn normalize_uri(uri: &str) -> String {
    let trimmed = uri.trim();
    let mut parsed = match Url::parse(trimmed) {
        Ok(u) if !u.cannot_be_a_base() => u,
        _ => return trimmed.to_string(),
    };

    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| !k.starts_with("utm_"))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    parsed.to_string()
}

/// Derive the scope key for a URI viewed under `scope`.
pub fn derive_scope_key(uri: &str, scope: &Scope) -> String {
    format!("{}|{}", normalize_uri(uri), scope.marker())
}

/// The scope an annotation is counted under.
///
/// Shared annotations count towards their group, private ones towards their
/// owner.
pub fn scope_for_annotation(ann: &Annotation) -> Result<Scope, ScopeError> {
    if ann.is_shared {
        Scope::from_parts(None, Some(ann.groupid.as_str()))
    } else {
        Scope::for_userid(&ann.userid)
    }
}

/// Scope key an annotation is counted under.
pub fn scope_key_for_annotation(ann: &Annotation) -> Result<String, ScopeError> {
    scope_for_annotation(ann).map(|scope| derive_scope_key(&ann.uri, &scope))
}

pub fn count_key(scope_key: &str) -> String {
    format!("{}{}", COUNT_PREFIX, scope_key)
}

pub fn marker_key(annotation_id: &str) -> String {
    format!("{}{}", MARKER_PREFIX, annotation_id)
}

pub fn profile_key(auth_token: &str) -> String {
    format!("{}{}", PROFILE_PREFIX, auth_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(shared: bool, userid: &str) -> Annotation {
        Annotation {
            id: "a1".into(),
            uri: "https://x.test/p".into(),
            groupid: "g1".into(),
            userid: userid.into(),
            is_shared: shared,
            created: "t1".into(),
        }
    }

    #[test]
    fn owner_and_group_keys() {
        assert_eq!(
            derive_scope_key("https://x.test/p", &Scope::User("alice".into())),
            "https://x.test/p|u:alice"
        );
        assert_eq!(
            derive_scope_key("https://x.test/p", &Scope::Group("g1".into())),
            "https://x.test/p|g:g1"
        );
    }

    #[test]
    fn same_name_in_both_scopes_never_collides() {
        let user = derive_scope_key("https://x.test/p", &Scope::User("same".into()));
        let group = derive_scope_key("https://x.test/p", &Scope::Group("same".into()));
        assert_ne!(user, group);
    }

    #[test]
    fn derivation_is_deterministic() {
        let scope = Scope::Group("g1".into());
        assert_eq!(
            derive_scope_key("https://X.test/p#frag", &scope),
            derive_scope_key("https://x.test/p", &scope)
        );
    }

    #[test]
    fn from_parts_requires_exactly_one() {
        assert_eq!(Scope::from_parts(None, None), Err(ScopeError::InvalidScope));
        assert_eq!(
            Scope::from_parts(Some("alice"), Some("g1")),
            Err(ScopeError::InvalidScope)
        );
        assert_eq!(Scope::from_parts(Some(""), None), Err(ScopeError::InvalidScope));
        assert_eq!(
            Scope::from_parts(Some("alice"), None),
            Ok(Scope::User("alice".into()))
        );
    }

    #[test]
    fn username_extraction() {
        assert_eq!(username_from_userid("acct:alice@x.test"), Some("alice"));
        assert_eq!(username_from_userid("alice@x.test"), None);
        assert_eq!(username_from_userid("acct:alice@x@y"), None);
        assert_eq!(username_from_userid("acct:@x.test"), None);
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_uri("HTTPS://X.Test:443/p/"), "https://x.test/p");
        assert_eq!(normalize_uri("https://x.test/p#section"), "https://x.test/p");
        assert_eq!(
            normalize_uri("https://x.test/p?utm_source=feed&id=3"),
            "https://x.test/p?id=3"
        );
        assert_eq!(normalize_uri("https://x.test/p?utm_medium=x"), "https://x.test/p");
        assert_eq!(normalize_uri("https://x.test"), "https://x.test/");
        assert_eq!(normalize_uri("  urn:x-pdf:abc "), "urn:x-pdf:abc");
        assert_eq!(normalize_uri("not a url"), "not a url");
    }

    #[test]
    fn annotation_scope() {
        assert_eq!(
            scope_key_for_annotation(&ann(false, "acct:alice@x.test")).unwrap(),
            "https://x.test/p|u:alice"
        );
        assert_eq!(
            scope_key_for_annotation(&ann(true, "acct:alice@x.test")).unwrap(),
            "https://x.test/p|g:g1"
        );
        assert!(matches!(
            scope_key_for_annotation(&ann(false, "alice")),
            Err(ScopeError::InvalidUserid(_))
        ));
    }

    #[test]
    fn record_keys() {
        assert_eq!(count_key("https://x.test/p|u:alice"), "count|https://x.test/p|u:alice");
        assert_eq!(marker_key("a1"), "ann|a1");
        assert_eq!(profile_key("Bearer t"), "profile|Bearer t");
    }
}
