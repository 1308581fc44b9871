//! Core type definitions for the Solid delegate client

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable key for one (tenant, end-user) pair
///
/// Every persisted value (tokens, keys, registrations) is namespaced by this
/// key so that two tenants can never observe each other's material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityScope(String);

impl IdentityScope {
    /// Scope used when no identity context exists
    pub const PROCESS_DEFAULT: &'static str = "default";

    /// Build the scope for a tenant and user
    ///
    /// `%` and `:` are escaped in both parts so distinct pairs never share a
    /// key.
    pub fn new(tenant_id: impl AsRef<str>, user_id: impl AsRef<str>) -> Self {
        Self(format!(
            "{}:{}",
            escape_scope_part(tenant_id.as_ref()),
            escape_scope_part(user_id.as_ref())
        ))
    }

    /// Scope for process-wide material that is not tied to an end-user
    pub fn process_default() -> Self {
        Self(Self::PROCESS_DEFAULT.to_string())
    }

    /// Wrap an already-formatted scope key
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape_scope_part(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

impl fmt::Display for IdentityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of an entry inside an LDP container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Another container (URL ends with `/`)
    Container,
    /// A leaf document
    Resource,
}

impl EntryKind {
    /// Classify a URL by its trailing slash
    pub fn from_url(url: &str) -> Self {
        if url.ends_with('/') {
            Self::Container
        } else {
            Self::Resource
        }
    }
}

/// Lower-case, dash-separated form of a display name, used for pod slugs
/// and store keys
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

/// Last non-empty path segment of a URL, or `"Root Storage"` for a bare host
pub fn last_segment(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let path = without_query
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or(""))
        .unwrap_or(without_query);

    path.split('/')
        .filter(|s| !s.is_empty())
        .last()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Root Storage".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_is_tenant_and_user() {
        let scope = IdentityScope::new("company-1", "user-9");
        assert_eq!(scope.as_str(), "company-1:user-9");
        assert_ne!(scope, IdentityScope::process_default());
    }

    #[test]
    fn test_scope_separator_in_ids_does_not_collide() {
        assert_ne!(IdentityScope::new("a:b", "c"), IdentityScope::new("a", "b:c"));
        assert_ne!(IdentityScope::new("acme:ops", "alice"), IdentityScope::new("acme", "ops:alice"));
        assert_ne!(IdentityScope::new("a%3Ab", "c"), IdentityScope::new("a:b", "c"));
        assert_eq!(IdentityScope::new("a:b", "c").as_str(), "a%3Ab:c");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Fleet Pod"), "my-fleet-pod");
        assert_eq!(slugify("  Fleetbase!! "), "fleetbase");
        assert_eq!(slugify("a__b"), "a-b");
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("https://pod.example/alice/vehicles/"), "vehicles");
        assert_eq!(last_segment("https://pod.example/alice/v1.ttl"), "v1.ttl");
        assert_eq!(last_segment("https://pod.example/"), "Root Storage");
    }

    #[test]
    fn test_entry_kind_from_url() {
        assert_eq!(EntryKind::from_url("https://x/a/"), EntryKind::Container);
        assert_eq!(EntryKind::from_url("https://x/a"), EntryKind::Resource);
    }
}
