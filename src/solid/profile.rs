//! WebID profile resolution and storage discovery
//!
//! Profiles are parsed into a triple list and read through named
//! [`ProfileRule`]s. Several vocabularies express the same fact, so each
//! field is backed by a group of rules: storage rules are unioned, name and
//! email rules stop at the first match. Missing data is never an error.

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::solid::client::{SolidClient, TEXT_TURTLE};
use crate::solid::rdf::{vocab, Graph, Node};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Named extraction rule over a profile graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileRule {
    /// `pim:storage`
    PimStorage,
    /// `solid:storageQuota`
    SolidStorageQuota,
    /// Any predicate whose local name starts with `storage`
    StoragePredicate,
    /// `ldp:contains`
    LdpContains,
    /// `foaf:name`
    FoafName,
    /// `vcard:fn`
    VcardFn,
    /// `schema:name`
    SchemaName,
    /// `foaf:mbox`
    FoafMbox,
    /// `vcard:hasEmail`, direct or through `vcard:value`
    VcardHasEmail,
    /// `schema:email`
    SchemaEmail,
    /// `ldp:inbox`
    LdpInbox,
    /// `solid:oidcIssuer`
    OidcIssuer,
}

impl ProfileRule {
    /// Storage root rules, unioned
    pub const STORAGE: [ProfileRule; 4] = [
        Self::PimStorage,
        Self::SolidStorageQuota,
        Self::StoragePredicate,
        Self::LdpContains,
    ];

    /// Display name rules, first match wins
    pub const NAME: [ProfileRule; 3] = [Self::FoafName, Self::VcardFn, Self::SchemaName];

    /// Email rules, first match wins
    pub const EMAIL: [ProfileRule; 3] = [Self::FoafMbox, Self::VcardHasEmail, Self::SchemaEmail];

    /// Values this rule finds in `graph`, in document order
    pub fn apply(&self, graph: &Graph) -> Vec<String> {
        match self {
            Self::PimStorage => iris(graph.objects(vocab::PIM_STORAGE)),
            Self::SolidStorageQuota => iris(graph.objects(vocab::SOLID_STORAGE_QUOTA)),
            Self::StoragePredicate => graph
                .triples()
                .iter()
                .filter(|t| local_name(&t.predicate).starts_with("storage"))
                .filter_map(|t| t.object.as_iri().map(str::to_string))
                .collect(),
            Self::LdpContains => iris(graph.objects(vocab::LDP_CONTAINS)),
            Self::FoafName => literals(graph.objects(vocab::FOAF_NAME)),
            Self::VcardFn => literals(graph.objects(vocab::VCARD_FN)),
            Self::SchemaName => literals(graph.objects(vocab::SCHEMA_NAME)),
            Self::FoafMbox => graph.objects(vocab::FOAF_MBOX).filter_map(email_of).collect(),
            Self::VcardHasEmail => graph
                .objects(vocab::VCARD_HAS_EMAIL)
                .flat_map(|node| match email_of(node) {
                    Some(email) => vec![email],
                    None => graph.objects_of(node, vocab::VCARD_VALUE).filter_map(email_of).collect(),
                })
                .collect(),
            Self::SchemaEmail => graph.objects(vocab::SCHEMA_EMAIL).filter_map(email_of).collect(),
            Self::LdpInbox => iris(graph.objects(vocab::LDP_INBOX)),
            Self::OidcIssuer => iris(graph.objects(vocab::SOLID_OIDC_ISSUER)),
        }
    }

    /// Union of all rules, deduplicated, first occurrence kept
    pub fn union(rules: &[ProfileRule], graph: &Graph) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for value in rules.iter().flat_map(|r| r.apply(graph)) {
            if !out.contains(&value) {
                out.push(value);
            }
        }
        out
    }

    /// First value found by the first rule that matches
    pub fn first_match(rules: &[ProfileRule], graph: &Graph) -> Option<String> {
        rules.iter().find_map(|r| r.apply(graph).into_iter().next())
    }
}

fn iris<'a>(nodes: impl Iterator<Item = &'a Node>) -> Vec<String> {
    nodes.filter_map(|n| n.as_iri().map(str::to_string)).collect()
}

fn literals<'a>(nodes: impl Iterator<Item = &'a Node>) -> Vec<String> {
    nodes
        .filter(|n| matches!(n, Node::Literal { .. }))
        .map(|n| n.value().trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn email_of(node: &Node) -> Option<String> {
    let value = match node {
        Node::Iri(iri) => iri.strip_prefix("mailto:")?,
        Node::Literal { value, .. } => value.strip_prefix("mailto:").unwrap_or(value),
        Node::Blank(_) => return None,
    };
    let value = value.trim();
    value.contains('@').then(|| value.to_string())
}

fn local_name(iri: &str) -> &str {
    iri.rsplit(|c: char| c == '#' || c == '/').next().unwrap_or(iri)
}

/// WebID Profile information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebIdProfile {
    /// The WebID IRI
    pub web_id: String,
    /// Profile document URL (WebID without fragment)
    pub profile_url: String,
    /// Display name
    pub name: Option<String>,
    /// Contact email
    pub email: Option<String>,
    /// Storage roots, deduplicated
    pub storage: Vec<String>,
    /// Inbox location
    pub inbox: Option<String>,
    /// OIDC issuer
    pub oidc_issuer: Option<String>,
}

impl WebIdProfile {
    /// Apply every rule to a parsed profile document
    pub fn from_graph(web_id: &str, graph: &Graph) -> Self {
        Self {
            web_id: web_id.to_string(),
            profile_url: profile_document_url(web_id),
            name: ProfileRule::first_match(&ProfileRule::NAME, graph),
            email: ProfileRule::first_match(&ProfileRule::EMAIL, graph),
            storage: ProfileRule::union(&ProfileRule::STORAGE, graph),
            inbox: ProfileRule::LdpInbox.apply(graph).into_iter().next(),
            oidc_issuer: ProfileRule::OidcIssuer.apply(graph).into_iter().next(),
        }
    }

    /// Get the storage location, or return error if none was declared
    pub fn require_storage(&self) -> Result<&str> {
        self.storage
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::invalid_input(format!("WebID profile {} declares no storage", self.web_id)))
    }

    /// Get the OIDC issuer, or return error if not set
    pub fn require_oidc_issuer(&self) -> Result<&str> {
        self.oidc_issuer
            .as_deref()
            .ok_or_else(|| Error::invalid_input(format!("WebID profile {} declares no OIDC issuer", self.web_id)))
    }
}

/// WebID from ID token claims: `webid` first, then `sub`
pub fn extract_web_id(claims: &Value) -> Option<String> {
    ["webid", "sub"].iter().find_map(|claim| {
        claims
            .get(*claim)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// WebID with its fragment removed
pub fn profile_document_url(web_id: &str) -> String {
    web_id.split('#').next().unwrap_or(web_id).to_string()
}

/// Guess the pod root from a WebID when the profile declares no storage
///
/// `https://host/alice/profile/card#me` gives `https://host/alice/`; a WebID
/// without a nested path gives the server root.
pub fn derive_pod_root(web_id: &str) -> Option<String> {
    let url = Url::parse(web_id).ok()?;
    let host = url.host_str()?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = url.path().trim_start_matches('/');
    let first = match path.split_once('/') {
        Some((segment, _)) if !segment.is_empty() => format!("{}/", segment),
        _ => String::new(),
    };

    Some(format!("{}://{}/{}", url.scheme(), authority, first))
}

/// Fetches and reads WebID profiles
pub struct ProfileResolver {
    client: Arc<SolidClient>,
}

impl ProfileResolver {
    /// Create a resolver over the request layer
    pub fn new(client: Arc<SolidClient>) -> Self {
        Self { client }
    }

    /// WebID from ID token claims
    pub fn extract_web_id(&self, claims: &Value) -> Option<String> {
        extract_web_id(claims)
    }

    /// Fetch and parse the profile document of `web_id`
    ///
    /// The request is authenticated when the identity has credentials and
    /// anonymous otherwise.
    pub async fn fetch_profile(&self, identity: &Identity, web_id: &str) -> Result<WebIdProfile> {
        let url = profile_document_url(web_id);

        let response = match self.client.get(identity, &url, TEXT_TURTLE).await {
            Err(Error::NoCredentialsAvailable { .. }) => self.client.get_public(&url, TEXT_TURTLE).await?,
            other => other?,
        };
        let response = response.error_for_status()?;

        let graph = Graph::parse(&response.body, response.header("content-type"), &url);
        let profile = WebIdProfile::from_graph(web_id, &graph);

        tracing::debug!(
            web_id = %web_id,
            triples = graph.len(),
            storage = profile.storage.len(),
            "Parsed WebID profile"
        );

        Ok(profile)
    }

    /// Storage root for the identity's WebID: declared storage, else the derived root
    pub async fn storage_root(&self, identity: &Identity) -> Result<String> {
        let web_id = identity
            .web_id
            .as_deref()
            .ok_or_else(|| Error::invalid_input(format!("Identity {} has no WebID", identity.scope)))?;

        match self.fetch_profile(identity, web_id).await {
            Ok(profile) => {
                if let Some(storage) = profile.storage.into_iter().next() {
                    return Ok(ensure_trailing_slash(storage));
                }
            }
            Err(e) => tracing::warn!(web_id = %web_id, error = %e, "Profile fetch failed, deriving pod root"),
        }

        derive_pod_root(web_id).ok_or_else(|| Error::invalid_input(format!("Cannot derive a pod root from {}", web_id)))
    }
}

fn ensure_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}
