//! Web Access Control: permission probes and owner policies
//!
//! Write access is read from the `WAC-Allow` header of a HEAD response and
//! fails closed. Owner policies are generated deterministically and PUT to
//! the resource's policy document, replacing what was there.

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::solid::client::TEXT_TURTLE;
use crate::solid::rdf::{checked_iri, vocab, Graph, Node};
use crate::solid::resources::ResourceOrchestrator;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Principal named `user` in `WAC-Allow`: the authenticated agent
pub const USER_PRINCIPAL: &str = "user";

/// Access mode of an authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessMode {
    /// acl:Read
    Read,
    /// acl:Write
    Write,
    /// acl:Append
    Append,
    /// acl:Control
    Control,
}

impl AccessMode {
    /// Mode from a `WAC-Allow` token such as `write`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "append" => Some(Self::Append),
            "control" => Some(Self::Control),
            _ => None,
        }
    }

    /// Mode from its `acl:` IRI
    pub fn from_iri(iri: &str) -> Option<Self> {
        iri.strip_prefix(vocab::ACL).and_then(Self::from_name)
    }

    /// Local name in the `acl:` vocabulary
    pub fn local_name(&self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Append => "Append",
            Self::Control => "Control",
        }
    }

    /// Whether the mode allows adding data
    pub fn allows_writing(&self) -> bool {
        matches!(self, Self::Write | Self::Append)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acl:{}", self.local_name())
    }
}

/// Parsed `WAC-Allow` header: principal to permitted modes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WacAllow {
    principals: BTreeMap<String, BTreeSet<AccessMode>>,
}

impl WacAllow {
    /// Parse `user="read write", public="read"`; unknown modes are ignored
    pub fn parse(header: &str) -> Self {
        static GROUP: OnceLock<Option<Regex>> = OnceLock::new();
        let Some(re) = GROUP
            .get_or_init(|| Regex::new(r#"([A-Za-z]+)\s*=\s*"([^"]*)""#).ok())
            .as_ref()
        else {
            return Self::default();
        };

        let mut principals: BTreeMap<String, BTreeSet<AccessMode>> = BTreeMap::new();
        for caps in re.captures_iter(header) {
            let (Some(principal), Some(modes)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            principals
                .entry(principal.as_str().to_ascii_lowercase())
                .or_default()
                .extend(modes.as_str().split_whitespace().filter_map(AccessMode::from_name));
        }
        Self { principals }
    }

    /// Modes granted to `principal`
    pub fn modes(&self, principal: &str) -> Option<&BTreeSet<AccessMode>> {
        self.principals.get(principal)
    }

    /// Whether the authenticated agent may write or append
    pub fn user_can_write(&self) -> bool {
        self.modes(USER_PRINCIPAL)
            .map(|modes| modes.iter().any(AccessMode::allows_writing))
            .unwrap_or(false)
    }
}

/// One `acl:Authorization`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclAuthorization {
    /// Fragment identifier inside the policy document
    pub id: String,
    /// `acl:agent` WebIDs
    pub agents: Vec<String>,
    /// `acl:accessTo` targets
    pub access_to: Vec<String>,
    /// `acl:default` targets
    pub default: Vec<String>,
    /// Granted modes
    pub modes: BTreeSet<AccessMode>,
}

impl AclAuthorization {
    fn write_turtle(&self, out: &mut String) {
        out.push_str(&format!("<#{}>\n    a acl:Authorization;\n", self.id));
        for agent in &self.agents {
            out.push_str(&format!("    acl:agent <{}>;\n", agent));
        }
        for target in &self.access_to {
            out.push_str(&format!("    acl:accessTo <{}>;\n", target));
        }
        for target in &self.default {
            out.push_str(&format!("    acl:default <{}>;\n", target));
        }
        let modes: Vec<String> = self.modes.iter().map(ToString::to_string).collect();
        out.push_str(&format!("    acl:mode {}.\n", modes.join(", ")));
    }
}

/// Policy document of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPolicy {
    /// Resource the policy controls
    pub resource: String,
    /// Authorizations in document order
    pub authorizations: Vec<AclAuthorization>,
}

impl AclPolicy {
    /// Owner policy: Read, Write and Control for `web_id`, inherited by
    /// children when `resource` is a container, plus Read and Append for an
    /// optional integration agent
    ///
    /// Fails with [`Error::InvalidInput`] when any of the IRIs cannot be
    /// written verbatim into the document.
    pub fn owner(resource: &str, web_id: &str, integration: Option<&str>) -> Result<Self> {
        checked_iri(resource)?;
        checked_iri(web_id)?;
        if let Some(agent) = integration {
            checked_iri(agent)?;
        }

        let default = if resource.ends_with('/') {
            vec![resource.to_string()]
        } else {
            Vec::new()
        };

        let mut authorizations = vec![AclAuthorization {
            id: "owner".to_string(),
            agents: vec![web_id.to_string()],
            access_to: vec![resource.to_string()],
            default: default.clone(),
            modes: [AccessMode::Read, AccessMode::Write, AccessMode::Control].into_iter().collect(),
        }];

        if let Some(agent) = integration {
            authorizations.push(AclAuthorization {
                id: "integration".to_string(),
                agents: vec![agent.to_string()],
                access_to: vec![resource.to_string()],
                default,
                modes: [AccessMode::Read, AccessMode::Append].into_iter().collect(),
            });
        }

        Ok(Self {
            resource: resource.to_string(),
            authorizations,
        })
    }

    /// Serialize as Turtle; equal policies give identical documents
    pub fn to_turtle(&self) -> String {
        let mut out = format!("@prefix acl: <{}>.\n", vocab::ACL);
        for authorization in &self.authorizations {
            out.push('\n');
            authorization.write_turtle(&mut out);
        }
        out
    }

    /// Read the authorizations of a parsed policy document
    pub fn parse(resource: &str, graph: &Graph) -> Self {
        let iris = |subject: &Node, predicate: &str| -> Vec<String> {
            graph
                .objects_of(subject, predicate)
                .filter_map(Node::as_iri)
                .map(str::to_string)
                .collect()
        };

        let authorizations = graph
            .subjects_of_type(vocab::ACL_AUTHORIZATION)
            .map(|subject| AclAuthorization {
                id: subject
                    .value()
                    .rsplit_once('#')
                    .map(|(_, id)| id.to_string())
                    .unwrap_or_else(|| subject.value().to_string()),
                agents: iris(subject, vocab::ACL_AGENT),
                access_to: iris(subject, vocab::ACL_ACCESS_TO),
                default: iris(subject, vocab::ACL_DEFAULT),
                modes: graph
                    .objects_of(subject, vocab::ACL_MODE)
                    .filter_map(Node::as_iri)
                    .filter_map(AccessMode::from_iri)
                    .collect(),
            })
            .collect();

        Self {
            resource: resource.to_string(),
            authorizations,
        }
    }

    /// Union of modes granted to `agent`
    pub fn modes_for(&self, agent: &str) -> BTreeSet<AccessMode> {
        self.authorizations
            .iter()
            .filter(|a| a.agents.iter().any(|x| x == agent))
            .flat_map(|a| a.modes.iter().copied())
            .collect()
    }
}

/// Policy document location derived from the resource URL
pub fn companion_acl_url(resource: &str) -> String {
    let resource = resource.split('#').next().unwrap_or(resource);
    format!("{}.acl", resource)
}

/// Reads and grants access-control policies
pub struct AclManager {
    resources: Arc<ResourceOrchestrator>,
}

impl AclManager {
    /// Create a manager over the resource layer
    pub fn new(resources: Arc<ResourceOrchestrator>) -> Self {
        Self { resources }
    }

    /// Policy document URL: the advertised `rel="acl"` link, else the derived companion
    pub async fn acl_location(&self, identity: &Identity, resource: &str) -> Result<String> {
        let response = self.resources.head(identity, resource).await?;
        Ok(response.link("acl").unwrap_or_else(|| companion_acl_url(resource)))
    }

    /// HEAD the resource and parse its `WAC-Allow` header
    ///
    /// A non-success status or a failed request is a
    /// [`Error::PermissionCheckFailed`]; a missing header parses as no modes.
    pub async fn probe_permissions(&self, identity: &Identity, resource: &str) -> Result<WacAllow> {
        let response = self
            .resources
            .head(identity, resource)
            .await
            .map_err(|e| Error::PermissionCheckFailed {
                url: resource.to_string(),
                reason: e.to_string(),
            })?;

        if !response.is_success() {
            return Err(Error::PermissionCheckFailed {
                url: resource.to_string(),
                reason: format!("status {}", response.status),
            });
        }

        let header = response.header("wac-allow").unwrap_or_default();
        tracing::debug!(url = %resource, wac_allow = %header, "Permission probe");
        Ok(WacAllow::parse(header))
    }

    /// Whether the current principal may write or append; `false` when it
    /// cannot be confirmed
    pub async fn check_write_permission(&self, identity: &Identity, resource: &str) -> bool {
        match self.probe_permissions(identity, resource).await {
            Ok(allow) => allow.user_can_write(),
            Err(e) => {
                tracing::warn!(scope = %identity.scope, error = %e, "Cannot confirm write permission");
                false
            }
        }
    }

    /// PUT an owner policy for `web_id` over `resource`; returns the policy URL
    #[tracing::instrument(skip_all, fields(scope = %identity.scope))]
    pub async fn grant_owner_permission(
        &self,
        identity: &Identity,
        resource: &str,
        web_id: &str,
        integration: Option<&str>,
    ) -> Result<String> {
        let policy = AclPolicy::owner(resource, web_id, integration)?;
        let acl_url = self.acl_location(identity, resource).await?;

        self.resources
            .put_resource(identity, &acl_url, TEXT_TURTLE, policy.to_turtle())
            .await?;

        tracing::info!(scope = %identity.scope, acl_url = %acl_url, web_id = %web_id, "Owner policy written");
        Ok(acl_url)
    }

    /// Grant the owner policy unless write access is already confirmed
    pub async fn ensure_permission(&self, identity: &Identity, resource: &str, web_id: &str) -> Result<bool> {
        if self.check_write_permission(identity, resource).await {
            return Ok(true);
        }

        match self.grant_owner_permission(identity, resource, web_id, None).await {
            Ok(_) => Ok(true),
            Err(Error::Remote { status, url, .. }) => {
                tracing::error!(status = status, url = %url, "Policy update rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Current policy of `resource`, `None` when it has no policy document
    pub async fn read_policy(&self, identity: &Identity, resource: &str) -> Result<Option<AclPolicy>> {
        let acl_url = self.acl_location(identity, resource).await?;
        match self.resources.get_resource(identity, &acl_url).await {
            Ok(response) => {
                let graph = Graph::parse(&response.body, response.header("content-type"), &acl_url);
                Ok(Some(AclPolicy::parse(resource, &graph)))
            }
            Err(Error::Remote { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
