//! Pod, container and resource orchestration
//!
//! Container creation walks an explicit, ordered list of strategies because
//! servers disagree on which request shape they accept. The strategy that
//! won is reported back to the caller; when none wins, every attempt is
//! attached to the error.

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::solid::account::AccountClient;
use crate::solid::client::{header_map, SolidClient, SolidResponse, TEXT_TURTLE};
use crate::solid::profile::ProfileResolver;
use crate::solid::rdf::{escape_literal, vocab, Graph, Node};
use crate::types::{last_segment, slugify, EntryKind};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// `Link` value marking a request body as a basic container
pub const BASIC_CONTAINER_LINK: &str = r#"<http://www.w3.org/ns/ldp#BasicContainer>; rel="type""#;

/// Statuses accepted as a successful creation
const CREATED_STATUSES: [u16; 4] = [200, 201, 202, 204];

/// Way a container was (or was attempted to be) created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationStrategy {
    /// POST to the parent with `Slug` and a metadata body
    PostMetadata,
    /// POST to the parent with `Slug` and no body
    PostEmpty,
    /// PUT to the final container URL with a metadata body
    PutMetadata,
    /// Pod created through the account API
    AccountApi,
}

impl CreationStrategy {
    /// Order in which container creation is attempted
    pub const CONTAINER_ORDER: [CreationStrategy; 3] = [Self::PostMetadata, Self::PostEmpty, Self::PutMetadata];

    /// Stable tag reported to callers
    pub fn tag(&self) -> &'static str {
        match self {
            Self::PostMetadata => "post_metadata",
            Self::PostEmpty => "post_empty",
            Self::PutMetadata => "put_metadata",
            Self::AccountApi => "account_api",
        }
    }
}

impl fmt::Display for CreationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Outcome of one failed creation strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationAttempt {
    /// Strategy that was tried
    pub strategy: CreationStrategy,
    /// HTTP status, absent when the request never got a response
    pub status: Option<u16>,
    /// Response body or transport error message
    pub body: String,
}

/// Successfully created container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedContainer {
    /// URL of the new container
    pub url: String,
    /// Strategy that succeeded
    pub strategy: CreationStrategy,
}

/// One member of a container listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    /// Absolute URL
    pub url: String,
    /// Last non-empty path segment
    pub name: String,
    /// Container or leaf
    pub kind: EntryKind,
}

impl ContainerEntry {
    fn from_url(url: String) -> Self {
        Self {
            name: last_segment(&url),
            kind: EntryKind::from_url(&url),
            url,
        }
    }
}

/// Where a listed pod was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodSource {
    /// Registered on the service account
    Account,
    /// Storage root of the WebID
    Storage,
    /// Container directly under the storage root
    Container,
}

/// Pod known to an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    /// Pod URL
    pub url: String,
    /// Display name
    pub name: String,
    /// Where it was found
    pub source: PodSource,
}

/// Descriptive triples written into new containers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    /// `dcterms:title`
    pub title: String,
    /// `dcterms:description`
    pub description: Option<String>,
}

impl ContainerMetadata {
    /// Metadata with only a title
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
        }
    }

    /// Turtle body describing the container itself (`<>`)
    pub fn to_turtle(&self, created: DateTime<Utc>) -> String {
        let mut turtle = String::new();
        turtle.push_str(&format!("@prefix dcterms: <http://purl.org/dc/terms/> .\n@prefix ldp: <{}> .\n\n", vocab::LDP));
        turtle.push_str("<> a ldp:BasicContainer, ldp:Container ;\n");
        turtle.push_str(&format!("    dcterms:title \"{}\" ;\n", escape_literal(&self.title)));
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            turtle.push_str(&format!("    dcterms:description \"{}\" ;\n", escape_literal(description)));
        }
        turtle.push_str(&format!(
            "    dcterms:created \"{}\" .\n",
            created.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        turtle
    }
}

/// Container URL with exactly one trailing slash
pub fn container_url(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

/// Pod and container CRUD on behalf of an identity
pub struct ResourceOrchestrator {
    client: Arc<SolidClient>,
    profiles: Arc<ProfileResolver>,
    accounts: Arc<AccountClient>,
}

impl ResourceOrchestrator {
    /// Create an orchestrator
    pub fn new(client: Arc<SolidClient>, profiles: Arc<ProfileResolver>, accounts: Arc<AccountClient>) -> Self {
        Self {
            client,
            profiles,
            accounts,
        }
    }

    /// Create container `name` under `parent_url`, trying each strategy of
    /// [`CreationStrategy::CONTAINER_ORDER`] until one succeeds
    #[tracing::instrument(skip_all, fields(scope = %identity.scope))]
    pub async fn create_container(
        &self,
        identity: &Identity,
        parent_url: &str,
        name: &str,
        metadata: Option<ContainerMetadata>,
    ) -> Result<CreatedContainer> {
        let parent = container_url(parent_url);
        let name = name.trim_matches('/');
        if name.is_empty() {
            return Err(Error::invalid_input("Container name must not be empty"));
        }

        let body = metadata
            .unwrap_or_else(|| ContainerMetadata::titled(name))
            .to_turtle(Utc::now());
        let target = format!("{}{}/", parent, name);
        let mut attempts = Vec::with_capacity(CreationStrategy::CONTAINER_ORDER.len());

        for strategy in CreationStrategy::CONTAINER_ORDER {
            let sent = match strategy {
                CreationStrategy::PostMetadata => {
                    self.post_container(identity, &parent, name, Some(body.clone())).await
                }
                CreationStrategy::PostEmpty => self.post_container(identity, &parent, name, None).await,
                CreationStrategy::PutMetadata => {
                    let headers = header_map(&[("content-type", TEXT_TURTLE), ("link", BASIC_CONTAINER_LINK)]);
                    self.client
                        .send(identity, Method::PUT, &target, headers, Some(body.clone()))
                        .await
                }
                CreationStrategy::AccountApi => continue,
            };

            match sent {
                Ok(response) if CREATED_STATUSES.contains(&response.status) => {
                    let url = response.location().unwrap_or_else(|| target.clone());
                    tracing::info!(
                        scope = %identity.scope,
                        url = %url,
                        strategy = %strategy,
                        "Container created"
                    );
                    return Ok(CreatedContainer { url, strategy });
                }
                Ok(response) => {
                    tracing::debug!(strategy = %strategy, status = response.status, "Container strategy rejected");
                    attempts.push(CreationAttempt {
                        strategy,
                        status: Some(response.status),
                        body: response.body,
                    });
                }
                Err(e) if e.is_transport() => {
                    tracing::debug!(strategy = %strategy, error = %e, "Container strategy failed in transport");
                    attempts.push(CreationAttempt {
                        strategy,
                        status: None,
                        body: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        tracing::error!(scope = %identity.scope, url = %target, "All container creation strategies failed");
        Err(Error::ResourceCreationFailed { url: target, attempts })
    }

    async fn post_container(
        &self,
        identity: &Identity,
        parent: &str,
        name: &str,
        body: Option<String>,
    ) -> Result<SolidResponse> {
        let headers = header_map(&[
            ("content-type", TEXT_TURTLE),
            ("slug", name),
            ("link", BASIC_CONTAINER_LINK),
        ]);
        self.client.post(identity, parent, headers, body).await
    }

    /// Return `{parent}{name}/`, creating it first when a HEAD does not find it
    pub async fn ensure_container(&self, identity: &Identity, parent_url: &str, name: &str) -> Result<String> {
        let target = format!("{}{}/", container_url(parent_url), name.trim_matches('/'));
        let probe = self.client.head(identity, &target).await?;
        if probe.is_success() {
            return Ok(target);
        }
        Ok(self.create_container(identity, parent_url, name, None).await?.url)
    }

    /// Delete a resource; a missing resource counts as deleted
    pub async fn delete_resource(&self, identity: &Identity, url: &str) -> Result<()> {
        let response = self.client.delete(identity, url).await?;
        if response.status == 404 {
            tracing::debug!(url = %url, "Resource already absent");
            return Ok(());
        }
        response.error_for_status()?;
        tracing::info!(scope = %identity.scope, url = %url, "Resource deleted");
        Ok(())
    }

    /// Members of a container, classified by trailing slash
    pub async fn list_contents(&self, identity: &Identity, container: &str) -> Result<Vec<ContainerEntry>> {
        let container = container_url(container);
        let response = self.get_resource(identity, &container).await?;
        let graph = Graph::parse(&response.body, response.header("content-type"), &container);

        let mut seen = HashSet::new();
        let entries = graph
            .objects(vocab::LDP_CONTAINS)
            .filter_map(Node::as_iri)
            .filter(|url| *url != container)
            .filter(|url| seen.insert(url.to_string()))
            .map(|url| ContainerEntry::from_url(url.to_string()))
            .collect();
        Ok(entries)
    }

    /// Create a pod for the identity
    ///
    /// The account API is used when the identity has a service account;
    /// otherwise a container is created under the storage root.
    #[tracing::instrument(skip_all, fields(scope = %identity.scope))]
    pub async fn create_pod(&self, identity: &Identity, name: &str, description: Option<&str>) -> Result<CreatedContainer> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(Error::invalid_input(format!("Pod name '{}' has no usable characters", name)));
        }

        if self.accounts.has_service_account(identity) {
            match self.accounts.create_account_pod(identity, &slug).await {
                Ok(url) => {
                    return Ok(CreatedContainer {
                        url: container_url(&url),
                        strategy: CreationStrategy::AccountApi,
                    })
                }
                Err(e) => tracing::warn!(scope = %identity.scope, error = %e, "Account pod creation failed, using LDP"),
            }
        }

        let root = self.profiles.storage_root(identity).await?;
        let probe = self.client.head(identity, &root).await?;
        if !probe.is_success() {
            tracing::warn!(url = %root, status = probe.status, "Storage root probe did not succeed");
        }

        let metadata = ContainerMetadata {
            title: name.to_string(),
            description: description.map(str::to_string),
        };
        self.create_container(identity, &root, &slug, Some(metadata)).await
    }

    /// Pods on the account, the storage root and the containers directly under it
    pub async fn list_pods(&self, identity: &Identity) -> Result<Vec<PodSummary>> {
        let mut pods = Vec::new();

        if self.accounts.has_service_account(identity) {
            match self.accounts.account_pods(identity).await {
                Ok(urls) => pods.extend(urls.into_iter().map(|url| PodSummary {
                    name: last_segment(&url),
                    url: container_url(&url),
                    source: PodSource::Account,
                })),
                Err(e) => tracing::warn!(scope = %identity.scope, error = %e, "Listing account pods failed"),
            }
        }

        let root = self.profiles.storage_root(identity).await?;
        pods.push(PodSummary {
            name: last_segment(&root),
            url: root.clone(),
            source: PodSource::Storage,
        });

        match self.list_contents(identity, &root).await {
            Ok(entries) => pods.extend(
                entries
                    .into_iter()
                    .filter(|e| e.kind == EntryKind::Container)
                    .map(|e| PodSummary {
                        url: e.url,
                        name: e.name,
                        source: PodSource::Container,
                    }),
            ),
            Err(e) => tracing::debug!(url = %root, error = %e, "Storage root not listable"),
        }

        let mut seen = HashSet::new();
        pods.retain(|p| seen.insert(p.url.clone()));
        Ok(pods)
    }

    /// GET a Turtle document, failing on non-success status
    pub async fn get_resource(&self, identity: &Identity, url: &str) -> Result<SolidResponse> {
        self.client.get(identity, url, TEXT_TURTLE).await?.error_for_status()
    }

    /// PUT a document, failing on non-success status
    pub async fn put_resource(&self, identity: &Identity, url: &str, content_type: &str, body: String) -> Result<SolidResponse> {
        self.client.put(identity, url, content_type, body).await?.error_for_status()
    }

    /// HEAD a resource; the status is left to the caller
    pub async fn head(&self, identity: &Identity, url: &str) -> Result<SolidResponse> {
        self.client.head(identity, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityRepository, TokenSet};
    use crate::solid::dpop::DPoPManager;
    use crate::solid::token::TokenResolver;
    use crate::storage::MemoryCredentialStore;
    use crate::vault::SecretVault;
    use chrono::TimeZone;
    use mockito::{Matcher, Server};

    fn orchestrator(issuer: &str) -> ResourceOrchestrator {
        let store = Arc::new(MemoryCredentialStore::new());
        let vault = SecretVault::generate();
        let http = reqwest::Client::new();
        let dpop = Arc::new(DPoPManager::new(store.clone(), vault.clone()));
        let tokens = Arc::new(TokenResolver::new(http.clone(), dpop, vault.clone(), issuer));
        let client = Arc::new(SolidClient::new(http.clone(), tokens));
        let profiles = Arc::new(ProfileResolver::new(client.clone()));
        let accounts = Arc::new(AccountClient::new(http, vault, IdentityRepository::new(store), issuer));
        ResourceOrchestrator::new(client, profiles, accounts)
    }

    fn identity() -> Identity {
        let mut identity = Identity::new("acme", "alice");
        identity.token_set = Some(TokenSet::new("AT1", "DPoP", None));
        identity
    }

    #[tokio::test]
    async fn test_falls_through_to_put_metadata() {
        let mut server = Server::new_async().await;
        let post_metadata = server
            .mock("POST", "/alice/")
            .match_header("slug", "fleet")
            .match_body(Matcher::Regex("dcterms:title".to_string()))
            .with_status(409)
            .with_body("conflict")
            .create_async()
            .await;
        let post_empty = server
            .mock("POST", "/alice/")
            .match_body(Matcher::Exact(String::new()))
            .with_status(500)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/alice/fleet/")
            .match_header("link", BASIC_CONTAINER_LINK)
            .with_status(201)
            .create_async()
            .await;

        let resources = orchestrator(&server.url());
        let created = resources
            .create_container(&identity(), &format!("{}/alice", server.url()), "fleet", None)
            .await
            .unwrap();

        assert_eq!(created.strategy.tag(), "put_metadata");
        assert_eq!(created.url, format!("{}/alice/fleet/", server.url()));
        post_metadata.assert_async().await;
        post_empty.assert_async().await;
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_first_strategy_uses_location() {
        let mut server = Server::new_async().await;
        let _post = server
            .mock("POST", "/alice/")
            .with_status(201)
            .with_header("location", "/alice/fleet-1/")
            .create_async()
            .await;

        let resources = orchestrator(&server.url());
        let created = resources
            .create_container(&identity(), &format!("{}/alice/", server.url()), "fleet", None)
            .await
            .unwrap();

        assert_eq!(created.strategy, CreationStrategy::PostMetadata);
        assert_eq!(created.url, format!("{}/alice/fleet-1/", server.url()));
    }

    #[tokio::test]
    async fn test_all_strategies_failing_records_three_attempts() {
        let mut server = Server::new_async().await;
        let _post = server
            .mock("POST", "/alice/")
            .with_status(500)
            .with_body("boom")
            .expect(2)
            .create_async()
            .await;
        let _put = server
            .mock("PUT", "/alice/fleet/")
            .with_status(403)
            .with_body("forbidden")
            .create_async()
            .await;

        let resources = orchestrator(&server.url());
        let err = resources
            .create_container(&identity(), &format!("{}/alice/", server.url()), "fleet", None)
            .await
            .unwrap_err();

        match err {
            Error::ResourceCreationFailed { attempts, .. } => {
                let strategies: Vec<_> = attempts.iter().map(|a| a.strategy).collect();
                assert_eq!(strategies, CreationStrategy::CONTAINER_ORDER.to_vec());
                assert_eq!(attempts[2].status, Some(403));
                assert_eq!(attempts[2].body, "forbidden");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_abort_creation() {
        let server = Server::new_async().await;
        let resources = orchestrator(&server.url());
        let err = resources
            .create_container(&Identity::new("acme", "bob"), &format!("{}/bob/", server.url()), "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCredentialsAvailable { .. }));
    }

    #[tokio::test]
    async fn test_delete_treats_404_as_success() {
        let mut server = Server::new_async().await;
        let _gone = server.mock("DELETE", "/alice/gone.ttl").with_status(404).create_async().await;
        let _denied = server.mock("DELETE", "/alice/locked.ttl").with_status(403).create_async().await;

        let resources = orchestrator(&server.url());
        let id = identity();
        resources
            .delete_resource(&id, &format!("{}/alice/gone.ttl", server.url()))
            .await
            .unwrap();
        let err = resources
            .delete_resource(&id, &format!("{}/alice/locked.ttl", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_list_contents_classifies_and_dedups() {
        let mut server = Server::new_async().await;
        let _listing = server
            .mock("GET", "/alice/")
            .with_status(200)
            .with_header("content-type", "text/turtle")
            .with_body(
                "@prefix ldp: <http://www.w3.org/ns/ldp#>.\n<> ldp:contains <vehicles/>, <notes.ttl>, <vehicles/>.",
            )
            .create_async()
            .await;

        let resources = orchestrator(&server.url());
        let entries = resources
            .list_contents(&identity(), &format!("{}/alice/", server.url()))
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "vehicles");
        assert_eq!(entries[0].kind, EntryKind::Container);
        assert_eq!(entries[1].name, "notes.ttl");
        assert_eq!(entries[1].kind, EntryKind::Resource);
    }

    #[test]
    fn test_metadata_turtle_parses() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let metadata = ContainerMetadata {
            title: "Fleet \"A\"".to_string(),
            description: Some("Vehicles".to_string()),
        };
        let turtle = metadata.to_turtle(created);
        assert!(turtle.contains("2024-05-01T12:00:00Z"));

        let graph = Graph::parse(&turtle, Some(TEXT_TURTLE), "https://pod.example/alice/fleet/");
        let titles: Vec<_> = graph.objects(vocab::DCTERMS_TITLE).map(Node::value).collect();
        assert_eq!(titles, vec!["Fleet \"A\""]);
        assert_eq!(graph.subjects_of_type(vocab::LDP_BASIC_CONTAINER).count(), 1);
    }

    #[test]
    fn test_container_url() {
        assert_eq!(container_url("https://x/a"), "https://x/a/");
        assert_eq!(container_url("https://x/a//"), "https://x/a/");
    }
}
