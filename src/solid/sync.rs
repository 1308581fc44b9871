//! Import of domain entities into a pod
//!
//! Each resource type has a static projection: an RDF class and the record
//! fields written as properties. Imports are best effort; a failing item is
//! recorded and the rest of the batch still runs.

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::solid::client::TEXT_TURTLE;
use crate::solid::rdf::{escape_literal, has_forbidden_iri_char};
use crate::solid::resources::{container_url, ResourceOrchestrator};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;

/// Namespace of imported classes and properties
pub const NAMESPACE: &str = "http://fleetbase.io/ns/";

/// Datatype a projected field is written as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain string literal
    Text,
    /// `xsd:integer`
    Integer,
    /// `xsd:decimal`
    Decimal,
    /// `xsd:boolean`
    Boolean,
    /// `xsd:dateTime`
    Timestamp,
}

/// One projected property
#[derive(Debug, Clone, Copy)]
pub struct ProjectedField {
    /// Property local name under [`NAMESPACE`]
    pub property: &'static str,
    /// Record field it is read from
    pub field: &'static str,
    /// Datatype
    pub kind: FieldKind,
}

const fn field(property: &'static str, field: &'static str, kind: FieldKind) -> ProjectedField {
    ProjectedField { property, field, kind }
}

/// How records of one resource type become documents
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    /// Resource type, also the container name
    pub resource_type: &'static str,
    /// RDF class local name
    pub class: &'static str,
    /// Projected fields in document order
    pub fields: &'static [ProjectedField],
}

static PROJECTIONS: [Projection; 4] = [
    Projection {
        resource_type: "vehicles",
        class: "Vehicle",
        fields: &[
            field("name", "name", FieldKind::Text),
            field("make", "make", FieldKind::Text),
            field("model", "model", FieldKind::Text),
            field("year", "year", FieldKind::Integer),
            field("vin", "vin", FieldKind::Text),
            field("plate_number", "plate_number", FieldKind::Text),
            field("status", "status", FieldKind::Text),
            field("created_at", "created_at", FieldKind::Timestamp),
            field("updated_at", "updated_at", FieldKind::Timestamp),
        ],
    },
    Projection {
        resource_type: "drivers",
        class: "Driver",
        fields: &[
            field("name", "name", FieldKind::Text),
            field("email", "email", FieldKind::Text),
            field("phone", "phone", FieldKind::Text),
            field("license_number", "drivers_license_number", FieldKind::Text),
            field("status", "status", FieldKind::Text),
            field("created_at", "created_at", FieldKind::Timestamp),
            field("updated_at", "updated_at", FieldKind::Timestamp),
        ],
    },
    Projection {
        resource_type: "contacts",
        class: "Contact",
        fields: &[
            field("name", "name", FieldKind::Text),
            field("email", "email", FieldKind::Text),
            field("phone", "phone", FieldKind::Text),
            field("type", "type", FieldKind::Text),
            field("created_at", "created_at", FieldKind::Timestamp),
            field("updated_at", "updated_at", FieldKind::Timestamp),
        ],
    },
    Projection {
        resource_type: "orders",
        class: "Order",
        fields: &[
            field("tracking_number", "public_id", FieldKind::Text),
            field("status", "status", FieldKind::Text),
            field("type", "type", FieldKind::Text),
            field("scheduled_at", "scheduled_at", FieldKind::Timestamp),
            field("created_at", "created_at", FieldKind::Timestamp),
            field("updated_at", "updated_at", FieldKind::Timestamp),
        ],
    },
];

/// Projection of a resource type
pub fn projection(resource_type: &str) -> Option<&'static Projection> {
    PROJECTIONS.iter().find(|p| p.resource_type == resource_type)
}

/// Resource types that can be imported
pub fn supported_types() -> impl Iterator<Item = &'static str> {
    PROJECTIONS.iter().map(|p| p.resource_type)
}

/// Typed value of a record field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// String
    Text(String),
    /// Whole number
    Integer(i64),
    /// Fractional number
    Decimal(f64),
    /// Flag
    Boolean(bool),
    /// Point in time
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Convert to the datatype the projection asks for
    pub fn coerce(self, kind: FieldKind) -> std::result::Result<Self, String> {
        match (kind, self) {
            (FieldKind::Text, Self::Text(s)) => Ok(Self::Text(s)),
            (FieldKind::Text, Self::Integer(n)) => Ok(Self::Text(n.to_string())),
            (FieldKind::Text, Self::Decimal(n)) => Ok(Self::Text(n.to_string())),
            (FieldKind::Text, Self::Boolean(b)) => Ok(Self::Text(b.to_string())),
            (FieldKind::Text, Self::Timestamp(t)) => Ok(Self::Text(t.to_rfc3339())),

            (FieldKind::Integer, Self::Integer(n)) => Ok(Self::Integer(n)),
            (FieldKind::Integer, Self::Decimal(n)) if n.fract() == 0.0 => Ok(Self::Integer(n as i64)),
            (FieldKind::Integer, Self::Text(s)) => s
                .trim()
                .parse()
                .map(Self::Integer)
                .map_err(|_| format!("'{}' is not an integer", s)),

            (FieldKind::Decimal, Self::Decimal(n)) => Ok(Self::Decimal(n)),
            (FieldKind::Decimal, Self::Integer(n)) => Ok(Self::Decimal(n as f64)),
            (FieldKind::Decimal, Self::Text(s)) => s
                .trim()
                .parse()
                .map(Self::Decimal)
                .map_err(|_| format!("'{}' is not a decimal", s)),

            (FieldKind::Boolean, Self::Boolean(b)) => Ok(Self::Boolean(b)),
            (FieldKind::Boolean, Self::Text(s)) => match s.trim() {
                "true" | "1" => Ok(Self::Boolean(true)),
                "false" | "0" => Ok(Self::Boolean(false)),
                other => Err(format!("'{}' is not a boolean", other)),
            },

            (FieldKind::Timestamp, Self::Timestamp(t)) => Ok(Self::Timestamp(t)),
            (FieldKind::Timestamp, Self::Text(s)) => DateTime::parse_from_rfc3339(s.trim())
                .map(|t| Self::Timestamp(t.with_timezone(&Utc)))
                .map_err(|e| format!("'{}' is not a timestamp: {}", s, e)),

            (kind, value) => Err(format!("{:?} cannot be written as {:?}", value, kind)),
        }
    }

    /// Turtle literal
    pub fn to_turtle(&self) -> String {
        match self {
            Self::Text(s) => format!("\"{}\"", escape_literal(s)),
            Self::Integer(n) => format!("\"{}\"^^xsd:integer", n),
            Self::Decimal(n) => format!("\"{}\"^^xsd:decimal", n),
            Self::Boolean(b) => format!("\"{}\"^^xsd:boolean", b),
            Self::Timestamp(t) => format!(
                "\"{}\"^^xsd:dateTime",
                t.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        }
    }
}

/// Record supplied by the domain-data source
pub trait ImportRecord {
    /// Public identifier, used as the document name
    fn public_id(&self) -> Option<String>;

    /// Value of a field; `None` for missing, null or empty values
    fn field(&self, name: &str) -> Option<FieldValue>;
}

impl ImportRecord for Value {
    fn public_id(&self) -> Option<String> {
        match self.get("public_id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match self.get(name)? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(FieldValue::Integer(i)),
                None => n.as_f64().map(FieldValue::Decimal),
            },
            other => Some(FieldValue::Text(other.to_string())),
        }
    }
}

/// Turtle document for one record of `resource_type`
pub fn serialize_record(resource_type: &str, record: &dyn ImportRecord) -> Result<String> {
    let projection = projection(resource_type)
        .ok_or_else(|| Error::invalid_input(format!("Unsupported resource type '{}'", resource_type)))?;
    let public_id = record
        .public_id()
        .ok_or_else(|| Error::invalid_input("Record has no public_id"))?;
    document_name(&public_id)?;

    let mut turtle = String::new();
    turtle.push_str("@prefix xsd: <http://www.w3.org/2001/XMLSchema#> .\n");
    turtle.push_str(&format!("@prefix fb: <{}> .\n\n", NAMESPACE));
    turtle.push_str(&format!("<{}{}/{}>\n", NAMESPACE, resource_type, public_id));
    turtle.push_str(&format!("    a fb:{} ;\n", projection.class));
    turtle.push_str(&format!("    fb:id \"{}\"", escape_literal(&public_id)));

    for projected in projection.fields {
        let Some(value) = record.field(projected.field) else {
            continue;
        };
        let value = value
            .coerce(projected.kind)
            .map_err(|reason| Error::invalid_input(format!("Field '{}': {}", projected.field, reason)))?;
        turtle.push_str(&format!(" ;\n    fb:{} {}", projected.property, value.to_turtle()));
    }
    turtle.push_str(" .\n");

    Ok(turtle)
}

fn document_name(public_id: &str) -> Result<String> {
    if public_id.contains(['/', '#', '?']) || has_forbidden_iri_char(public_id) {
        return Err(Error::invalid_input(format!("public_id '{}' is not a valid document name", public_id)));
    }
    Ok(format!("{}.ttl", public_id))
}

/// Result of importing one resource type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcome {
    /// Documents written
    pub count: usize,
    /// Item id to failure message
    pub errors: BTreeMap<String, String>,
}

/// Result of importing several resource types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBatch {
    /// Resource type to documents written
    pub imported: BTreeMap<String, usize>,
    /// Resource type to the error that stopped it
    pub errors: BTreeMap<String, String>,
    /// `{type}/{item}` to per-item failure message
    pub item_errors: BTreeMap<String, String>,
    /// Documents written across all types
    pub total_count: usize,
}

/// Supplies entities to import
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Up to `limit` records of `resource_type`
    async fn entities(&self, resource_type: &str, limit: usize) -> Result<Vec<Value>>;
}

/// Writes entities into a pod as typed documents
pub struct ImportEngine {
    resources: Arc<ResourceOrchestrator>,
    cap: usize,
}

impl ImportEngine {
    /// Create an engine; `cap` bounds how many records of one type are imported
    pub fn new(resources: Arc<ResourceOrchestrator>, cap: usize) -> Self {
        Self { resources, cap }
    }

    /// Default per-type cap
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Import up to `per_type_cap` entities into `{pod}/{resource_type}/`
    pub async fn import_entities<R: ImportRecord + Sync>(
        &self,
        identity: &Identity,
        pod_url: &str,
        resource_type: &str,
        entities: &[R],
        per_type_cap: usize,
    ) -> Result<ImportOutcome> {
        if projection(resource_type).is_none() {
            return Err(Error::invalid_input(format!("Unsupported resource type '{}'", resource_type)));
        }

        let mut outcome = ImportOutcome::default();
        if entities.is_empty() {
            return Ok(outcome);
        }

        let container = match self.resources.ensure_container(identity, pod_url, resource_type).await {
            Ok(url) => url,
            Err(e @ (Error::NoCredentialsAvailable { .. } | Error::ProofGenerationFailed(_))) => return Err(e),
            Err(e) => {
                tracing::warn!(resource_type = %resource_type, error = %e, "Container not created, writing anyway");
                format!("{}{}/", container_url(pod_url), resource_type)
            }
        };

        for (index, entity) in entities.iter().take(per_type_cap).enumerate() {
            let position = format!("item{}", index + 1);

            match self.write_one(identity, &container, resource_type, entity).await {
                Ok(()) => outcome.count += 1,
                Err(e) => {
                    // Repeated ids keep their own entry
                    let item = match entity.public_id() {
                        Some(id) if outcome.errors.contains_key(&id) => format!("{}:{}", position, id),
                        Some(id) => id,
                        None => position,
                    };
                    let failure = Error::ImportPartialFailure {
                        item: item.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(resource_type = %resource_type, error = %failure, "Item not imported");
                    outcome.errors.insert(item, failure.to_string());
                }
            }
        }

        tracing::info!(
            scope = %identity.scope,
            resource_type = %resource_type,
            count = outcome.count,
            failed = outcome.errors.len(),
            "Resource type imported"
        );
        Ok(outcome)
    }

    async fn write_one<R: ImportRecord + Sync>(
        &self,
        identity: &Identity,
        container: &str,
        resource_type: &str,
        entity: &R,
    ) -> Result<()> {
        let turtle = serialize_record(resource_type, entity)?;
        let public_id = entity
            .public_id()
            .ok_or_else(|| Error::invalid_input("Record has no public_id"))?;
        let url = format!("{}{}", container, document_name(&public_id)?);
        self.resources.put_resource(identity, &url, TEXT_TURTLE, turtle).await?;
        Ok(())
    }

    /// Import every listed type from `source`, aggregating per-type results
    pub async fn import_resources(
        &self,
        identity: &Identity,
        pod_url: &str,
        resource_types: &[&str],
        source: &dyn EntitySource,
    ) -> ImportBatch {
        let mut batch = ImportBatch::default();

        for resource_type in resource_types {
            let span = tracing::info_span!("import", scope = %identity.scope, resource_type = %resource_type);
            let result = async {
                let entities = source.entities(resource_type, self.cap).await?;
                self.import_entities(identity, pod_url, resource_type, &entities, self.cap)
                    .await
            }
            .instrument(span)
            .await;

            match result {
                Ok(outcome) => {
                    batch.total_count += outcome.count;
                    batch.imported.insert(resource_type.to_string(), outcome.count);
                    for (item, reason) in outcome.errors {
                        batch.item_errors.insert(format!("{}/{}", resource_type, item), reason);
                    }
                }
                Err(e) => {
                    tracing::error!(resource_type = %resource_type, error = %e, "Resource type import failed");
                    batch.errors.insert(resource_type.to_string(), e.to_string());
                }
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityRepository, TokenSet};
    use crate::solid::account::AccountClient;
    use crate::solid::client::SolidClient;
    use crate::solid::dpop::DPoPManager;
    use crate::solid::profile::ProfileResolver;
    use crate::solid::rdf::{vocab, Graph, Node};
    use crate::solid::token::TokenResolver;
    use crate::storage::MemoryCredentialStore;
    use crate::vault::SecretVault;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn engine(issuer: &str, cap: usize) -> ImportEngine {
        let store = Arc::new(MemoryCredentialStore::new());
        let vault = SecretVault::generate();
        let http = reqwest::Client::new();
        let dpop = Arc::new(DPoPManager::new(store.clone(), vault.clone()));
        let tokens = Arc::new(TokenResolver::new(http.clone(), dpop, vault.clone(), issuer));
        let client = Arc::new(SolidClient::new(http.clone(), tokens));
        let profiles = Arc::new(ProfileResolver::new(client.clone()));
        let accounts = Arc::new(AccountClient::new(http, vault, IdentityRepository::new(store), issuer));
        ImportEngine::new(Arc::new(ResourceOrchestrator::new(client, profiles, accounts)), cap)
    }

    fn identity() -> Identity {
        let mut identity = Identity::new("acme", "alice");
        identity.token_set = Some(TokenSet::new("AT1", "DPoP", None));
        identity
    }

    fn vehicles() -> Vec<Value> {
        (1..=5)
            .map(|i| {
                json!({
                    "public_id": format!("item{}", i),
                    "name": format!("Truck {}", i),
                    "year": 2020 + i,
                    "created_at": if i == 3 { "not-a-date".to_string() } else { "2024-01-02T03:04:05Z".to_string() },
                })
            })
            .collect()
    }

    #[test]
    fn test_serialize_vehicle() {
        let record = json!({"public_id": "veh_1", "name": "Truck \"7\"", "year": "2021", "status": ""});
        let turtle = serialize_record("vehicles", &record).unwrap();

        let graph = Graph::parse(&turtle, Some(TEXT_TURTLE), "https://pod.example/alice/vehicles/veh_1.ttl");
        let subject = Node::Iri(format!("{}vehicles/veh_1", NAMESPACE));
        let class = format!("{}Vehicle", NAMESPACE);
        assert_eq!(graph.subjects_of_type(&class).count(), 1);

        let year = format!("{}year", NAMESPACE);
        let years: Vec<_> = graph.objects_of(&subject, &year).collect();
        assert_eq!(
            years,
            vec![&Node::Literal {
                value: "2021".to_string(),
                datatype: "http://www.w3.org/2001/XMLSchema#integer".to_string()
            }]
        );
        let status = format!("{}status", NAMESPACE);
        assert_eq!(graph.objects_of(&subject, &status).count(), 0);
        assert!(graph.objects(vocab::RDF_TYPE).count() == 1);
    }

    #[test]
    fn test_serialize_rejects_bad_timestamp_and_unknown_type() {
        let record = json!({"public_id": "x", "created_at": "yesterday"});
        assert!(serialize_record("vehicles", &record).is_err());
        assert!(serialize_record("invoices", &json!({"public_id": "x"})).is_err());
        assert!(serialize_record("drivers", &json!({"name": "no id"})).is_err());
    }

    #[test]
    fn test_serialize_rejects_public_id_that_breaks_the_subject() {
        for id in ["v1> fb:status \"hijacked\" . <x", "v 1", "v1/../admin", "v1|x"] {
            let record = json!({"public_id": id, "name": "Truck"});
            assert!(
                matches!(serialize_record("vehicles", &record), Err(Error::InvalidInput(_))),
                "{} accepted",
                id
            );
        }
    }

    #[test]
    fn test_projection_table() {
        let types: Vec<_> = supported_types().collect();
        assert_eq!(types, vec!["vehicles", "drivers", "contacts", "orders"]);
        assert_eq!(projection("drivers").map(|p| p.class), Some("Driver"));
    }

    #[tokio::test]
    async fn test_failing_item_does_not_abort_batch() {
        let mut server = Server::new_async().await;
        let _container = server.mock("HEAD", "/alice/vehicles/").with_status(200).create_async().await;
        let writes = server
            .mock("PUT", Matcher::Regex(r"^/alice/vehicles/item[1245]\.ttl$".to_string()))
            .match_header("content-type", TEXT_TURTLE)
            .with_status(201)
            .expect(4)
            .create_async()
            .await;

        let engine = engine(&server.url(), 100);
        let outcome = engine
            .import_entities(&identity(), &format!("{}/alice/", server.url()), "vehicles", &vehicles(), 100)
            .await
            .unwrap();

        assert_eq!(outcome.count, 4);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors["item3"].contains("not-a-date"));
        writes.assert_async().await;
    }

    #[tokio::test]
    async fn test_repeated_failing_ids_keep_separate_errors() {
        let mut server = Server::new_async().await;
        let _container = server.mock("HEAD", "/alice/vehicles/").with_status(200).create_async().await;
        let writes = server.mock("PUT", Matcher::Any).expect(0).create_async().await;

        let records = vec![
            json!({"public_id": "dup", "created_at": "first-bad"}),
            json!({"public_id": "dup", "created_at": "second-bad"}),
        ];
        let engine = engine(&server.url(), 100);
        let outcome = engine
            .import_entities(&identity(), &format!("{}/alice/", server.url()), "vehicles", &records, 100)
            .await
            .unwrap();

        assert_eq!(outcome.count, 0);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors["dup"].contains("first-bad"));
        assert!(outcome.errors["item2:dup"].contains("second-bad"));
        assert!(outcome.errors["item2:dup"].starts_with("Import of item2:dup failed"));
        writes.assert_async().await;
    }

    #[tokio::test]
    async fn test_cap_limits_items() {
        let mut server = Server::new_async().await;
        let _container = server.mock("HEAD", "/alice/vehicles/").with_status(200).create_async().await;
        let writes = server
            .mock("PUT", Matcher::Regex(r"^/alice/vehicles/".to_string()))
            .with_status(201)
            .expect(2)
            .create_async()
            .await;

        let engine = engine(&server.url(), 100);
        let outcome = engine
            .import_entities(&identity(), &format!("{}/alice/", server.url()), "vehicles", &vehicles(), 2)
            .await
            .unwrap();
        assert_eq!(outcome.count, 2);
        writes.assert_async().await;
    }

    struct FixedSource;

    #[async_trait]
    impl EntitySource for FixedSource {
        async fn entities(&self, resource_type: &str, _limit: usize) -> Result<Vec<Value>> {
            match resource_type {
                "contacts" => Ok(vec![json!({"public_id": "c1", "name": "Dana"})]),
                "orders" => Err(Error::other("order registry offline")),
                _ => Ok(Vec::new()),
            }
        }
    }

    #[tokio::test]
    async fn test_import_resources_aggregates() {
        let mut server = Server::new_async().await;
        let _container = server.mock("HEAD", "/alice/contacts/").with_status(200).create_async().await;
        let _write = server.mock("PUT", "/alice/contacts/c1.ttl").with_status(201).create_async().await;

        let engine = engine(&server.url(), 10);
        let batch = engine
            .import_resources(
                &identity(),
                &format!("{}/alice/", server.url()),
                &["contacts", "orders", "drivers"],
                &FixedSource,
            )
            .await;

        assert_eq!(batch.total_count, 1);
        assert_eq!(batch.imported.get("contacts"), Some(&1));
        assert_eq!(batch.imported.get("drivers"), Some(&0));
        assert!(batch.errors["orders"].contains("offline"));
    }
}
