//! Minimal RDF triple list over `oxigraph`'s parsers
//!
//! Profile, container and policy documents are parsed into a flat list of
//! triples; extraction rules run over this list instead of raw text.

use crate::error::{Error, Result};
use oxigraph::io::{RdfFormat, RdfParser};
use oxigraph::model::{Subject, Term};

/// Vocabulary terms used across the crate
pub mod vocab {
    /// rdf:type
    pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

    /// ldp: namespace
    pub const LDP: &str = "http://www.w3.org/ns/ldp#";
    /// ldp:contains
    pub const LDP_CONTAINS: &str = "http://www.w3.org/ns/ldp#contains";
    /// ldp:inbox
    pub const LDP_INBOX: &str = "http://www.w3.org/ns/ldp#inbox";
    /// ldp:BasicContainer
    pub const LDP_BASIC_CONTAINER: &str = "http://www.w3.org/ns/ldp#BasicContainer";
    /// ldp:Container
    pub const LDP_CONTAINER: &str = "http://www.w3.org/ns/ldp#Container";

    /// pim:storage
    pub const PIM_STORAGE: &str = "http://www.w3.org/ns/pim/space#storage";
    /// solid: namespace
    pub const SOLID: &str = "http://www.w3.org/ns/solid/terms#";
    /// solid:storageQuota
    pub const SOLID_STORAGE_QUOTA: &str = "http://www.w3.org/ns/solid/terms#storageQuota";
    /// solid:oidcIssuer
    pub const SOLID_OIDC_ISSUER: &str = "http://www.w3.org/ns/solid/terms#oidcIssuer";

    /// foaf:name
    pub const FOAF_NAME: &str = "http://xmlns.com/foaf/0.1/name";
    /// foaf:mbox
    pub const FOAF_MBOX: &str = "http://xmlns.com/foaf/0.1/mbox";
    /// vcard:fn
    pub const VCARD_FN: &str = "http://www.w3.org/2006/vcard/ns#fn";
    /// vcard:hasEmail
    pub const VCARD_HAS_EMAIL: &str = "http://www.w3.org/2006/vcard/ns#hasEmail";
    /// vcard:value
    pub const VCARD_VALUE: &str = "http://www.w3.org/2006/vcard/ns#value";
    /// schema:name
    pub const SCHEMA_NAME: &str = "http://schema.org/name";
    /// schema:email
    pub const SCHEMA_EMAIL: &str = "http://schema.org/email";

    /// acl: namespace
    pub const ACL: &str = "http://www.w3.org/ns/auth/acl#";
    /// acl:Authorization
    pub const ACL_AUTHORIZATION: &str = "http://www.w3.org/ns/auth/acl#Authorization";
    /// acl:agent
    pub const ACL_AGENT: &str = "http://www.w3.org/ns/auth/acl#agent";
    /// acl:accessTo
    pub const ACL_ACCESS_TO: &str = "http://www.w3.org/ns/auth/acl#accessTo";
    /// acl:default
    pub const ACL_DEFAULT: &str = "http://www.w3.org/ns/auth/acl#default";
    /// acl:mode
    pub const ACL_MODE: &str = "http://www.w3.org/ns/auth/acl#mode";

    /// dcterms:title
    pub const DCTERMS_TITLE: &str = "http://purl.org/dc/terms/title";
    /// dcterms:description
    pub const DCTERMS_DESCRIPTION: &str = "http://purl.org/dc/terms/description";
    /// dcterms:created
    pub const DCTERMS_CREATED: &str = "http://purl.org/dc/terms/created";
}

/// Subject or object of a triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    /// Absolute IRI
    Iri(String),
    /// Blank node label
    Blank(String),
    /// Literal value with its datatype IRI
    Literal {
        /// Lexical value
        value: String,
        /// Datatype IRI
        datatype: String,
    },
}

impl Node {
    /// IRI value, if this is an IRI
    pub fn as_iri(&self) -> Option<&str> {
        match self {
            Self::Iri(iri) => Some(iri),
            _ => None,
        }
    }

    /// Lexical value of an IRI, blank node or literal
    pub fn value(&self) -> &str {
        match self {
            Self::Iri(v) | Self::Blank(v) => v,
            Self::Literal { value, .. } => value,
        }
    }
}

/// One parsed statement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triple {
    /// Subject
    pub subject: Node,
    /// Predicate IRI
    pub predicate: String,
    /// Object
    pub object: Node,
}

/// Flat list of triples from one document
#[derive(Debug, Clone, Default)]
pub struct Graph {
    triples: Vec<Triple>,
}

impl Graph {
    /// Parse `body` as the RDF syntax named by `content_type` (Turtle when
    /// unknown), resolving relative IRIs against `base`
    ///
    /// Parsing stops at the first syntax error; triples read before it are kept.
    pub fn parse(body: &str, content_type: Option<&str>, base: &str) -> Self {
        let format = content_type
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .and_then(RdfFormat::from_media_type)
            .unwrap_or(RdfFormat::Turtle);

        let parser = match RdfParser::from_format(format).with_base_iri(base) {
            Ok(parser) => parser,
            Err(e) => {
                tracing::debug!(base = %base, error = %e, "Invalid base IRI, parsing without one");
                RdfParser::from_format(format)
            }
        };

        let mut triples = Vec::new();
        for quad in parser.for_reader(body.as_bytes()) {
            let quad = match quad {
                Ok(quad) => quad,
                Err(e) => {
                    tracing::debug!(base = %base, error = %e, "Stopping at RDF syntax error");
                    break;
                }
            };

            let subject = match quad.subject {
                Subject::NamedNode(n) => Node::Iri(n.into_string()),
                Subject::BlankNode(b) => Node::Blank(b.into_string()),
                #[allow(unreachable_patterns)]
                _ => continue,
            };
            let object = match quad.object {
                Term::NamedNode(n) => Node::Iri(n.into_string()),
                Term::BlankNode(b) => Node::Blank(b.into_string()),
                Term::Literal(l) => Node::Literal {
                    value: l.value().to_string(),
                    datatype: l.datatype().as_str().to_string(),
                },
                #[allow(unreachable_patterns)]
                _ => continue,
            };

            triples.push(Triple {
                subject,
                predicate: quad.predicate.into_string(),
                object,
            });
        }

        Self { triples }
    }

    /// Build a graph from already known triples
    pub fn from_triples(triples: Vec<Triple>) -> Self {
        Self { triples }
    }

    /// All triples
    pub fn triples(&self) -> &[Triple] {
        &self.triples
    }

    /// Number of triples
    pub fn len(&self) -> usize {
        self.triples.len()
    }

    /// Whether nothing was parsed
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Objects of `predicate` for any subject
    pub fn objects<'a>(&'a self, predicate: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.triples
            .iter()
            .filter(move |t| t.predicate == predicate)
            .map(|t| &t.object)
    }

    /// Objects of `predicate` for one subject
    pub fn objects_of<'a>(&'a self, subject: &'a Node, predicate: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.triples
            .iter()
            .filter(move |t| &t.subject == subject && t.predicate == predicate)
            .map(|t| &t.object)
    }

    /// Subjects typed as `class`
    pub fn subjects_of_type<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.triples
            .iter()
            .filter(move |t| t.predicate == vocab::RDF_TYPE && t.object.as_iri() == Some(class))
            .map(|t| &t.subject)
    }
}

/// Escape a string for a Turtle double-quoted literal
pub fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Whether `value` holds a character that cannot appear inside `<...>`
pub fn has_forbidden_iri_char(value: &str) -> bool {
    value
        .chars()
        .any(|c| matches!(c, '<' | '>' | '"' | '{' | '}' | '|' | '^' | '`' | '\\') || c.is_whitespace() || c.is_control())
}

/// Absolute IRI safe to write between `<` and `>` in Turtle
pub fn checked_iri(value: &str) -> Result<&str> {
    if has_forbidden_iri_char(value) {
        return Err(Error::invalid_input(format!("'{}' is not a valid IRI", value)));
    }
    url::Url::parse(value).map_err(|e| Error::invalid_input(format!("'{}' is not a valid IRI: {}", value, e)))?;
    Ok(value)
}
