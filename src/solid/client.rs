//! Authenticated HTTP request layer
//!
//! Every request resolves a token and mints a fresh DPoP proof bound to its
//! own method and URL. Responses are read fully so callers can attach the
//! status and body to errors.

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::solid::token::TokenResolver;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::sync::{Arc, OnceLock};
use url::Url;

/// Media type of Turtle documents
pub const TEXT_TURTLE: &str = "text/turtle";

/// One entry of a `Link` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHeader {
    /// Target URI, as written in the header
    pub target: String,
    /// Relation type
    pub rel: String,
}

/// Parse a `Link` header value into its entries
pub fn parse_link_header(value: &str) -> Vec<LinkHeader> {
    static LINK: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = LINK
        .get_or_init(|| Regex::new(r#"<([^>]*)>((?:\s*;\s*[^;,]+)*)"#).ok())
        .as_ref()
    else {
        return Vec::new();
    };
    static REL: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(rel_re) = REL
        .get_or_init(|| Regex::new(r#"rel\s*=\s*"?([^";,]+)"?"#).ok())
        .as_ref()
    else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for caps in re.captures_iter(value) {
        let target = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let params = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        if let Some(rel) = rel_re.captures(params).and_then(|c| c.get(1)) {
            for rel in rel.as_str().split_whitespace() {
                links.push(LinkHeader {
                    target: target.clone(),
                    rel: rel.to_string(),
                });
            }
        }
    }
    links
}

/// Fully read response of a Solid server
#[derive(Debug, Clone)]
pub struct SolidResponse {
    /// Requested URL
    pub url: String,
    /// HTTP status
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: String,
}

impl SolidResponse {
    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All `Link` header entries
    pub fn links(&self) -> Vec<LinkHeader> {
        self.headers
            .get_all("link")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_link_header)
            .collect()
    }

    /// Target of the first link with relation `rel`, resolved against the request URL
    pub fn link(&self, rel: &str) -> Option<String> {
        self.links()
            .into_iter()
            .find(|l| l.rel == rel)
            .map(|l| resolve_against(&self.url, &l.target))
    }

    /// `Location` header resolved against the request URL
    pub fn location(&self) -> Option<String> {
        self.header("location").map(|loc| resolve_against(&self.url, loc))
    }

    /// Turn a non-success response into [`Error::Remote`]
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::remote(self.status, self.url, self.body))
        }
    }
}

/// Resolve a possibly relative reference against `base`
pub fn resolve_against(base: &str, reference: &str) -> String {
    Url::parse(base)
        .and_then(|b| b.join(reference))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| reference.to_string())
}

/// DPoP-authenticated client for pod resources
pub struct SolidClient {
    http: reqwest::Client,
    tokens: Arc<TokenResolver>,
}

impl SolidClient {
    /// Create a request layer
    pub fn new(http: reqwest::Client, tokens: Arc<TokenResolver>) -> Self {
        Self { http, tokens }
    }

    /// Send an authenticated request on behalf of `identity`
    pub async fn send(
        &self,
        identity: &Identity,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<String>,
    ) -> Result<SolidResponse> {
        let auth = self.tokens.authorize_request(identity, method.as_str(), url).await?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .headers(headers)
            .header("Authorization", auth.authorization)
            .header("DPoP", auth.dpop);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;

        tracing::debug!(
            scope = %identity.scope,
            method = %method,
            url = %url,
            status = status,
            "Solid request completed"
        );

        Ok(SolidResponse {
            url: url.to_string(),
            status,
            headers,
            body,
        })
    }

    /// Unauthenticated GET, for public documents such as WebID profiles
    pub async fn get_public(&self, url: &str, accept: &str) -> Result<SolidResponse> {
        let response = self.http.get(url).header("Accept", accept).send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(SolidResponse {
            url: url.to_string(),
            status,
            headers,
            body,
        })
    }

    /// GET with an `Accept` header
    pub async fn get(&self, identity: &Identity, url: &str, accept: &str) -> Result<SolidResponse> {
        self.send(identity, Method::GET, url, header_map(&[("accept", accept)]), None)
            .await
    }

    /// HEAD
    pub async fn head(&self, identity: &Identity, url: &str) -> Result<SolidResponse> {
        self.send(identity, Method::HEAD, url, HeaderMap::new(), None).await
    }

    /// PUT a document, overwriting any existing one
    pub async fn put(&self, identity: &Identity, url: &str, content_type: &str, body: String) -> Result<SolidResponse> {
        self.send(
            identity,
            Method::PUT,
            url,
            header_map(&[("content-type", content_type)]),
            Some(body),
        )
        .await
    }

    /// POST with caller-provided headers
    pub async fn post(&self, identity: &Identity, url: &str, headers: HeaderMap, body: Option<String>) -> Result<SolidResponse> {
        self.send(identity, Method::POST, url, headers, body).await
    }

    /// DELETE
    pub async fn delete(&self, identity: &Identity, url: &str) -> Result<SolidResponse> {
        self.send(identity, Method::DELETE, url, HeaderMap::new(), None).await
    }
}

/// Build a header map from static names; invalid values are skipped
pub fn header_map(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.append(HeaderName::from_static(name), value);
        }
    }
    headers
}
