//! Account management API of the storage server
//!
//! Logs in with a service-account email and password, issues a
//! client-credentials pair for the identity's WebID and manages pods through
//! the account's advertised controls.

use crate::error::{Error, Result};
use crate::identity::{ClientCredentials, Identity, IdentityRepository, ServiceAccount};
use crate::vault::SecretVault;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use url::Url;

/// Token name used when issuing client credentials
pub const DEFAULT_CREDENTIALS_NAME: &str = "fleetbase-client";

/// Client-credentials pair as returned by the account API
pub struct IssuedCredentials {
    /// Client id
    pub id: String,
    /// Client secret
    pub secret: SecretString,
    /// URL of the credential resource
    pub resource: Option<String>,
}

impl std::fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("id", &self.id)
            .field("secret", &"***REDACTED***")
            .field("resource", &self.resource)
            .finish()
    }
}

/// Client for `{issuer}/.account/`
pub struct AccountClient {
    http: reqwest::Client,
    vault: SecretVault,
    identities: IdentityRepository,
    default_issuer: String,
}

impl AccountClient {
    /// Create an account client
    pub fn new(
        http: reqwest::Client,
        vault: SecretVault,
        identities: IdentityRepository,
        default_issuer: impl Into<String>,
    ) -> Self {
        Self {
            http,
            vault,
            identities,
            default_issuer: default_issuer.into(),
        }
    }

    /// Log in with email and password; returns the account token
    pub async fn login(&self, issuer: &str, email: &str, password: &str) -> Result<SecretString> {
        let controls = self.controls(issuer, None).await?;
        let login_url = control(&controls, &["password", "login"])?;

        let response = self
            .http
            .post(&login_url)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let body = read_json(response, "login").await?;

        let token = body
            .get("authorization")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::account("Login response has no authorization token"))?;

        tracing::info!(issuer = %issuer, "Account login succeeded");
        Ok(SecretString::from(token.to_string()))
    }

    /// Issue a client-credentials pair bound to `web_id`
    pub async fn create_client_credentials(
        &self,
        issuer: &str,
        account_token: &SecretString,
        web_id: &str,
        name: &str,
    ) -> Result<IssuedCredentials> {
        let controls = self.controls(issuer, Some(account_token)).await?;
        let url = control(&controls, &["account", "clientCredentials"])?;

        let response = self
            .http
            .post(&url)
            .header("Authorization", account_authorization(account_token))
            .json(&json!({ "name": name, "webId": web_id }))
            .send()
            .await?;
        let body = read_json(response, "client credentials").await?;

        let id = body.get("id").and_then(Value::as_str);
        let secret = body.get("secret").and_then(Value::as_str);
        let (Some(id), Some(secret)) = (id, secret) else {
            return Err(Error::account("Client credentials response is missing id or secret"));
        };

        let resource = body.get("resource").and_then(Value::as_str).map(str::to_string);
        tracing::info!(issuer = %issuer, client_id = %id, "Issued client credentials");

        Ok(IssuedCredentials {
            id: id.to_string(),
            secret: SecretString::from(secret.to_string()),
            resource,
        })
    }

    /// Log in, issue client credentials and store both on the identity
    #[tracing::instrument(skip_all, fields(scope = %identity.scope))]
    pub async fn setup_credentials(
        &self,
        identity: &mut Identity,
        issuer: &str,
        email: &str,
        password: &str,
        web_id: &str,
    ) -> Result<()> {
        tracing::info!(scope = %identity.scope, web_id = %web_id, "Setting up service-account credentials");

        let token = self.login(issuer, email, password).await?;
        let issued = self
            .create_client_credentials(issuer, &token, web_id, DEFAULT_CREDENTIALS_NAME)
            .await?;

        let mut updated = identity.clone();
        updated.service_account = Some(ServiceAccount {
            email: email.to_string(),
            password: self.vault.seal(password)?,
        });
        updated.client_credentials = Some(ClientCredentials {
            client_id: issued.id,
            secret: self.vault.seal(issued.secret.expose_secret())?,
            resource_url: issued.resource,
        });
        if updated.web_id.is_none() {
            updated.web_id = Some(web_id.to_string());
        }

        self.identities.save(&mut updated).await?;
        *identity = updated;
        Ok(())
    }

    /// Whether the identity holds a client-credentials pair
    pub fn has_credentials(&self, identity: &Identity) -> bool {
        identity.has_client_credentials()
    }

    /// Whether the identity can log in to the account API
    pub fn has_service_account(&self, identity: &Identity) -> bool {
        identity.service_account.is_some()
    }

    /// Pod URLs registered on the identity's account
    pub async fn account_pods(&self, identity: &Identity) -> Result<Vec<String>> {
        let (issuer, token) = self.session(identity).await?;
        let controls = self.controls(&issuer, Some(&token)).await?;
        let url = control(&controls, &["account", "pod"])?;

        let response = self
            .http
            .get(&url)
            .header("Authorization", account_authorization(&token))
            .send()
            .await?;
        let body = read_json(response, "pod listing").await?;

        let pods = match body.get("pods") {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            _ => Vec::new(),
        };
        Ok(pods)
    }

    /// Create a pod named `name` on the identity's account; returns its URL
    pub async fn create_account_pod(&self, identity: &Identity, name: &str) -> Result<String> {
        let (issuer, token) = self.session(identity).await?;
        let controls = self.controls(&issuer, Some(&token)).await?;
        let url = control(&controls, &["account", "pod"])?;

        let response = self
            .http
            .post(&url)
            .header("Authorization", account_authorization(&token))
            .json(&json!({ "name": name }))
            .send()
            .await?;
        let body = read_json(response, "pod creation").await?;

        let pod = body
            .get("pod")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/{}/", issuer.trim_end_matches('/'), name));

        tracing::info!(scope = %identity.scope, pod = %pod, "Created pod through account API");
        Ok(pod)
    }

    /// Account server for an identity: the WebID's origin, else its issuer
    pub fn issuer_for(&self, identity: &Identity) -> String {
        identity
            .web_id
            .as_deref()
            .and_then(origin_of)
            .or_else(|| identity.issuer.clone())
            .unwrap_or_else(|| self.default_issuer.clone())
    }

    async fn session(&self, identity: &Identity) -> Result<(String, SecretString)> {
        let account = identity
            .service_account
            .as_ref()
            .ok_or_else(|| Error::account(format!("Identity {} has no service account", identity.scope)))?;
        let password = self.vault.open(&account.password)?;
        let issuer = self.issuer_for(identity);
        let token = self.login(&issuer, &account.email, password.expose_secret()).await?;
        Ok((issuer, token))
    }

    async fn controls(&self, issuer: &str, token: Option<&SecretString>) -> Result<Value> {
        let url = format!("{}/.account/", issuer.trim_end_matches('/'));
        let mut request = self.http.get(&url).header("Accept", "application/json");
        if let Some(token) = token {
            request = request.header("Authorization", account_authorization(token));
        }

        let body = read_json(request.send().await?, "account index").await?;
        body.get("controls")
            .cloned()
            .ok_or_else(|| Error::account(format!("{} returned no controls", url)))
    }
}

fn account_authorization(token: &SecretString) -> String {
    format!("CSS-Account-Token {}", token.expose_secret())
}

fn control(controls: &Value, path: &[&str]) -> Result<String> {
    path.iter()
        .try_fold(controls, |node, key| node.get(*key))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::account(format!("Account control {} not advertised", path.join("."))))
}

async fn read_json(response: reqwest::Response, what: &str) -> Result<Value> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        tracing::error!(status = %status, body = %body, "Account API {} failed", what);
        return Err(Error::account(format!("{} failed with {}: {}", what, status, body)));
    }
    serde_json::from_str(&body).map_err(|e| Error::account(format!("{} returned invalid JSON: {}", what, e)))
}

/// `scheme://host[:port]` of a URL
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCredentialStore;
    use mockito::{Matcher, Server};
    use std::sync::Arc;

    async fn mock_account(server: &mut Server) -> Vec<mockito::Mock> {
        let base = server.url();
        let anonymous = server
            .mock("GET", "/.account/")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .with_body(json!({"controls": {"password": {"login": format!("{}/.account/login/password/", base)}}}).to_string())
            .create_async()
            .await;
        let authenticated = server
            .mock("GET", "/.account/")
            .match_header("authorization", "CSS-Account-Token ACC")
            .with_status(200)
            .with_body(
                json!({"controls": {
                    "password": {"login": format!("{}/.account/login/password/", base)},
                    "account": {
                        "clientCredentials": format!("{}/.account/client-credentials/", base),
                        "pod": format!("{}/.account/pod/", base),
                    }
                }})
                .to_string(),
            )
            .create_async()
            .await;
        let login = server
            .mock("POST", "/.account/login/password/")
            .match_body(Matcher::Json(json!({"email": "ops@example.org", "password": "pw"})))
            .with_status(200)
            .with_body(r#"{"authorization":"ACC"}"#)
            .create_async()
            .await;
        vec![anonymous, authenticated, login]
    }

    fn client(issuer: &str) -> (AccountClient, IdentityRepository, SecretVault) {
        let vault = SecretVault::generate();
        let identities = IdentityRepository::new(Arc::new(MemoryCredentialStore::new()));
        (
            AccountClient::new(reqwest::Client::new(), vault.clone(), identities.clone(), issuer),
            identities,
            vault,
        )
    }

    #[tokio::test]
    async fn test_setup_credentials() {
        let mut server = Server::new_async().await;
        let _account = mock_account(&mut server).await;
        let web_id = format!("{}/alice/profile/card#me", server.url());
        let _cc = server
            .mock("POST", "/.account/client-credentials/")
            .match_header("authorization", "CSS-Account-Token ACC")
            .match_body(Matcher::PartialJson(json!({"webId": web_id})))
            .with_status(200)
            .with_body(r#"{"id":"fleetbase-client_1","secret":"s3cret","resource":"http://x/cc/1"}"#)
            .create_async()
            .await;

        let (accounts, identities, vault) = client(&server.url());
        let mut identity = identities.find_or_create("acme", "alice").await.unwrap();
        assert!(!accounts.has_credentials(&identity));

        accounts
            .setup_credentials(&mut identity, &server.url(), "ops@example.org", "pw", &web_id)
            .await
            .unwrap();

        assert!(accounts.has_credentials(&identity));
        let creds = identity.client_credentials.as_ref().unwrap();
        assert_eq!(creds.client_id, "fleetbase-client_1");
        assert_eq!(vault.open(&creds.secret).unwrap().expose_secret(), "s3cret");

        let stored = identities.find(&identity.scope).await.unwrap().unwrap();
        assert!(stored.service_account.is_some());
    }

    #[tokio::test]
    async fn test_login_failure_is_account_error() {
        let mut server = Server::new_async().await;
        let _index = server
            .mock("GET", "/.account/")
            .with_status(200)
            .with_body(json!({"controls": {"password": {"login": format!("{}/login", server.url())}}}).to_string())
            .create_async()
            .await;
        let _login = server
            .mock("POST", "/login")
            .with_status(403)
            .with_body("bad credentials")
            .create_async()
            .await;

        let (accounts, _, _) = client(&server.url());
        let err = accounts.login(&server.url(), "a@b.c", "nope").await.unwrap_err();
        assert!(matches!(err, Error::AccountApi(ref m) if m.contains("bad credentials")));
    }

    #[tokio::test]
    async fn test_account_pods_and_creation() {
        let mut server = Server::new_async().await;
        let _account = mock_account(&mut server).await;
        let base = server.url();
        let _list = server
            .mock("GET", "/.account/pod/")
            .with_status(200)
            .with_body(json!({"pods": {format!("{}/alice/", base): format!("{}/.account/x/", base)}}).to_string())
            .create_async()
            .await;
        let _create = server
            .mock("POST", "/.account/pod/")
            .match_body(Matcher::Json(json!({"name": "fleet"})))
            .with_status(200)
            .with_body(json!({"pod": format!("{}/fleet/", base)}).to_string())
            .create_async()
            .await;

        let (accounts, _, vault) = client(&base);
        let mut identity = Identity::new("acme", "alice");
        identity.web_id = Some(format!("{}/alice/profile/card#me", base));
        identity.service_account = Some(ServiceAccount {
            email: "ops@example.org".to_string(),
            password: vault.seal("pw").unwrap(),
        });

        assert_eq!(accounts.account_pods(&identity).await.unwrap(), vec![format!("{}/alice/", base)]);
        assert_eq!(
            accounts.create_account_pod(&identity, "fleet").await.unwrap(),
            format!("{}/fleet/", base)
        );
    }

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("http://localhost:3000/alice/profile/card#me").as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(origin_of("https://pod.example/x").as_deref(), Some("https://pod.example"));
    }
}
