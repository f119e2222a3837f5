//! Reusable auth strategies for providers. Concrete providers stay outside
//! the runtime; these helpers cover the exchange mechanics they share, over
//! the abstract transport.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::{form_urlencoded, Url};

use common::{
	errors::{codes, ServiceError},
	grants::normalize_grants,
	provider::{AuthGrant, BeginAuthRequest, Transport, TransportRequest, TransportResponse},
};

pub const OAUTH2_PAYLOAD_FORMAT: &str = "oauth2_token";
pub const API_KEY_PAYLOAD_FORMAT: &str = "api_key";

#[derive(Debug, Clone)]
pub struct OAuth2Config {
	pub client_id: String,
	pub client_secret: String,
	pub authorize_url: String,
	pub token_url: String,
}

/// Token endpoint response per RFC 6749 §5.1.
#[derive(Deserialize, Debug, Clone)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	token_type: Option<String>,
	#[serde(default)]
	expires_in: Option<i64>,
	#[serde(default)]
	scope: Option<String>,
}

/// The credential material held by an OAuth2-backed connection. Serialized
/// as the encrypted payload; refresh flows parse it back out.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OAuth2Token {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	pub token_type: String,
	#[serde(default)]
	pub scope: Vec<String>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
}

impl OAuth2Token {
	fn from_response(response: &TransportResponse, now: DateTime<Utc>) -> Result<Self, ServiceError> {
		if !response.is_success() {
			return Err(ServiceError::auth(
				codes::PROVIDER_AUTH_FAILED,
				format!("token endpoint returned {}", response.status),
			));
		}

		let parsed: TokenResponse = serde_json::from_slice(&response.body).map_err(|e| {
			ServiceError::external(
				codes::PROVIDER_AUTH_FAILED,
				format!("token endpoint payload unreadable: {e}"),
			)
		})?;

		Ok(Self {
			access_token: parsed.access_token,
			refresh_token: parsed.refresh_token,
			token_type: parsed.token_type.unwrap_or_else(|| "bearer".to_owned()),
			scope: parsed
				.scope
				.map(|scope| normalize_grants(scope.split_whitespace().map(str::to_owned)))
				.unwrap_or_default(),
			expires_at: parsed.expires_in.map(|seconds| now + Duration::seconds(seconds)),
		})
	}

	pub fn to_payload(&self) -> Result<Vec<u8>, ServiceError> {
		serde_json::to_vec(self).map_err(|e| ServiceError::internal(e.to_string()))
	}

	pub fn from_payload(payload: &[u8]) -> Result<Self, ServiceError> {
		serde_json::from_slice(payload).map_err(|e| {
			ServiceError::internal(format!("credential payload unreadable: {e}"))
		})
	}

	/// Lift into the provider contract once the account identity is known
	pub fn into_grant(self, external_account_id: impl Into<String>) -> AuthGrant {
		let refreshable = self.refresh_token.is_some();
		AuthGrant {
			external_account_id: external_account_id.into(),
			granted_scopes: self.scope.clone(),
			token_type: self.token_type.clone(),
			expires_at: self.expires_at,
			rotates_at: None,
			refreshable,
			payload_format: OAUTH2_PAYLOAD_FORMAT.to_owned(),
			payload: serde_json::to_vec(&self).unwrap_or_default(),
			metadata: serde_json::Map::new(),
		}
	}
}

/// RFC 6749 authorization-code strategy over the abstract transport.
pub struct OAuth2AuthCodeStrategy {
	config: OAuth2Config,
	transport: Arc<dyn Transport>,
}

impl OAuth2AuthCodeStrategy {
	pub fn new(config: OAuth2Config, transport: Arc<dyn Transport>) -> Self {
		Self { config, transport }
	}

	/// The user-consent redirect for a connect request
	pub fn authorize_url(&self, request: &BeginAuthRequest) -> Result<String, ServiceError> {
		let mut url = Url::parse(&self.config.authorize_url).map_err(|e| {
			ServiceError::config(
				codes::PROVIDER_NOT_REGISTERED,
				format!("authorize url invalid: {e}"),
			)
		})?;

		url.query_pairs_mut()
			.append_pair("response_type", "code")
			.append_pair("client_id", &self.config.client_id)
			.append_pair("state", &request.state)
			.append_pair("scope", &request.requested_grants.join(" "));
		if let Some(redirect_uri) = &request.redirect_uri {
			url.query_pairs_mut().append_pair("redirect_uri", redirect_uri);
		}

		Ok(url.into())
	}

	#[instrument(skip(self, code), fields(token_url = %self.config.token_url))]
	pub async fn exchange_code(
		&self,
		code: &str,
		redirect_uri: Option<&str>,
	) -> Result<OAuth2Token, ServiceError> {
		let mut form = form_urlencoded::Serializer::new(String::new());
		form.append_pair("grant_type", "authorization_code")
			.append_pair("code", code)
			.append_pair("client_id", &self.config.client_id)
			.append_pair("client_secret", &self.config.client_secret);
		if let Some(redirect_uri) = redirect_uri {
			form.append_pair("redirect_uri", redirect_uri);
		}

		self.token_request(form.finish()).await
	}

	#[instrument(skip_all, fields(token_url = %self.config.token_url))]
	pub async fn refresh(&self, token: &OAuth2Token) -> Result<OAuth2Token, ServiceError> {
		let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
			ServiceError::validation(
				codes::CREDENTIAL_NOT_REFRESHABLE,
				"token carries no refresh_token",
			)
		})?;

		let mut form = form_urlencoded::Serializer::new(String::new());
		form.append_pair("grant_type", "refresh_token")
			.append_pair("refresh_token", refresh_token)
			.append_pair("client_id", &self.config.client_id)
			.append_pair("client_secret", &self.config.client_secret);

		let mut refreshed = self.token_request(form.finish()).await?;
		// Providers may omit the refresh token on rotation; carry the old one
		if refreshed.refresh_token.is_none() {
			refreshed.refresh_token = token.refresh_token.clone();
		}
		if refreshed.scope.is_empty() {
			refreshed.scope = token.scope.clone();
		}
		Ok(refreshed)
	}

	async fn token_request(&self, body: String) -> Result<OAuth2Token, ServiceError> {
		let mut request = TransportRequest::new("POST", self.config.token_url.clone());
		request.set_header("content-type", "application/x-www-form-urlencoded");
		request.set_header("accept", "application/json");
		request.body = Some(body.into_bytes());

		let response = self.transport.execute(request).await?;
		OAuth2Token::from_response(&response, Utc::now())
	}
}

impl core::fmt::Debug for OAuth2AuthCodeStrategy {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("OAuth2AuthCodeStrategy")
			.field("client_id", &self.config.client_id)
			.field("token_url", &self.config.token_url)
			.finish_non_exhaustive()
	}
}

/// RFC 6749 client-credentials strategy for service-to-service providers.
pub struct OAuth2ClientCredentialsStrategy {
	config: OAuth2Config,
	transport: Arc<dyn Transport>,
}

impl OAuth2ClientCredentialsStrategy {
	pub fn new(config: OAuth2Config, transport: Arc<dyn Transport>) -> Self {
		Self { config, transport }
	}

	#[instrument(skip(self), fields(token_url = %self.config.token_url))]
	pub async fn token(&self, scopes: &[String]) -> Result<OAuth2Token, ServiceError> {
		let mut form = form_urlencoded::Serializer::new(String::new());
		form.append_pair("grant_type", "client_credentials")
			.append_pair("client_id", &self.config.client_id)
			.append_pair("client_secret", &self.config.client_secret);
		if !scopes.is_empty() {
			form.append_pair("scope", &scopes.join(" "));
		}

		let mut request = TransportRequest::new("POST", self.config.token_url.clone());
		request.set_header("content-type", "application/x-www-form-urlencoded");
		request.set_header("accept", "application/json");
		request.body = Some(form.finish().into_bytes());

		let response = self.transport.execute(request).await?;
		OAuth2Token::from_response(&response, Utc::now())
	}
}

impl core::fmt::Debug for OAuth2ClientCredentialsStrategy {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("OAuth2ClientCredentialsStrategy")
			.field("client_id", &self.config.client_id)
			.finish_non_exhaustive()
	}
}

/// Static API keys have no exchange; wrap the configured key as a
/// non-refreshable grant.
pub fn api_key_grant(external_account_id: impl Into<String>, api_key: &str) -> AuthGrant {
	AuthGrant {
		external_account_id: external_account_id.into(),
		payload: api_key.as_bytes().to_vec(),
		payload_format: API_KEY_PAYLOAD_FORMAT.to_owned(),
		token_type: "api_key".to_owned(),
		granted_scopes: vec![],
		expires_at: None,
		rotates_at: None,
		refreshable: false,
		metadata: serde_json::Map::new(),
	}
}

#[cfg(test)]
mod test {
	use std::collections::{BTreeMap, VecDeque};

	use parking_lot::Mutex;

	use common::scope::ScopeRef;

	use super::*;

	struct ScriptedTransport {
		responses: Mutex<VecDeque<TransportResponse>>,
		seen: Mutex<Vec<TransportRequest>>,
	}

	impl ScriptedTransport {
		fn new(responses: Vec<TransportResponse>) -> Arc<Self> {
			Arc::new(Self {
				responses: Mutex::new(responses.into()),
				seen: Mutex::new(vec![]),
			})
		}

		fn json(status: u16, body: &str) -> TransportResponse {
			TransportResponse {
				status,
				headers: BTreeMap::new(),
				body: body.as_bytes().to_vec(),
			}
		}
	}

	#[async_trait::async_trait]
	impl Transport for ScriptedTransport {
		async fn execute(
			&self,
			request: TransportRequest,
		) -> Result<TransportResponse, ServiceError> {
			self.seen.lock().push(request);
			self.responses
				.lock()
				.pop_front()
				.ok_or_else(|| ServiceError::external("transport_empty", "no response"))
		}
	}

	fn config() -> OAuth2Config {
		OAuth2Config {
			client_id: "client-1".to_owned(),
			client_secret: "sekrit".to_owned(),
			authorize_url: "https://provider.example/oauth/authorize".to_owned(),
			token_url: "https://provider.example/oauth/token".to_owned(),
		}
	}

	#[test]
	fn authorize_url_carries_state_and_scopes() {
		let strategy =
			OAuth2AuthCodeStrategy::new(config(), ScriptedTransport::new(vec![]));
		let url = strategy
			.authorize_url(&BeginAuthRequest {
				scope: ScopeRef::new("user", "u1").unwrap(),
				requested_grants: vec!["repo:read".to_owned(), "repo:write".to_owned()],
				redirect_uri: Some("https://app.example/callback".to_owned()),
				state: "st4te".to_owned(),
				metadata: serde_json::Map::new(),
			})
			.unwrap();

		assert!(url.starts_with("https://provider.example/oauth/authorize?"));
		assert!(url.contains("response_type=code"));
		assert!(url.contains("state=st4te"));
		assert!(url.contains("scope=repo%3Aread+repo%3Awrite"));
		assert!(url.contains("redirect_uri=https%3A%2F%2Fapp.example%2Fcallback"));
	}

	#[tokio::test]
	async fn code_exchange_posts_the_form_and_parses_the_token() {
		let transport = ScriptedTransport::new(vec![ScriptedTransport::json(
			200,
			r#"{"access_token":"a1","refresh_token":"r1","token_type":"bearer","expires_in":3600,"scope":"repo:read repo:write"}"#,
		)]);
		let strategy = OAuth2AuthCodeStrategy::new(config(), transport.clone());

		let token = strategy.exchange_code("c1", None).await.unwrap();
		assert_eq!(token.access_token, "a1");
		assert_eq!(token.refresh_token.as_deref(), Some("r1"));
		assert_eq!(token.scope, vec!["repo:read".to_owned(), "repo:write".to_owned()]);
		assert!(token.expires_at.unwrap() > Utc::now());

		let seen = transport.seen.lock();
		assert_eq!(seen[0].method, "POST");
		let body = String::from_utf8(seen[0].body.clone().unwrap()).unwrap();
		assert!(body.contains("grant_type=authorization_code"));
		assert!(body.contains("code=c1"));
		assert!(body.contains("client_secret=sekrit"));
		assert_eq!(
			seen[0].headers.get("content-type").map(String::as_str),
			Some("application/x-www-form-urlencoded")
		);
	}

	#[tokio::test]
	async fn refresh_preserves_rotating_fields_the_provider_omits() {
		let transport = ScriptedTransport::new(vec![ScriptedTransport::json(
			200,
			r#"{"access_token":"a2","token_type":"bearer"}"#,
		)]);
		let strategy = OAuth2AuthCodeStrategy::new(config(), transport);

		let prior = OAuth2Token {
			access_token: "a1".to_owned(),
			refresh_token: Some("r1".to_owned()),
			token_type: "bearer".to_owned(),
			scope: vec!["repo:read".to_owned()],
			expires_at: None,
		};

		let refreshed = strategy.refresh(&prior).await.unwrap();
		assert_eq!(refreshed.access_token, "a2");
		assert_eq!(refreshed.refresh_token.as_deref(), Some("r1"));
		assert_eq!(refreshed.scope, vec!["repo:read".to_owned()]);
	}

	#[tokio::test]
	async fn refresh_without_refresh_token_is_rejected() {
		let strategy = OAuth2AuthCodeStrategy::new(config(), ScriptedTransport::new(vec![]));
		let token = OAuth2Token {
			access_token: "a1".to_owned(),
			refresh_token: None,
			token_type: "bearer".to_owned(),
			scope: vec![],
			expires_at: None,
		};

		let err = strategy.refresh(&token).await.unwrap_err();
		assert!(err.is(codes::CREDENTIAL_NOT_REFRESHABLE));
	}

	#[tokio::test]
	async fn token_endpoint_failure_is_an_auth_error() {
		let transport = ScriptedTransport::new(vec![ScriptedTransport::json(
			400,
			r#"{"error":"invalid_grant"}"#,
		)]);
		let strategy = OAuth2AuthCodeStrategy::new(config(), transport);

		let err = strategy.exchange_code("expired", None).await.unwrap_err();
		assert!(err.is(codes::PROVIDER_AUTH_FAILED));
	}

	#[tokio::test]
	async fn client_credentials_requests_a_scoped_token() {
		let transport = ScriptedTransport::new(vec![ScriptedTransport::json(
			200,
			r#"{"access_token":"svc1","token_type":"bearer","expires_in":600}"#,
		)]);
		let strategy = OAuth2ClientCredentialsStrategy::new(config(), transport.clone());

		let token = strategy.token(&["orders:read".to_owned()]).await.unwrap();
		assert_eq!(token.access_token, "svc1");
		assert!(token.refresh_token.is_none());

		let seen = transport.seen.lock();
		let body = String::from_utf8(seen[0].body.clone().unwrap()).unwrap();
		assert!(body.contains("grant_type=client_credentials"));
		assert!(body.contains("scope=orders%3Aread"));
	}

	#[test]
	fn token_round_trips_through_the_payload_form() {
		let token = OAuth2Token {
			access_token: "a1".to_owned(),
			refresh_token: Some("r1".to_owned()),
			token_type: "bearer".to_owned(),
			scope: vec!["repo:read".to_owned()],
			expires_at: Some(Utc::now() + Duration::hours(1)),
		};

		let payload = token.to_payload().unwrap();
		assert_eq!(OAuth2Token::from_payload(&payload).unwrap(), token);

		let grant = token.into_grant("acct_1");
		assert!(grant.refreshable);
		assert_eq!(grant.payload_format, OAUTH2_PAYLOAD_FORMAT);
		assert_eq!(grant.external_account_id, "acct_1");
	}

	#[test]
	fn api_key_grants_are_not_refreshable() {
		let grant = api_key_grant("acct_1", "sk-123");
		assert!(!grant.refreshable);
		assert_eq!(grant.payload, b"sk-123".to_vec());
		assert_eq!(grant.payload_format, API_KEY_PAYLOAD_FORMAT);
	}
}
