use std::{
	collections::BTreeMap,
	sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{
	capability::Capability,
	errors::{codes, ServiceError},
	grants::normalize_grants,
	ids::{ConnectionId, ProviderId},
	ratelimit::RateLimitMeta,
	scope::{ScopeRef, ScopeType},
	subscription::SubscriptionOperations,
	webhook::WebhookTemplate,
};

/// The authentication strategy a provider uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthKind {
	OAuth2AuthCode,
	OAuth2ClientCredentials,
	JwtServiceAccount,
	ApiKey,
	Hmac,
	AwsSigV4,
}

impl AuthKind {
	pub fn as_str(self) -> &'static str {
		match self {
			AuthKind::OAuth2AuthCode => "oauth2_auth_code",
			AuthKind::OAuth2ClientCredentials => "oauth2_client_credentials",
			AuthKind::JwtServiceAccount => "jwt_service_account",
			AuthKind::ApiKey => "api_key",
			AuthKind::Hmac => "hmac",
			AuthKind::AwsSigV4 => "aws_sigv4",
		}
	}

	/// Whether the strategy hands out a user-consent redirect at connect time
	pub fn is_interactive(self) -> bool {
		matches!(self, AuthKind::OAuth2AuthCode)
	}
}

#[derive(Debug, Clone)]
pub struct BeginAuthRequest {
	pub scope: ScopeRef,
	pub requested_grants: Vec<String>,
	pub redirect_uri: Option<String>,
	/// Opaque single-use state token minted by the runtime
	pub state: String,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct BeginAuth {
	pub authorize_url: String,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct CompleteAuthRequest {
	pub code: String,
	pub scope: ScopeRef,
	pub requested_grants: Vec<String>,
	pub redirect_uri: Option<String>,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct RefreshRequest {
	pub connection_id: ConnectionId,
	/// Decrypted payload of the credential being rotated
	pub payload: Vec<u8>,
	pub payload_format: String,
	pub granted_scopes: Vec<String>,
	pub metadata: Map<String, Value>,
}

/// What a provider hands back from a completed exchange or refresh. The
/// payload is plaintext secret material; the runtime encrypts it before it
/// touches the store.
#[derive(Clone)]
pub struct AuthGrant {
	pub external_account_id: String,
	pub payload: Vec<u8>,
	pub payload_format: String,
	pub token_type: String,
	pub granted_scopes: Vec<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub rotates_at: Option<DateTime<Utc>>,
	pub refreshable: bool,
	pub metadata: Map<String, Value>,
}

impl core::fmt::Debug for AuthGrant {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("AuthGrant")
			.field("external_account_id", &self.external_account_id)
			.field("token_type", &self.token_type)
			.field("granted_scopes", &self.granted_scopes)
			.field("refreshable", &self.refreshable)
			.finish_non_exhaustive()
	}
}

/// An outbound provider call before signing and transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
	pub method: String,
	pub url: String,
	pub headers: BTreeMap<String, String>,
	pub query: Vec<(String, String)>,
	pub body: Option<Vec<u8>>,
}

impl TransportRequest {
	pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
		Self {
			method: method.into(),
			url: url.into(),
			headers: BTreeMap::new(),
			query: vec![],
			body: None,
		}
	}

	pub fn set_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
		self.headers.insert(name.as_ref().to_ascii_lowercase(), value.into());
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
	pub status: u16,
	pub headers: BTreeMap<String, String>,
	pub body: Vec<u8>,
}

impl TransportResponse {
	/// Case-insensitive header lookup
	pub fn header(&self, name: &str) -> Option<&str> {
		let name = name.to_ascii_lowercase();
		self.headers
			.iter()
			.find(|(k, _)| k.to_ascii_lowercase() == name)
			.map(|(_, v)| v.as_str())
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

/// The outbound HTTP adapter. The runtime never owns the client; callers
/// wire one in.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
	async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, ServiceError>;
}

/// Applies provider-specific request authentication given decrypted
/// credential material. Algorithm internals live with the provider.
pub trait Signer: Send + Sync {
	fn sign(&self, request: &mut TransportRequest, payload: &[u8]) -> Result<(), ServiceError>;
}

/// A provider integration. One registration per external service.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
	fn id(&self) -> ProviderId;

	fn auth_kind(&self) -> AuthKind;

	fn supported_scope_types(&self) -> Vec<ScopeType>;

	fn capabilities(&self) -> Vec<Capability>;

	async fn begin_auth(&self, request: BeginAuthRequest) -> Result<BeginAuth, ServiceError>;

	async fn complete_auth(&self, request: CompleteAuthRequest)
		-> Result<AuthGrant, ServiceError>;

	async fn refresh(&self, request: RefreshRequest) -> Result<AuthGrant, ServiceError>;

	fn signer(&self) -> Option<Arc<dyn Signer>> {
		None
	}

	fn webhook(&self) -> Option<Arc<dyn WebhookTemplate>> {
		None
	}

	fn subscriptions(&self) -> Option<Arc<dyn SubscriptionOperations>> {
		None
	}

	/// Map raw provider scopes onto normalized grant tokens
	fn normalize_granted_permissions(&self, raw: &[String]) -> Vec<String> {
		normalize_grants(raw.iter().cloned())
	}

	fn resolve_capability_operation(&self, capability: &str) -> Option<Capability> {
		self.capabilities().into_iter().find(|c| c.name == capability)
	}

	/// Derive rate-limit observations from a provider response
	fn normalize_api_response(&self, response: &TransportResponse) -> RateLimitMeta {
		RateLimitMeta::from_response(response)
	}

	/// Default retry-after applied on 429/503 when the provider sent no
	/// Retry-After header
	fn default_retry_after(&self) -> chrono::Duration {
		chrono::Duration::seconds(60)
	}
}

impl core::fmt::Debug for dyn Provider {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Provider").field("id", &self.id()).finish()
	}
}

/// Process-wide provider lookup, keyed by id. Registered once at wiring
/// time; duplicate registration is a config error.
pub struct ProviderRegistry {
	providers: RwLock<BTreeMap<ProviderId, Arc<dyn Provider>>>,
}

impl Default for ProviderRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl ProviderRegistry {
	pub fn new() -> Self {
		Self { providers: RwLock::new(BTreeMap::new()) }
	}

	pub fn register(&self, provider: Arc<dyn Provider>) -> Result<(), ServiceError> {
		let id = provider.id();
		let mut providers = self.providers.write().expect("provider registry poisoned");
		if providers.contains_key(&id) {
			return Err(ServiceError::config(
				codes::PROVIDER_ALREADY_REGISTERED,
				format!("provider {} is already registered", id),
			));
		}
		providers.insert(id, provider);
		Ok(())
	}

	pub fn get(&self, id: &ProviderId) -> Result<Arc<dyn Provider>, ServiceError> {
		self.providers
			.read()
			.expect("provider registry poisoned")
			.get(id)
			.cloned()
			.ok_or_else(|| {
				ServiceError::config(
					codes::PROVIDER_NOT_REGISTERED,
					format!("provider {} is not registered", id),
				)
			})
	}

	pub fn ids(&self) -> Vec<ProviderId> {
		self.providers.read().expect("provider registry poisoned").keys().cloned().collect()
	}
}

impl core::fmt::Debug for ProviderRegistry {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("ProviderRegistry").field("providers", &self.ids()).finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	struct NullProvider(ProviderId);

	#[async_trait::async_trait]
	impl Provider for NullProvider {
		fn id(&self) -> ProviderId {
			self.0.clone()
		}

		fn auth_kind(&self) -> AuthKind {
			AuthKind::ApiKey
		}

		fn supported_scope_types(&self) -> Vec<ScopeType> {
			vec![ScopeType::from("user")]
		}

		fn capabilities(&self) -> Vec<Capability> {
			vec![]
		}

		async fn begin_auth(&self, _: BeginAuthRequest) -> Result<BeginAuth, ServiceError> {
			Err(ServiceError::internal("unused"))
		}

		async fn complete_auth(
			&self,
			_: CompleteAuthRequest,
		) -> Result<AuthGrant, ServiceError> {
			Err(ServiceError::internal("unused"))
		}

		async fn refresh(&self, _: RefreshRequest) -> Result<AuthGrant, ServiceError> {
			Err(ServiceError::internal("unused"))
		}
	}

	#[test]
	fn duplicate_registration_is_a_config_error() {
		let registry = ProviderRegistry::new();
		let id = ProviderId::new("github").unwrap();
		registry.register(Arc::new(NullProvider(id.clone()))).unwrap();

		let err = registry.register(Arc::new(NullProvider(id))).unwrap_err();
		assert!(err.is(codes::PROVIDER_ALREADY_REGISTERED));
	}

	#[test]
	fn missing_provider_is_a_config_error() {
		let registry = ProviderRegistry::new();
		let err = registry.get(&ProviderId::new("shopify").unwrap()).unwrap_err();
		assert!(err.is(codes::PROVIDER_NOT_REGISTERED));
	}

	#[test]
	fn response_header_lookup_is_case_insensitive() {
		let mut headers = BTreeMap::new();
		headers.insert("X-RateLimit-Remaining".to_owned(), "10".to_owned());
		let response = TransportResponse { status: 200, headers, body: vec![] };
		assert_eq!(response.header("x-ratelimit-remaining"), Some("10"));
	}
}
