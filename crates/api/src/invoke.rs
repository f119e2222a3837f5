use std::sync::Arc;

use tracing::instrument;

use common::{
	capability::CapabilityDecision,
	errors::{codes, ServiceError},
	ids::ConnectionId,
	provider::{ProviderRegistry, Transport, TransportRequest, TransportResponse},
	ratelimit::{RateLimitKey, RateLimitState},
	store::{ConnectionStore, CredentialStore, RuntimeStores},
};
use tether_secrets::{SealedSecret, SecretProvider};

use crate::{connection::ConnectionService, error::ApiError, ratelimit::RateLimitPolicy};

#[derive(Debug, Clone)]
pub struct InvokeRequest {
	pub connection_id: ConnectionId,
	pub capability: String,
	pub request: TransportRequest,
	/// Rate-limit bucket within the connection's scope, e.g. `core` or
	/// `graphql`
	pub bucket_key: String,
}

#[derive(Debug)]
pub enum InvokeOutcome {
	/// The capability check denied the call; denial is a decision, not an
	/// error, and nothing left the process
	Denied(CapabilityDecision),
	Executed {
		decision: CapabilityDecision,
		response: TransportResponse,
		rate_limit: RateLimitState,
	},
}

/// The outbound call pipeline: capability decision, rate-limit gate, signer,
/// transport, response normalization, rate-limit update.
pub struct ProviderInvoker {
	registry: Arc<ProviderRegistry>,
	stores: RuntimeStores,
	secrets: Arc<dyn SecretProvider>,
	connections: Arc<ConnectionService>,
	policy: Arc<RateLimitPolicy>,
}

impl ProviderInvoker {
	pub fn new(
		registry: Arc<ProviderRegistry>,
		stores: RuntimeStores,
		secrets: Arc<dyn SecretProvider>,
		connections: Arc<ConnectionService>,
		policy: Arc<RateLimitPolicy>,
	) -> Arc<Self> {
		Arc::new(Self { registry, stores, secrets, connections, policy })
	}

	#[instrument(skip(self, transport, invoke), fields(
		connection_id = %invoke.connection_id,
		capability = %invoke.capability,
	))]
	pub async fn invoke(
		&self,
		transport: &dyn Transport,
		invoke: InvokeRequest,
	) -> Result<InvokeOutcome, ApiError> {
		let decision =
			self.connections.invoke_capability(&invoke.connection_id, &invoke.capability).await?;
		if !decision.allowed {
			return Ok(InvokeOutcome::Denied(decision));
		}

		let connection = self.stores.connections.connection(&invoke.connection_id).await?;
		let provider = self.registry.get(&connection.provider_id)?;

		let key = RateLimitKey::new(
			connection.provider_id.as_str(),
			connection.scope.scope_type.as_str(),
			&connection.scope.id,
			&invoke.bucket_key,
		);
		self.policy.before_call(&key).await?;

		let mut request = invoke.request;
		if let Some(signer) = provider.signer() {
			let credential = self
				.stores
				.credentials
				.active_credential(&invoke.connection_id)
				.await?
				.ok_or_else(|| {
					ServiceError::not_found(
						codes::CREDENTIAL_NOT_FOUND,
						"no active credential to sign with",
					)
				})?;

			// Fail fast rather than sign with material the provider will
			// reject; the caller refreshes and retries
			if credential.is_expired_at(chrono::Utc::now()) {
				return Err(ServiceError::auth(
					codes::PROVIDER_AUTH_FAILED,
					format!("credential v{} expired; refresh required", credential.version),
				)
				.into());
			}

			let payload = self
				.secrets
				.decrypt(&SealedSecret {
					ciphertext: credential.encrypted_payload.clone(),
					key_id: credential.encryption_key_id.clone(),
					version: credential.encryption_version,
				})
				.await?;

			signer.sign(&mut request, &payload)?;
		}

		let response = transport.execute(request).await?;

		let meta = provider.normalize_api_response(&response);
		let rate_limit = self
			.policy
			.after_call(&key, &meta, Some(provider.default_retry_after()))
			.await?;

		Ok(InvokeOutcome::Executed { decision, response, rate_limit })
	}
}

impl core::fmt::Debug for ProviderInvoker {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("ProviderInvoker").finish_non_exhaustive()
	}
}
