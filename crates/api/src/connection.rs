use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};

use common::{
	activity::{ActivityStatus, NewServiceActivity},
	capability::CapabilityDecision,
	connection::{Connection, ConnectionStatus, Credential, NewConnection, NewCredential},
	errors::{codes, ErrorCategory, ServiceError},
	grants::{diff_grants, normalize_grants, GrantEventType, NewGrantEvent, NewGrantSnapshot},
	ids::{ConnectionId, ProviderId},
	outbox::{events, LifecycleEvent},
	provider::{AuthGrant, BeginAuthRequest, CompleteAuthRequest, ProviderRegistry, RefreshRequest},
	scope::ScopeRef,
	store::{
		ConnectionStore, CredentialStore, GrantStore, OutboxStore, RuntimeStores, StoreError,
	},
};
use tether_secrets::{SealedSecret, SecretProvider};

use crate::{
	activity::ActivityRecorder,
	backoff,
	error::ApiError,
	locker::ConnectionLocker,
	oauth_state::{OAuthStateService, StateRecord},
};

#[derive(Debug, Clone)]
pub struct ConnectionServiceOptions {
	pub refresh_lock_timeout: Duration,
	/// Consecutive refresh failures before the connection drops to
	/// `needs_reconsent`
	pub refresh_failure_threshold: u32,
	pub refresh_backoff_base: Duration,
	pub oauth_state_ttl: Duration,
}

impl Default for ConnectionServiceOptions {
	fn default() -> Self {
		Self {
			refresh_lock_timeout: Duration::from_secs(30),
			refresh_failure_threshold: 5,
			refresh_backoff_base: Duration::from_secs(30),
			oauth_state_ttl: Duration::from_secs(10 * 60),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub requested_grants: Vec<String>,
	pub redirect_uri: Option<String>,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ConnectStarted {
	pub authorize_url: String,
	pub state: String,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
	pub connection_id: ConnectionId,
	pub credential_version: i32,
	pub grant_event: GrantEventType,
}

/// The connection/credential/grant lifecycle service. Clonable via `Arc`;
/// operations on distinct connections proceed in parallel, while refreshes
/// of one connection are serialized by the locker.
pub struct ConnectionService {
	registry: Arc<ProviderRegistry>,
	stores: RuntimeStores,
	secrets: Arc<dyn SecretProvider>,
	oauth_state: Arc<OAuthStateService>,
	locker: Arc<ConnectionLocker>,
	recorder: ActivityRecorder,
	options: ConnectionServiceOptions,
	refresh_failures: Mutex<HashMap<ConnectionId, u32>>,
}

impl core::fmt::Debug for ConnectionService {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("ConnectionService").field("options", &self.options).finish_non_exhaustive()
	}
}

impl ConnectionService {
	pub fn new(
		registry: Arc<ProviderRegistry>,
		stores: RuntimeStores,
		secrets: Arc<dyn SecretProvider>,
		options: ConnectionServiceOptions,
	) -> Arc<Self> {
		let recorder = ActivityRecorder::new(stores.activity.clone());
		Arc::new(Self {
			registry,
			stores,
			secrets,
			oauth_state: Arc::new(OAuthStateService::new(options.oauth_state_ttl)),
			locker: ConnectionLocker::new(options.refresh_lock_timeout),
			recorder,
			options,
			refresh_failures: Mutex::new(HashMap::new()),
		})
	}

	pub fn oauth_state(&self) -> &Arc<OAuthStateService> {
		&self.oauth_state
	}

	pub fn locker(&self) -> &Arc<ConnectionLocker> {
		&self.locker
	}

	/// Mint the state token and hand back the provider's authorization URL
	#[instrument(skip(self, request), fields(provider_id = %request.provider_id, scope = %request.scope))]
	pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectStarted, ApiError> {
		let provider = self.registry.get(&request.provider_id)?;

		if !provider.supported_scope_types().contains(&request.scope.scope_type) {
			return Err(ServiceError::validation(
				codes::SCOPE_TYPE_UNSUPPORTED,
				format!(
					"provider {} does not support {} scopes",
					request.provider_id, request.scope.scope_type
				),
			)
			.into());
		}

		let requested_grants = normalize_grants(request.requested_grants);
		let state = self.oauth_state.issue(StateRecord {
			provider_id: request.provider_id.clone(),
			scope: request.scope.clone(),
			requested_grants: requested_grants.clone(),
			redirect_uri: request.redirect_uri.clone(),
			metadata: request.metadata.clone(),
		});

		let begin = provider
			.begin_auth(BeginAuthRequest {
				scope: request.scope.clone(),
				requested_grants,
				redirect_uri: request.redirect_uri,
				state: state.clone(),
				metadata: request.metadata,
			})
			.await?;

		self.recorder
			.record(NewServiceActivity::new(
				request.provider_id,
				request.scope,
				"connection.connect",
				"oauth_state",
				&state,
			))
			.await;

		Ok(ConnectStarted { authorize_url: begin.authorize_url, state })
	}

	/// Exchange the callback code, insert the connection if new, and rotate
	/// in the first credential with its grant snapshot
	#[instrument(skip(self, code, state))]
	pub async fn complete_callback(
		&self,
		code: &str,
		state: &str,
	) -> Result<(Connection, Credential), ApiError> {
		let record = self.oauth_state.take(state).ok_or_else(|| {
			ServiceError::auth(codes::OAUTH_STATE_INVALID, "state token unknown or expired")
		})?;

		let provider = self.registry.get(&record.provider_id)?;
		let grant = provider
			.complete_auth(CompleteAuthRequest {
				code: code.to_owned(),
				scope: record.scope.clone(),
				requested_grants: record.requested_grants.clone(),
				redirect_uri: record.redirect_uri.clone(),
				metadata: record.metadata.clone(),
			})
			.await?;

		let connection = self
			.find_or_insert_connection(&record.provider_id, &record.scope, &grant)
			.await?;

		if connection.status == ConnectionStatus::Revoked {
			return Err(ServiceError::conflict(
				codes::CONNECTION_NOT_ACTIVE,
				"connection is revoked; revocation is terminal",
			)
			.into());
		}

		let granted = provider.normalize_granted_permissions(&grant.granted_scopes);
		let rotation = self
			.rotate(&connection, &grant, record.requested_grants.clone(), granted.clone())
			.await?;

		if connection.status == ConnectionStatus::NeedsReconsent {
			self.transition(&connection, ConnectionStatus::Active).await?;
		}
		self.stores.connections.set_last_error(&connection.id, None).await?;

		self.enqueue_event(
			events::CONNECTION_CONNECTED,
			&connection,
			json!({
				"externalAccountId": connection.external_account_id,
				"credentialVersion": rotation.credential.version,
				"granted": granted,
			}),
		)
		.await;

		self.recorder
			.record(
				NewServiceActivity::new(
					connection.provider_id.clone(),
					connection.scope.clone(),
					"connection.complete_callback",
					"connection",
					connection.id.as_str(),
				)
				.with_connection(connection.id.clone()),
			)
			.await;

		let connection = self.stores.connections.connection(&connection.id).await?;
		Ok((connection, rotation.credential))
	}

	/// Rotate the credential under the per-connection refresh lock. Exactly
	/// one of any set of concurrent callers wins; losers fail fast with
	/// `service_refresh_locked`.
	#[instrument(skip(self))]
	pub async fn refresh(&self, connection_id: &ConnectionId) -> Result<RefreshOutcome, ApiError> {
		let connection = self.stores.connections.connection(connection_id).await?;
		if connection.status == ConnectionStatus::Revoked || connection.is_deleted() {
			return Err(ServiceError::conflict(
				codes::CONNECTION_NOT_ACTIVE,
				format!("connection {} is {}", connection_id, connection.status),
			)
			.into());
		}

		let provider = self.registry.get(&connection.provider_id)?;

		// Held across the provider call; released on every exit path
		let _lock = self.locker.try_acquire(connection_id)?;

		let credential =
			self.stores.credentials.active_credential(connection_id).await?.ok_or_else(|| {
				ServiceError::not_found(
					codes::CREDENTIAL_NOT_FOUND,
					format!("connection {} has no active credential", connection_id),
				)
			})?;

		if !credential.refreshable {
			return Err(ServiceError::validation(
				codes::CREDENTIAL_NOT_REFRESHABLE,
				format!("credential v{} is not refreshable", credential.version),
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

		let refreshed = provider
			.refresh(RefreshRequest {
				connection_id: connection_id.clone(),
				payload,
				payload_format: credential.payload_format.clone(),
				granted_scopes: credential.granted_scopes.clone(),
				metadata: Map::new(),
			})
			.await;

		match refreshed {
			Ok(grant) => {
				let granted = provider.normalize_granted_permissions(&grant.granted_scopes);
				let rotation = self
					.rotate(&connection, &grant, credential.requested_scopes.clone(), granted)
					.await?;

				self.refresh_failures.lock().remove(connection_id);
				self.stores.connections.set_last_error(connection_id, None).await?;

				if connection.status == ConnectionStatus::NeedsReconsent {
					self.transition(&connection, ConnectionStatus::Active).await?;
				}

				let diff = diff_grants(
					&credential.granted_scopes,
					&rotation.credential.granted_scopes,
				);
				let grant_event = diff.event_type();

				self.enqueue_event(
					events::CONNECTION_REFRESHED,
					&connection,
					json!({
						"credentialVersion": rotation.credential.version,
						"grantEvent": grant_event.as_str(),
					}),
				)
				.await;
				match grant_event {
					GrantEventType::Expanded =>
						self.enqueue_event(
							events::GRANT_EXPANDED,
							&connection,
							json!({"added": diff.added}),
						)
						.await,
					GrantEventType::Downgraded =>
						self.enqueue_event(
							events::GRANT_DOWNGRADED,
							&connection,
							json!({"added": diff.added, "removed": diff.removed}),
						)
						.await,
					_ => {},
				}

				self.recorder
					.record(
						NewServiceActivity::new(
							connection.provider_id.clone(),
							connection.scope.clone(),
							"connection.refresh",
							"connection",
							connection_id.as_str(),
						)
						.with_connection(connection_id.clone()),
					)
					.await;

				Ok(RefreshOutcome {
					connection_id: connection_id.clone(),
					credential_version: rotation.credential.version,
					grant_event,
				})
			},
			Err(error) => self.handle_refresh_failure(&connection, error).await,
		}
	}

	/// Revoke the active credential and terminally revoke the connection
	#[instrument(skip(self))]
	pub async fn revoke(
		&self,
		connection_id: &ConnectionId,
		reason: &str,
	) -> Result<Connection, ApiError> {
		let connection = self.stores.connections.connection(connection_id).await?;
		if !connection.status.can_transition_to(ConnectionStatus::Revoked) {
			return Err(ServiceError::conflict(
				codes::INVALID_STATE_TRANSITION,
				format!("cannot revoke a {} connection", connection.status),
			)
			.into());
		}

		self.stores.credentials.revoke_active(connection_id, reason).await?;
		let updated = self.transition(&connection, ConnectionStatus::Revoked).await?;

		self.enqueue_event(events::CONNECTION_REVOKED, &updated, json!({ "reason": reason }))
			.await;

		self.recorder
			.record(
				NewServiceActivity::new(
					updated.provider_id.clone(),
					updated.scope.clone(),
					"connection.revoke",
					"connection",
					connection_id.as_str(),
				)
				.with_connection(connection_id.clone()),
			)
			.await;

		Ok(updated)
	}

	pub async fn suspend(&self, connection_id: &ConnectionId) -> Result<Connection, ApiError> {
		let connection = self.stores.connections.connection(connection_id).await?;
		let updated = self.transition(&connection, ConnectionStatus::Suspended).await?;
		self.recorder
			.record(
				NewServiceActivity::new(
					updated.provider_id.clone(),
					updated.scope.clone(),
					"connection.suspend",
					"connection",
					connection_id.as_str(),
				)
				.with_connection(connection_id.clone()),
			)
			.await;
		Ok(updated)
	}

	pub async fn reinstate(&self, connection_id: &ConnectionId) -> Result<Connection, ApiError> {
		let connection = self.stores.connections.connection(connection_id).await?;
		let updated = self.transition(&connection, ConnectionStatus::Active).await?;
		self.recorder
			.record(
				NewServiceActivity::new(
					updated.provider_id.clone(),
					updated.scope.clone(),
					"connection.reinstate",
					"connection",
					connection_id.as_str(),
				)
				.with_connection(connection_id.clone()),
			)
			.await;
		Ok(updated)
	}

	/// Decide allow/deny/degrade from the latest grant snapshot. The
	/// decision is audited but has no other side effects.
	#[instrument(skip(self))]
	pub async fn invoke_capability(
		&self,
		connection_id: &ConnectionId,
		capability: &str,
	) -> Result<CapabilityDecision, ApiError> {
		let connection = self.stores.connections.connection(connection_id).await?;
		if connection.status != ConnectionStatus::Active {
			return Err(ServiceError::conflict(
				codes::CONNECTION_NOT_ACTIVE,
				format!("connection {} is {}", connection_id, connection.status),
			)
			.into());
		}

		let provider = self.registry.get(&connection.provider_id)?;
		let capability = provider.resolve_capability_operation(capability).ok_or_else(|| {
			ServiceError::not_found(
				codes::CAPABILITY_NOT_FOUND,
				format!("provider {} has no capability {:?}", connection.provider_id, capability),
			)
		})?;

		let granted = self
			.stores
			.grants
			.latest_snapshot(connection_id)
			.await?
			.map(|snapshot| snapshot.granted)
			.unwrap_or_default();

		let decision = capability.evaluate(&granted);

		let mut metadata = Map::new();
		metadata.insert("capability".to_owned(), Value::String(capability.name.clone()));
		metadata.insert("allowed".to_owned(), Value::Bool(decision.allowed));
		metadata
			.insert("missing_grants".to_owned(), json!(decision.missing_grants));

		self.recorder
			.record(
				NewServiceActivity::new(
					connection.provider_id.clone(),
					connection.scope.clone(),
					"capability.invoke",
					"connection",
					connection_id.as_str(),
				)
				.with_connection(connection_id.clone())
				.with_status(if decision.allowed {
					ActivityStatus::Ok
				} else {
					ActivityStatus::Warn
				})
				.with_metadata(metadata),
			)
			.await;

		Ok(decision)
	}

	async fn find_or_insert_connection(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		grant: &AuthGrant,
	) -> Result<Connection, ApiError> {
		if let Some(existing) = self
			.stores
			.connections
			.find_connection(provider_id, scope, &grant.external_account_id)
			.await?
		{
			return Ok(existing);
		}

		let inserted = self
			.stores
			.connections
			.insert_connection(NewConnection {
				provider_id: provider_id.clone(),
				scope: scope.clone(),
				external_account_id: grant.external_account_id.clone(),
				inherits_from: None,
			})
			.await;

		match inserted {
			Ok(connection) => Ok(connection),
			// A concurrent callback for the same account won the insert
			Err(StoreError::UniqueViolation(message)) => {
				debug!(%message, "Connection insert raced; reusing the winner");
				self.stores
					.connections
					.find_connection(provider_id, scope, &grant.external_account_id)
					.await?
					.ok_or(StoreError::RecordNotFound)
					.map_err(Into::into)
			},
			Err(other) => Err(other.into()),
		}
	}

	async fn rotate(
		&self,
		connection: &Connection,
		grant: &AuthGrant,
		requested: Vec<String>,
		granted: Vec<String>,
	) -> Result<common::store::CredentialRotation, ApiError> {
		let prev = self.stores.grants.latest_snapshot(&connection.id).await?;

		let event = match &prev {
			None => NewGrantEvent {
				connection_id: connection.id.clone(),
				event_type: GrantEventType::Snapshot,
				added: granted.clone(),
				removed: vec![],
				metadata: Map::new(),
			},
			Some(prev) => {
				let diff = diff_grants(&prev.granted, &granted);
				NewGrantEvent::from_diff(&connection.id, &diff)
			},
		};

		let sealed = self.secrets.encrypt(&grant.payload).await?;

		let rotation = self
			.stores
			.credentials
			.rotate_credential(
				NewCredential {
					connection_id: connection.id.clone(),
					encrypted_payload: sealed.ciphertext,
					payload_format: grant.payload_format.clone(),
					payload_version: 1,
					token_type: grant.token_type.clone(),
					requested_scopes: requested.clone(),
					granted_scopes: granted.clone(),
					expires_at: grant.expires_at,
					rotates_at: grant.rotates_at,
					refreshable: grant.refreshable,
					encryption_key_id: sealed.key_id,
					encryption_version: sealed.version,
				},
				NewGrantSnapshot {
					connection_id: connection.id.clone(),
					requested,
					granted,
					metadata: Map::new(),
				},
				Some(event),
			)
			.await?;

		Ok(rotation)
	}

	async fn handle_refresh_failure(
		&self,
		connection: &Connection,
		error: ServiceError,
	) -> Result<RefreshOutcome, ApiError> {
		let failures = {
			let mut failures = self.refresh_failures.lock();
			let count = failures.entry(connection.id.clone()).or_insert(0);
			*count += 1;
			*count
		};

		let retry_after = backoff::exponential(self.options.refresh_backoff_base, failures);

		if let Err(store_error) = self
			.stores
			.connections
			.set_last_error(&connection.id, Some(error.to_string()))
			.await
		{
			warn!(?store_error, "Failed to record refresh error");
		}

		self.enqueue_event(
			events::CONNECTION_REFRESH_FAILED,
			connection,
			json!({
				"error": error.to_string(),
				"consecutiveFailures": failures,
				"retryAfterSeconds": retry_after.as_secs(),
			}),
		)
		.await;

		// 401/insufficient-scope drops to needs_reconsent at once; other
		// failures only after the configured threshold
		let demote = error.category == ErrorCategory::Auth
			|| failures >= self.options.refresh_failure_threshold;
		if demote && connection.status == ConnectionStatus::Active {
			if let Err(transition_error) =
				self.transition(connection, ConnectionStatus::NeedsReconsent).await
			{
				warn!(?transition_error, "Failed to demote connection after refresh failures");
			}
		}

		self.recorder
			.record(
				NewServiceActivity::new(
					connection.provider_id.clone(),
					connection.scope.clone(),
					"connection.refresh",
					"connection",
					connection.id.as_str(),
				)
				.with_connection(connection.id.clone())
				.with_status(ActivityStatus::Error),
			)
			.await;

		Err(ApiError::Service(error.with_metadata(
			"retry_after_seconds".to_owned(),
			Value::from(retry_after.as_secs()),
		)))
	}

	async fn transition(
		&self,
		connection: &Connection,
		to: ConnectionStatus,
	) -> Result<Connection, ApiError> {
		if !connection.status.can_transition_to(to) {
			return Err(ServiceError::conflict(
				codes::INVALID_STATE_TRANSITION,
				format!("connection cannot move from {} to {}", connection.status, to),
			)
			.into());
		}

		let updated =
			self.stores.connections.transition_status(&connection.id, connection.status, to).await?;

		self.enqueue_event(
			events::CONNECTION_STATUS_CHANGED,
			&updated,
			json!({
				"priorStatus": connection.status.as_str(),
				"newStatus": to.as_str(),
			}),
		)
		.await;

		Ok(updated)
	}

	async fn enqueue_event(&self, name: &str, connection: &Connection, payload: Value) {
		let event = LifecycleEvent::new(
			name,
			connection.provider_id.clone(),
			connection.scope.clone(),
			Some(connection.id.clone()),
			payload,
		);
		if let Err(error) = self.stores.outbox.enqueue_event(event).await {
			warn!(?error, %name, "Failed to enqueue lifecycle event");
		}
	}
}
