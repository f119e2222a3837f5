use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
	activity::{NewServiceActivity, RetentionPolicy, ServiceActivity},
	connection::{Connection, ConnectionStatus, Credential, NewConnection, NewCredential},
	errors::{codes, ErrorCategory, ServiceError, ToServiceError},
	grants::{GrantEvent, GrantSnapshot, NewGrantEvent, NewGrantSnapshot},
	ids::{ConnectionId, CredentialId, EventId, ProviderId, SubscriptionId, SyncJobId},
	installation::{Installation, InstallationStatus, UpsertInstallation},
	outbox::{LifecycleEvent, NotificationDispatch, OutboxEntry, OutboxStatus},
	ratelimit::{RateLimitKey, RateLimitState},
	scope::ScopeRef,
	subscription::{NewSubscription, Subscription, SubscriptionStatus},
	sync::{
		AdvanceCursor, CreateSyncJob, CreatedSyncJob, SyncCursor, SyncJob, SyncJobMode,
		UpsertCursor,
	},
	webhook::{DeliveryClaim, WebhookDelivery, WebhookDeliveryStatus},
};

#[derive(Error, Debug)]
pub enum StoreError {
	#[error("Store configuration incomplete: {0}")]
	Config(String),

	#[error("Could not locate record in store")]
	RecordNotFound,

	#[error("Sync cursor conflict")]
	SyncCursorConflict,

	#[error("Rate limit state not found")]
	StateNotFound,

	#[error("Unique constraint violated: {0}")]
	UniqueViolation(String),

	#[error("Illegal status transition from {from} to {to}")]
	InvalidTransition { from: String, to: String },

	#[error("Database operation failed: {0}")]
	Db(String),

	#[error("Database connection failed: {0}")]
	DbConnection(String),

	#[error("Connection pool error: {0}")]
	Pool(String),

	#[error("Unrecognized stored value: {0}")]
	InvalidRecord(String),

	#[error("Unreadable metadata: {0}")]
	Json(
		#[from]
		#[source]
		serde_json::Error,
	),
}

#[cfg(feature = "diesel-bindings")]
impl From<diesel::result::Error> for StoreError {
	fn from(error: diesel::result::Error) -> Self {
		use diesel::result::{DatabaseErrorKind, Error};
		match error {
			Error::NotFound => StoreError::RecordNotFound,
			// Driver message kept verbatim so callers can pattern-match
			// unique-violation text
			Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) =>
				StoreError::UniqueViolation(info.message().to_owned()),
			other => StoreError::Db(other.to_string()),
		}
	}
}

#[cfg(feature = "diesel-bindings")]
impl From<diesel::r2d2::PoolError> for StoreError {
	fn from(error: diesel::r2d2::PoolError) -> Self {
		StoreError::Pool(error.to_string())
	}
}

impl ToServiceError for StoreError {
	fn to_service_error(&self) -> ServiceError {
		match self {
			StoreError::Config(message) =>
				ServiceError::config(codes::STORE_CONFIG_ERROR, message.clone()),
			StoreError::RecordNotFound =>
				ServiceError::not_found("record_not_found", self.to_string()),
			StoreError::SyncCursorConflict =>
				ServiceError::conflict(codes::SYNC_CURSOR_CONFLICT, self.to_string()),
			StoreError::StateNotFound =>
				ServiceError::not_found(codes::RATE_LIMIT_STATE_NOT_FOUND, self.to_string()),
			StoreError::UniqueViolation(message) =>
				ServiceError::conflict("unique_violation", message.clone()),
			StoreError::InvalidTransition { .. } =>
				ServiceError::conflict(codes::INVALID_STATE_TRANSITION, self.to_string()),
			other => ServiceError::new(ErrorCategory::Internal, codes::INTERNAL, other.to_string()),
		}
	}
}

/// Result of an atomic credential rotation: the new active credential, the
/// grant snapshot written in the same transaction, and the credential that
/// was revoked, if any.
#[derive(Debug, Clone)]
pub struct CredentialRotation {
	pub credential: Credential,
	pub snapshot: GrantSnapshot,
	pub revoked: Option<CredentialId>,
}

#[async_trait::async_trait]
pub trait ConnectionStore: Send + Sync {
	async fn insert_connection(&self, new: NewConnection) -> Result<Connection, StoreError>;

	async fn connection(&self, id: &ConnectionId) -> Result<Connection, StoreError>;

	/// Lookup by the unique `(provider, scope, external account)` tuple,
	/// excluding soft-deleted rows
	async fn find_connection(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		external_account_id: &str,
	) -> Result<Option<Connection>, StoreError>;

	/// CAS on status: the update applies only while the stored status still
	/// equals `from`
	async fn transition_status(
		&self,
		id: &ConnectionId,
		from: ConnectionStatus,
		to: ConnectionStatus,
	) -> Result<Connection, StoreError>;

	async fn set_last_error(
		&self,
		id: &ConnectionId,
		error: Option<String>,
	) -> Result<(), StoreError>;

	async fn soft_delete_connection(&self, id: &ConnectionId) -> Result<(), StoreError>;

	async fn list_connections_for_scope(
		&self,
		scope: &ScopeRef,
		include_deleted: bool,
	) -> Result<Vec<Connection>, StoreError>;
}

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
	async fn active_credential(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Option<Credential>, StoreError>;

	/// Atomically revoke the prior active credential, insert the next
	/// version, and write the grant snapshot plus its paired event in the
	/// same transaction
	async fn rotate_credential(
		&self,
		new: NewCredential,
		snapshot: NewGrantSnapshot,
		event: Option<NewGrantEvent>,
	) -> Result<CredentialRotation, StoreError>;

	async fn revoke_active(
		&self,
		connection_id: &ConnectionId,
		reason: &str,
	) -> Result<Option<Credential>, StoreError>;

	async fn credential_history(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<Credential>, StoreError>;
}

#[async_trait::async_trait]
pub trait GrantStore: Send + Sync {
	async fn latest_snapshot(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Option<GrantSnapshot>, StoreError>;

	/// Snapshot version assignment and the paired event write share one
	/// transaction
	async fn save_snapshot_with_event(
		&self,
		snapshot: NewGrantSnapshot,
		event: Option<NewGrantEvent>,
	) -> Result<GrantSnapshot, StoreError>;

	async fn snapshot_history(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<GrantSnapshot>, StoreError>;

	async fn grant_events(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<GrantEvent>, StoreError>;
}

#[async_trait::async_trait]
pub trait InstallationStore: Send + Sync {
	/// Blind upsert; the only path that may take `suspended → active`
	async fn upsert_installation(
		&self,
		upsert: UpsertInstallation,
	) -> Result<Installation, StoreError>;

	/// Validated against the installation transition graph;
	/// `suspended → active` is rejected here
	async fn update_installation_status(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		status: InstallationStatus,
	) -> Result<Installation, StoreError>;

	async fn installation(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
	) -> Result<Option<Installation>, StoreError>;
}

#[async_trait::async_trait]
pub trait SubscriptionStore: Send + Sync {
	async fn insert_subscription(
		&self,
		new: NewSubscription,
	) -> Result<Subscription, StoreError>;

	async fn subscription(&self, id: &SubscriptionId) -> Result<Subscription, StoreError>;

	/// Webhook routing lookup over the unique `(provider, channel)` tuple,
	/// excluding soft-deleted rows
	async fn subscription_by_channel(
		&self,
		provider_id: &ProviderId,
		channel_id: &str,
	) -> Result<Option<Subscription>, StoreError>;

	async fn update_subscription_status(
		&self,
		id: &SubscriptionId,
		status: SubscriptionStatus,
	) -> Result<Subscription, StoreError>;

	async fn renew_subscription(
		&self,
		id: &SubscriptionId,
		remote_subscription_id: Option<String>,
		expires_at: Option<DateTime<Utc>>,
	) -> Result<Subscription, StoreError>;

	async fn mark_notified(
		&self,
		id: &SubscriptionId,
		at: DateTime<Utc>,
	) -> Result<(), StoreError>;

	async fn expiring_subscriptions(
		&self,
		before: DateTime<Utc>,
	) -> Result<Vec<Subscription>, StoreError>;

	async fn soft_delete_subscription(&self, id: &SubscriptionId) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait SyncCursorStore: Send + Sync {
	async fn cursor(
		&self,
		connection_id: &ConnectionId,
		resource_type: &str,
		resource_id: &str,
	) -> Result<Option<SyncCursor>, StoreError>;

	/// Compare-and-swap advance. The stored cursor must equal
	/// `expected_cursor` (case-insensitive); a missing row with a non-empty
	/// expectation is the same conflict. Conflicts leave state untouched.
	async fn advance(&self, advance: AdvanceCursor) -> Result<SyncCursor, StoreError>;

	/// Blind write used for invalidation recovery
	async fn upsert(&self, upsert: UpsertCursor) -> Result<SyncCursor, StoreError>;
}

#[async_trait::async_trait]
pub trait SyncJobStore: Send + Sync {
	/// With a non-empty idempotency key the job and its idempotency row are
	/// inserted in one transaction; a unique violation returns the existing
	/// job with `created = false`
	async fn create_sync_job(&self, create: CreateSyncJob) -> Result<CreatedSyncJob, StoreError>;

	async fn sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError>;

	/// Atomic checkpoint update; preserves `created_at`
	async fn save_checkpoint(
		&self,
		id: &SyncJobId,
		checkpoint: Option<String>,
		metadata: Option<Map<String, Value>>,
	) -> Result<SyncJob, StoreError>;

	async fn mark_running(&self, id: &SyncJobId) -> Result<SyncJob, StoreError>;

	async fn fail_sync_job(
		&self,
		id: &SyncJobId,
		error: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<SyncJob, StoreError>;

	/// `failed → queued`, preserving the checkpoint
	async fn resume_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError>;

	async fn complete_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError>;

	async fn cancel_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError>;

	/// The non-terminal job for `(connection, mode)`, if any
	async fn active_sync_job(
		&self,
		connection_id: &ConnectionId,
		mode: SyncJobMode,
	) -> Result<Option<SyncJob>, StoreError>;
}

/// Input for a webhook claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimDelivery {
	pub provider_id: ProviderId,
	pub delivery_id: String,
	pub payload: Vec<u8>,
	pub lease: Duration,
	pub now: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait WebhookDeliveryLedger: Send + Sync {
	/// Insert-if-absent then CAS to `processing`. Returns the claim whose
	/// attempt number makes completion conditional, or `None` when the
	/// delivery is not claimable (duplicate within lease, already
	/// processed, dead, or retry not yet due).
	async fn claim_delivery(
		&self,
		claim: ClaimDelivery,
	) -> Result<Option<DeliveryClaim>, StoreError>;

	/// Conditional on `status = processing` and the claimed attempt;
	/// returns false when the claim went stale
	async fn complete_delivery(&self, claim: &DeliveryClaim) -> Result<bool, StoreError>;

	/// Schedules a retry or dead-letters at `max_attempts`. A missing row
	/// is an error; a stale attempt is a no-op returning `None`.
	async fn fail_delivery(
		&self,
		claim: &DeliveryClaim,
		error: &str,
		next_attempt_at: DateTime<Utc>,
		max_attempts: i32,
	) -> Result<Option<WebhookDeliveryStatus>, StoreError>;

	async fn delivery(
		&self,
		provider_id: &ProviderId,
		delivery_id: &str,
	) -> Result<Option<WebhookDelivery>, StoreError>;
}

#[async_trait::async_trait]
pub trait RateLimitStateStore: Send + Sync {
	/// `StateNotFound` when the bucket has never been observed
	async fn rate_limit_state(&self, key: &RateLimitKey) -> Result<RateLimitState, StoreError>;

	/// Blind write; read-modify-write is the caller's responsibility
	async fn upsert_rate_limit_state(&self, state: RateLimitState) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
	async fn enqueue_event(&self, event: LifecycleEvent) -> Result<OutboxEntry, StoreError>;

	/// One transaction: select up to `limit` due rows ordered by
	/// `occurred_at`, mark them `processing` with a re-claim lease, and
	/// return them with `metadata.attempts` populated
	async fn claim_event_batch(
		&self,
		limit: usize,
		now: DateTime<Utc>,
		lease: Duration,
	) -> Result<Vec<OutboxEntry>, StoreError>;

	/// Idempotent; clears error and next attempt
	async fn ack_event(&self, event_id: &EventId) -> Result<(), StoreError>;

	/// Increments attempts; `None` next attempt dead-ends the row as
	/// `failed`, otherwise it returns to `pending`
	async fn retry_event(
		&self,
		event_id: &EventId,
		cause: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<OutboxStatus, StoreError>;
}

#[async_trait::async_trait]
pub trait NotificationDispatchLedger: Send + Sync {
	async fn dispatch_seen(&self, idempotency_key: &str) -> Result<bool, StoreError>;

	/// Unique violation on the idempotency key is a silent no-op
	async fn record_dispatch(&self, dispatch: NotificationDispatch) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait ServicesActivitySink: Send + Sync {
	async fn record_activity(
		&self,
		activity: NewServiceActivity,
	) -> Result<ServiceActivity, StoreError>;
}

#[async_trait::async_trait]
pub trait ActivityRetentionPruner: Send + Sync {
	/// Delete entries older than the TTL, then trim the oldest beyond the
	/// row cap; returns the number deleted
	async fn prune_activity(
		&self,
		policy: &RetentionPolicy,
		now: DateTime<Utc>,
	) -> Result<u64, StoreError>;
}

/// The full set of store contracts the runtime is wired with.
#[derive(Clone)]
pub struct RuntimeStores {
	pub connections: Arc<dyn ConnectionStore>,
	pub credentials: Arc<dyn CredentialStore>,
	pub grants: Arc<dyn GrantStore>,
	pub installations: Arc<dyn InstallationStore>,
	pub subscriptions: Arc<dyn SubscriptionStore>,
	pub sync_cursors: Arc<dyn SyncCursorStore>,
	pub sync_jobs: Arc<dyn SyncJobStore>,
	pub webhook_deliveries: Arc<dyn WebhookDeliveryLedger>,
	pub rate_limits: Arc<dyn RateLimitStateStore>,
	pub outbox: Arc<dyn OutboxStore>,
	pub dispatches: Arc<dyn NotificationDispatchLedger>,
	pub activity: Arc<dyn ServicesActivitySink>,
	pub activity_pruner: Arc<dyn ActivityRetentionPruner>,
}

impl core::fmt::Debug for RuntimeStores {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("RuntimeStores").finish_non_exhaustive()
	}
}
