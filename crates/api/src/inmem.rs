//! In-memory implementations of every store contract, for tests and
//! devmode. One mutex guards the whole state, which makes the multi-row
//! invariants (rotation, idempotent job creation, batch claims) atomic the
//! same way the database transactions do.

use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
	time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use common::{
	activity::{NewServiceActivity, RetentionPolicy, ServiceActivity},
	connection::{
		Connection, ConnectionStatus, Credential, CredentialStatus, NewConnection, NewCredential,
	},
	grants::{GrantEvent, GrantSnapshot, NewGrantEvent, NewGrantSnapshot},
	ids::{
		ActivityEntryId, ConnectionId, CredentialId, EventId, InstallationId, ProviderId,
		SubscriptionId, SyncJobId,
	},
	installation::{Installation, InstallationStatus, UpsertInstallation},
	outbox::{LifecycleEvent, NotificationDispatch, OutboxEntry, OutboxStatus},
	ratelimit::{RateLimitKey, RateLimitState},
	redaction::redact_metadata,
	scope::ScopeRef,
	store::{
		ActivityRetentionPruner, ClaimDelivery, ConnectionStore, CredentialRotation,
		CredentialStore, GrantStore, InstallationStore, NotificationDispatchLedger, OutboxStore,
		RateLimitStateStore, RuntimeStores, ServicesActivitySink, StoreError, SubscriptionStore,
		SyncCursorStore, SyncJobStore, WebhookDeliveryLedger,
	},
	subscription::{NewSubscription, Subscription, SubscriptionStatus},
	sync::{
		AdvanceCursor, CreateSyncJob, CreatedSyncJob, SyncCursor, SyncJob, SyncJobMode,
		SyncJobStatus, UpsertCursor,
	},
	webhook::{DeliveryClaim, WebhookDelivery, WebhookDeliveryStatus, DEFAULT_CLAIM_LEASE},
};

type CursorKey = (ConnectionId, String, String);
type IdempotencyKey = (String, String, String, String, String);
type DeliveryKey = (ProviderId, String);

#[derive(Default)]
struct Inner {
	connections: BTreeMap<ConnectionId, Connection>,
	credentials: BTreeMap<CredentialId, Credential>,
	snapshots: Vec<GrantSnapshot>,
	grant_events: Vec<GrantEvent>,
	installations: BTreeMap<(ProviderId, String, String), Installation>,
	subscriptions: BTreeMap<SubscriptionId, Subscription>,
	cursors: BTreeMap<CursorKey, SyncCursor>,
	jobs: BTreeMap<SyncJobId, SyncJob>,
	job_idempotency: HashMap<IdempotencyKey, SyncJobId>,
	deliveries: BTreeMap<DeliveryKey, WebhookDelivery>,
	rate_limits: BTreeMap<RateLimitKey, RateLimitState>,
	outbox: BTreeMap<EventId, OutboxEntry>,
	dispatches: BTreeMap<String, NotificationDispatch>,
	activity: Vec<ServiceActivity>,
}

/// The in-memory substitute. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct InMemStores {
	inner: Arc<Mutex<Inner>>,
}

impl InMemStores {
	pub fn new() -> Self {
		Self::default()
	}

	/// The full contract bundle backed by this instance
	pub fn stores(&self) -> RuntimeStores {
		let this = Arc::new(self.clone());
		RuntimeStores {
			connections: this.clone(),
			credentials: this.clone(),
			grants: this.clone(),
			installations: this.clone(),
			subscriptions: this.clone(),
			sync_cursors: this.clone(),
			sync_jobs: this.clone(),
			webhook_deliveries: this.clone(),
			rate_limits: this.clone(),
			outbox: this.clone(),
			dispatches: this.clone(),
			activity: this.clone(),
			activity_pruner: this,
		}
	}

	/// Test hook: every event currently in the outbox, in occurred order
	pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
		let inner = self.inner.lock();
		let mut entries: Vec<_> = inner.outbox.values().cloned().collect();
		entries.sort_by(|a, b| a.event.occurred_at.cmp(&b.event.occurred_at));
		entries
	}

	/// Test hook: recorded activity entries
	pub fn activity_entries(&self) -> Vec<ServiceActivity> {
		self.inner.lock().activity.clone()
	}
}

impl core::fmt::Debug for InMemStores {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("InMemStores").finish_non_exhaustive()
	}
}

fn unique_violation(constraint: &str) -> StoreError {
	StoreError::UniqueViolation(format!(
		"duplicate key value violates unique constraint \"{}\"",
		constraint
	))
}

#[async_trait::async_trait]
impl ConnectionStore for InMemStores {
	async fn insert_connection(&self, new: NewConnection) -> Result<Connection, StoreError> {
		let mut inner = self.inner.lock();

		let duplicate = inner.connections.values().any(|existing| {
			existing.deleted_at.is_none()
				&& existing.provider_id == new.provider_id
				&& existing.scope == new.scope
				&& existing.external_account_id == new.external_account_id
		});
		if duplicate {
			return Err(unique_violation("idx_connection_identity"));
		}

		let now = Utc::now();
		let connection = Connection {
			id: ConnectionId::generate(),
			provider_id: new.provider_id,
			scope: new.scope,
			external_account_id: new.external_account_id,
			status: ConnectionStatus::Active,
			inherits_from: new.inherits_from,
			last_error: None,
			created_at: now,
			updated_at: now,
			deleted_at: None,
		};
		inner.connections.insert(connection.id.clone(), connection.clone());
		Ok(connection)
	}

	async fn connection(&self, id: &ConnectionId) -> Result<Connection, StoreError> {
		self.inner.lock().connections.get(id).cloned().ok_or(StoreError::RecordNotFound)
	}

	async fn find_connection(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		external_account_id: &str,
	) -> Result<Option<Connection>, StoreError> {
		Ok(self
			.inner
			.lock()
			.connections
			.values()
			.find(|c| {
				c.deleted_at.is_none()
					&& &c.provider_id == provider_id
					&& &c.scope == scope
					&& c.external_account_id == external_account_id
			})
			.cloned())
	}

	async fn transition_status(
		&self,
		id: &ConnectionId,
		from: ConnectionStatus,
		to: ConnectionStatus,
	) -> Result<Connection, StoreError> {
		let mut inner = self.inner.lock();
		let connection = inner.connections.get_mut(id).ok_or(StoreError::RecordNotFound)?;

		if connection.status != from || connection.deleted_at.is_some() {
			return Err(StoreError::InvalidTransition {
				from: from.as_str().to_owned(),
				to: to.as_str().to_owned(),
			});
		}

		connection.status = to;
		connection.updated_at = Utc::now();
		Ok(connection.clone())
	}

	async fn set_last_error(
		&self,
		id: &ConnectionId,
		error: Option<String>,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		let connection = inner.connections.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		connection.last_error = error;
		connection.updated_at = Utc::now();
		Ok(())
	}

	async fn soft_delete_connection(&self, id: &ConnectionId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		let connection = inner.connections.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		if connection.deleted_at.is_some() {
			return Err(StoreError::RecordNotFound);
		}
		let now = Utc::now();
		connection.deleted_at = Some(now);
		connection.updated_at = now;
		Ok(())
	}

	async fn list_connections_for_scope(
		&self,
		scope: &ScopeRef,
		include_deleted: bool,
	) -> Result<Vec<Connection>, StoreError> {
		let inner = self.inner.lock();
		let mut connections: Vec<_> = inner
			.connections
			.values()
			.filter(|c| &c.scope == scope && (include_deleted || c.deleted_at.is_none()))
			.cloned()
			.collect();
		connections.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		Ok(connections)
	}
}

fn next_snapshot_version(inner: &Inner, connection_id: &ConnectionId) -> i32 {
	inner
		.snapshots
		.iter()
		.filter(|s| &s.connection_id == connection_id)
		.map(|s| s.version)
		.max()
		.unwrap_or(0)
		+ 1
}

fn push_snapshot(
	inner: &mut Inner,
	snapshot: NewGrantSnapshot,
	event: Option<NewGrantEvent>,
) -> GrantSnapshot {
	let version = next_snapshot_version(inner, &snapshot.connection_id);
	let stored = GrantSnapshot {
		connection_id: snapshot.connection_id,
		version,
		requested: snapshot.requested,
		granted: snapshot.granted,
		captured_at: Utc::now(),
		metadata: redact_metadata(&snapshot.metadata),
	};
	inner.snapshots.push(stored.clone());

	if let Some(event) = event {
		inner.grant_events.push(GrantEvent {
			connection_id: event.connection_id,
			event_type: event.event_type,
			added: event.added,
			removed: event.removed,
			occurred_at: Utc::now(),
			metadata: redact_metadata(&event.metadata),
		});
	}

	stored
}

#[async_trait::async_trait]
impl CredentialStore for InMemStores {
	async fn active_credential(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Option<Credential>, StoreError> {
		Ok(self
			.inner
			.lock()
			.credentials
			.values()
			.find(|c| {
				&c.connection_id == connection_id && c.status == CredentialStatus::Active
			})
			.cloned())
	}

	async fn rotate_credential(
		&self,
		new: NewCredential,
		snapshot: NewGrantSnapshot,
		event: Option<NewGrantEvent>,
	) -> Result<CredentialRotation, StoreError> {
		let mut inner = self.inner.lock();
		let now = Utc::now();

		let prior_id = inner
			.credentials
			.values()
			.find(|c| {
				c.connection_id == new.connection_id && c.status == CredentialStatus::Active
			})
			.map(|c| c.id.clone());

		if let Some(prior_id) = &prior_id {
			let prior = inner.credentials.get_mut(prior_id).expect("prior credential");
			prior.status = CredentialStatus::Revoked;
			prior.revocation_reason = Some("rotated".to_owned());
			prior.updated_at = now;
		}

		let version = inner
			.credentials
			.values()
			.filter(|c| c.connection_id == new.connection_id)
			.map(|c| c.version)
			.max()
			.unwrap_or(0)
			+ 1;

		let stored_snapshot = push_snapshot(&mut inner, snapshot, event);

		let credential = Credential {
			id: CredentialId::generate(),
			connection_id: new.connection_id,
			version,
			encrypted_payload: new.encrypted_payload,
			payload_format: new.payload_format,
			payload_version: new.payload_version,
			token_type: new.token_type,
			requested_scopes: new.requested_scopes,
			granted_scopes: new.granted_scopes,
			expires_at: new.expires_at,
			rotates_at: new.rotates_at,
			refreshable: new.refreshable,
			status: CredentialStatus::Active,
			grant_version: stored_snapshot.version,
			encryption_key_id: new.encryption_key_id,
			encryption_version: new.encryption_version,
			revocation_reason: None,
			created_at: now,
			updated_at: now,
		};
		inner.credentials.insert(credential.id.clone(), credential.clone());

		Ok(CredentialRotation { credential, snapshot: stored_snapshot, revoked: prior_id })
	}

	async fn revoke_active(
		&self,
		connection_id: &ConnectionId,
		reason: &str,
	) -> Result<Option<Credential>, StoreError> {
		let mut inner = self.inner.lock();
		let id = inner
			.credentials
			.values()
			.find(|c| {
				&c.connection_id == connection_id && c.status == CredentialStatus::Active
			})
			.map(|c| c.id.clone());

		Ok(id.map(|id| {
			let credential = inner.credentials.get_mut(&id).expect("active credential");
			credential.status = CredentialStatus::Revoked;
			credential.revocation_reason = Some(reason.to_owned());
			credential.updated_at = Utc::now();
			credential.clone()
		}))
	}

	async fn credential_history(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<Credential>, StoreError> {
		let inner = self.inner.lock();
		let mut history: Vec<_> = inner
			.credentials
			.values()
			.filter(|c| &c.connection_id == connection_id)
			.cloned()
			.collect();
		history.sort_by_key(|c| c.version);
		Ok(history)
	}
}

#[async_trait::async_trait]
impl GrantStore for InMemStores {
	async fn latest_snapshot(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Option<GrantSnapshot>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner
			.snapshots
			.iter()
			.filter(|s| &s.connection_id == connection_id)
			.max_by(|a, b| (a.version, a.captured_at).cmp(&(b.version, b.captured_at)))
			.cloned())
	}

	async fn save_snapshot_with_event(
		&self,
		snapshot: NewGrantSnapshot,
		event: Option<NewGrantEvent>,
	) -> Result<GrantSnapshot, StoreError> {
		let mut inner = self.inner.lock();
		Ok(push_snapshot(&mut inner, snapshot, event))
	}

	async fn snapshot_history(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<GrantSnapshot>, StoreError> {
		let inner = self.inner.lock();
		let mut history: Vec<_> = inner
			.snapshots
			.iter()
			.filter(|s| &s.connection_id == connection_id)
			.cloned()
			.collect();
		history.sort_by_key(|s| s.version);
		Ok(history)
	}

	async fn grant_events(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<GrantEvent>, StoreError> {
		Ok(self
			.inner
			.lock()
			.grant_events
			.iter()
			.filter(|e| &e.connection_id == connection_id)
			.cloned()
			.collect())
	}
}

#[async_trait::async_trait]
impl InstallationStore for InMemStores {
	async fn upsert_installation(
		&self,
		upsert: UpsertInstallation,
	) -> Result<Installation, StoreError> {
		let mut inner = self.inner.lock();
		let key = (
			upsert.provider_id.clone(),
			upsert.scope.scope_type.to_string(),
			upsert.scope.id.clone(),
		);
		let now = Utc::now();
		let revoked_at = match upsert.status {
			InstallationStatus::Uninstalled => Some(now),
			_ => None,
		};

		let installation = match inner.installations.get(&key) {
			Some(existing) => Installation {
				id: existing.id.clone(),
				provider_id: upsert.provider_id,
				scope: upsert.scope,
				install_type: upsert.install_type,
				status: upsert.status,
				granted_at: upsert.granted_at,
				revoked_at,
				metadata: redact_metadata(&upsert.metadata),
				created_at: existing.created_at,
				updated_at: now,
			},
			None => Installation {
				id: InstallationId::generate(),
				provider_id: upsert.provider_id,
				scope: upsert.scope,
				install_type: upsert.install_type,
				status: upsert.status,
				granted_at: upsert.granted_at,
				revoked_at,
				metadata: redact_metadata(&upsert.metadata),
				created_at: now,
				updated_at: now,
			},
		};

		inner.installations.insert(key, installation.clone());
		Ok(installation)
	}

	async fn update_installation_status(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		status: InstallationStatus,
	) -> Result<Installation, StoreError> {
		let mut inner = self.inner.lock();
		let key = (provider_id.clone(), scope.scope_type.to_string(), scope.id.clone());
		let installation = inner.installations.get_mut(&key).ok_or(StoreError::RecordNotFound)?;

		if !installation.status.can_update_to(status) {
			return Err(StoreError::InvalidTransition {
				from: installation.status.as_str().to_owned(),
				to: status.as_str().to_owned(),
			});
		}

		let now = Utc::now();
		installation.status = status;
		if status == InstallationStatus::Uninstalled {
			installation.revoked_at = Some(now);
		}
		installation.updated_at = now;
		Ok(installation.clone())
	}

	async fn installation(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
	) -> Result<Option<Installation>, StoreError> {
		let key = (provider_id.clone(), scope.scope_type.to_string(), scope.id.clone());
		Ok(self.inner.lock().installations.get(&key).cloned())
	}
}

#[async_trait::async_trait]
impl SubscriptionStore for InMemStores {
	async fn insert_subscription(
		&self,
		new: NewSubscription,
	) -> Result<Subscription, StoreError> {
		let mut inner = self.inner.lock();

		let duplicate = inner.subscriptions.values().any(|s| {
			s.deleted_at.is_none()
				&& s.provider_id == new.provider_id
				&& s.channel_id == new.channel_id
		});
		if duplicate {
			return Err(unique_violation("idx_subscription_channel"));
		}

		let now = Utc::now();
		let subscription = Subscription {
			id: SubscriptionId::generate(),
			connection_id: new.connection_id,
			provider_id: new.provider_id,
			resource_type: new.resource_type,
			resource_id: new.resource_id,
			channel_id: new.channel_id,
			remote_subscription_id: new.remote_subscription_id,
			callback_url: new.callback_url,
			verification_token_ref: new.verification_token_ref,
			status: SubscriptionStatus::Active,
			expires_at: new.expires_at,
			last_notified_at: None,
			metadata: redact_metadata(&new.metadata),
			created_at: now,
			updated_at: now,
			deleted_at: None,
		};
		inner.subscriptions.insert(subscription.id.clone(), subscription.clone());
		Ok(subscription)
	}

	async fn subscription(&self, id: &SubscriptionId) -> Result<Subscription, StoreError> {
		self.inner.lock().subscriptions.get(id).cloned().ok_or(StoreError::RecordNotFound)
	}

	async fn subscription_by_channel(
		&self,
		provider_id: &ProviderId,
		channel_id: &str,
	) -> Result<Option<Subscription>, StoreError> {
		Ok(self
			.inner
			.lock()
			.subscriptions
			.values()
			.find(|s| {
				s.deleted_at.is_none()
					&& &s.provider_id == provider_id
					&& s.channel_id == channel_id
			})
			.cloned())
	}

	async fn update_subscription_status(
		&self,
		id: &SubscriptionId,
		status: SubscriptionStatus,
	) -> Result<Subscription, StoreError> {
		let mut inner = self.inner.lock();
		let subscription = inner.subscriptions.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		if subscription.deleted_at.is_some() {
			return Err(StoreError::RecordNotFound);
		}
		subscription.status = status;
		subscription.updated_at = Utc::now();
		Ok(subscription.clone())
	}

	async fn renew_subscription(
		&self,
		id: &SubscriptionId,
		remote_subscription_id: Option<String>,
		expires_at: Option<DateTime<Utc>>,
	) -> Result<Subscription, StoreError> {
		let mut inner = self.inner.lock();
		let subscription = inner.subscriptions.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		if subscription.deleted_at.is_some() {
			return Err(StoreError::RecordNotFound);
		}
		if remote_subscription_id.is_some() {
			subscription.remote_subscription_id = remote_subscription_id;
		}
		if expires_at.is_some() {
			subscription.expires_at = expires_at;
		}
		subscription.status = SubscriptionStatus::Active;
		subscription.updated_at = Utc::now();
		Ok(subscription.clone())
	}

	async fn mark_notified(
		&self,
		id: &SubscriptionId,
		at: DateTime<Utc>,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		if let Some(subscription) = inner.subscriptions.get_mut(id) {
			subscription.last_notified_at = Some(at);
		}
		Ok(())
	}

	async fn expiring_subscriptions(
		&self,
		before: DateTime<Utc>,
	) -> Result<Vec<Subscription>, StoreError> {
		let inner = self.inner.lock();
		let mut due: Vec<_> = inner
			.subscriptions
			.values()
			.filter(|s| {
				s.deleted_at.is_none()
					&& s.status == SubscriptionStatus::Active
					&& s.expires_at.map(|at| at <= before).unwrap_or(false)
			})
			.cloned()
			.collect();
		due.sort_by_key(|s| s.expires_at);
		Ok(due)
	}

	async fn soft_delete_subscription(&self, id: &SubscriptionId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		let subscription = inner.subscriptions.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		if subscription.deleted_at.is_some() {
			return Err(StoreError::RecordNotFound);
		}
		let now = Utc::now();
		subscription.deleted_at = Some(now);
		subscription.updated_at = now;
		Ok(())
	}
}

#[async_trait::async_trait]
impl SyncCursorStore for InMemStores {
	async fn cursor(
		&self,
		connection_id: &ConnectionId,
		resource_type: &str,
		resource_id: &str,
	) -> Result<Option<SyncCursor>, StoreError> {
		let key =
			(connection_id.clone(), resource_type.to_owned(), resource_id.to_owned());
		Ok(self.inner.lock().cursors.get(&key).cloned())
	}

	async fn advance(&self, advance: AdvanceCursor) -> Result<SyncCursor, StoreError> {
		let mut inner = self.inner.lock();
		let key = (
			advance.connection_id.clone(),
			advance.resource_type.clone(),
			advance.resource_id.clone(),
		);
		let now = Utc::now();

		match inner.cursors.get_mut(&key) {
			None => {
				if !advance.expected_cursor.is_empty() {
					return Err(StoreError::SyncCursorConflict);
				}
				let cursor = SyncCursor {
					connection_id: advance.connection_id,
					provider_id: advance.provider_id,
					resource_type: advance.resource_type,
					resource_id: advance.resource_id,
					cursor: advance.cursor,
					status: advance.status.unwrap_or_else(|| "active".to_owned()),
					last_synced_at: advance.last_synced_at,
					metadata: redact_metadata(&advance.metadata.unwrap_or_default()),
					updated_at: now,
				};
				inner.cursors.insert(key, cursor.clone());
				Ok(cursor)
			},
			Some(stored) => {
				if !stored.cursor.eq_ignore_ascii_case(&advance.expected_cursor) {
					return Err(StoreError::SyncCursorConflict);
				}
				stored.cursor = advance.cursor;
				if let Some(status) = advance.status {
					stored.status = status;
				}
				if advance.last_synced_at.is_some() {
					stored.last_synced_at = advance.last_synced_at;
				}
				if let Some(metadata) = advance.metadata {
					stored.metadata = redact_metadata(&metadata);
				}
				stored.updated_at = now;
				Ok(stored.clone())
			},
		}
	}

	async fn upsert(&self, upsert: UpsertCursor) -> Result<SyncCursor, StoreError> {
		let mut inner = self.inner.lock();
		let key = (
			upsert.connection_id.clone(),
			upsert.resource_type.clone(),
			upsert.resource_id.clone(),
		);
		let cursor = SyncCursor {
			connection_id: upsert.connection_id,
			provider_id: upsert.provider_id,
			resource_type: upsert.resource_type,
			resource_id: upsert.resource_id,
			cursor: upsert.cursor,
			status: upsert.status.unwrap_or_else(|| "active".to_owned()),
			last_synced_at: upsert.last_synced_at,
			metadata: redact_metadata(&upsert.metadata.unwrap_or_default()),
			updated_at: Utc::now(),
		};
		inner.cursors.insert(key, cursor.clone());
		Ok(cursor)
	}
}

fn new_job(create: &CreateSyncJob, now: DateTime<Utc>) -> SyncJob {
	SyncJob {
		id: SyncJobId::from(Uuid::new_v4().to_string()),
		connection_id: create.connection_id.clone(),
		provider_id: create.provider_id.clone(),
		mode: create.mode,
		checkpoint: create.checkpoint.clone(),
		status: SyncJobStatus::Queued,
		attempts: 0,
		next_attempt_at: None,
		last_error: None,
		metadata: redact_metadata(&create.metadata),
		created_at: now,
		updated_at: now,
	}
}

#[async_trait::async_trait]
impl SyncJobStore for InMemStores {
	async fn create_sync_job(&self, create: CreateSyncJob) -> Result<CreatedSyncJob, StoreError> {
		let mut inner = self.inner.lock();
		let now = Utc::now();

		match create.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
			Some(key) => {
				let ledger_key = (
					create.scope.scope_type.to_string(),
					create.scope.id.clone(),
					create.provider_id.to_string(),
					create.mode.as_str().to_owned(),
					key.to_owned(),
				);

				if let Some(job_id) = inner.job_idempotency.get(&ledger_key) {
					let job =
						inner.jobs.get(job_id).cloned().ok_or(StoreError::RecordNotFound)?;
					return Ok(CreatedSyncJob { job, created: false });
				}

				let job = new_job(&create, now);
				inner.job_idempotency.insert(ledger_key, job.id.clone());
				inner.jobs.insert(job.id.clone(), job.clone());
				Ok(CreatedSyncJob { job, created: true })
			},
			None => {
				let open = inner
					.jobs
					.values()
					.filter(|job| {
						job.connection_id == create.connection_id
							&& job.mode == create.mode
							&& !job.status.is_terminal()
					})
					.max_by_key(|job| job.created_at)
					.cloned();

				if let Some(job) = open {
					return Ok(CreatedSyncJob { job, created: false });
				}

				let job = new_job(&create, now);
				inner.jobs.insert(job.id.clone(), job.clone());
				Ok(CreatedSyncJob { job, created: true })
			},
		}
	}

	async fn sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		self.inner.lock().jobs.get(id).cloned().ok_or(StoreError::RecordNotFound)
	}

	async fn save_checkpoint(
		&self,
		id: &SyncJobId,
		checkpoint: Option<String>,
		metadata: Option<Map<String, Value>>,
	) -> Result<SyncJob, StoreError> {
		let mut inner = self.inner.lock();
		let job = inner.jobs.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		job.checkpoint = checkpoint;
		if let Some(metadata) = metadata {
			job.metadata = redact_metadata(&metadata);
		}
		job.updated_at = Utc::now();
		Ok(job.clone())
	}

	async fn mark_running(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let mut inner = self.inner.lock();
		let job = inner.jobs.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		if job.status != SyncJobStatus::Queued {
			return Err(StoreError::InvalidTransition {
				from: job.status.as_str().to_owned(),
				to: SyncJobStatus::Running.as_str().to_owned(),
			});
		}
		job.status = SyncJobStatus::Running;
		job.updated_at = Utc::now();
		Ok(job.clone())
	}

	async fn fail_sync_job(
		&self,
		id: &SyncJobId,
		error: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<SyncJob, StoreError> {
		let mut inner = self.inner.lock();
		let job = inner.jobs.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		job.status = SyncJobStatus::Failed;
		job.attempts += 1;
		job.next_attempt_at = next_attempt_at;
		job.last_error = Some(error.to_owned());
		job.updated_at = Utc::now();
		Ok(job.clone())
	}

	async fn resume_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let mut inner = self.inner.lock();
		let job = inner.jobs.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		if job.status != SyncJobStatus::Failed {
			return Err(StoreError::InvalidTransition {
				from: job.status.as_str().to_owned(),
				to: SyncJobStatus::Queued.as_str().to_owned(),
			});
		}
		job.status = SyncJobStatus::Queued;
		job.next_attempt_at = None;
		job.updated_at = Utc::now();
		Ok(job.clone())
	}

	async fn complete_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let mut inner = self.inner.lock();
		let job = inner.jobs.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		job.status = SyncJobStatus::Succeeded;
		job.updated_at = Utc::now();
		Ok(job.clone())
	}

	async fn cancel_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let mut inner = self.inner.lock();
		let job = inner.jobs.get_mut(id).ok_or(StoreError::RecordNotFound)?;
		job.status = SyncJobStatus::Cancelled;
		job.updated_at = Utc::now();
		Ok(job.clone())
	}

	async fn active_sync_job(
		&self,
		connection_id: &ConnectionId,
		mode: SyncJobMode,
	) -> Result<Option<SyncJob>, StoreError> {
		let inner = self.inner.lock();
		Ok(inner
			.jobs
			.values()
			.filter(|job| {
				&job.connection_id == connection_id
					&& job.mode == mode
					&& !job.status.is_terminal()
			})
			.max_by_key(|job| job.created_at)
			.cloned())
	}
}

#[async_trait::async_trait]
impl WebhookDeliveryLedger for InMemStores {
	async fn claim_delivery(
		&self,
		claim: ClaimDelivery,
	) -> Result<Option<DeliveryClaim>, StoreError> {
		let lease = if claim.lease == Duration::ZERO { DEFAULT_CLAIM_LEASE } else { claim.lease };
		let lease = chrono::Duration::from_std(lease)
			.map_err(|e| StoreError::InvalidRecord(format!("claim lease: {e}")))?;
		let now = claim.now;

		let mut inner = self.inner.lock();
		let key = (claim.provider_id.clone(), claim.delivery_id.clone());

		let delivery = inner.deliveries.entry(key).or_insert_with(|| WebhookDelivery {
			provider_id: claim.provider_id.clone(),
			delivery_id: claim.delivery_id.clone(),
			status: WebhookDeliveryStatus::Pending,
			attempts: 0,
			next_attempt_at: None,
			payload: claim.payload.clone(),
			last_error: None,
			created_at: now,
			updated_at: now,
		});

		let lease_lapsed =
			delivery.next_attempt_at.map(|at| at <= now).unwrap_or(false);
		let claimable = match delivery.status {
			WebhookDeliveryStatus::Pending => true,
			WebhookDeliveryStatus::RetryReady => lease_lapsed,
			WebhookDeliveryStatus::Processing => lease_lapsed,
			WebhookDeliveryStatus::Processed | WebhookDeliveryStatus::Dead => false,
		};

		if !claimable {
			return Ok(None);
		}

		delivery.status = WebhookDeliveryStatus::Processing;
		delivery.attempts += 1;
		delivery.next_attempt_at = Some(now + lease);
		delivery.updated_at = now;

		Ok(Some(DeliveryClaim {
			provider_id: claim.provider_id,
			delivery_id: claim.delivery_id,
			attempts: delivery.attempts,
		}))
	}

	async fn complete_delivery(&self, claim: &DeliveryClaim) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		let key = (claim.provider_id.clone(), claim.delivery_id.clone());
		let Some(delivery) = inner.deliveries.get_mut(&key) else {
			return Ok(false);
		};

		if delivery.status != WebhookDeliveryStatus::Processing
			|| delivery.attempts != claim.attempts
		{
			return Ok(false);
		}

		delivery.status = WebhookDeliveryStatus::Processed;
		delivery.next_attempt_at = None;
		delivery.last_error = None;
		delivery.updated_at = Utc::now();
		Ok(true)
	}

	async fn fail_delivery(
		&self,
		claim: &DeliveryClaim,
		error: &str,
		next_attempt_at: DateTime<Utc>,
		max_attempts: i32,
	) -> Result<Option<WebhookDeliveryStatus>, StoreError> {
		let mut inner = self.inner.lock();
		let key = (claim.provider_id.clone(), claim.delivery_id.clone());
		let delivery = inner.deliveries.get_mut(&key).ok_or(StoreError::RecordNotFound)?;

		if delivery.status != WebhookDeliveryStatus::Processing
			|| delivery.attempts != claim.attempts
		{
			return Ok(None);
		}

		let status = if claim.attempts >= max_attempts {
			delivery.next_attempt_at = None;
			WebhookDeliveryStatus::Dead
		} else {
			delivery.next_attempt_at = Some(next_attempt_at);
			WebhookDeliveryStatus::RetryReady
		};
		delivery.status = status;
		delivery.last_error = Some(error.to_owned());
		delivery.updated_at = Utc::now();
		Ok(Some(status))
	}

	async fn delivery(
		&self,
		provider_id: &ProviderId,
		delivery_id: &str,
	) -> Result<Option<WebhookDelivery>, StoreError> {
		let key = (provider_id.clone(), delivery_id.to_owned());
		Ok(self.inner.lock().deliveries.get(&key).cloned())
	}
}

#[async_trait::async_trait]
impl RateLimitStateStore for InMemStores {
	async fn rate_limit_state(&self, key: &RateLimitKey) -> Result<RateLimitState, StoreError> {
		self.inner.lock().rate_limits.get(key).cloned().ok_or(StoreError::StateNotFound)
	}

	async fn upsert_rate_limit_state(&self, state: RateLimitState) -> Result<(), StoreError> {
		// Round-trip the reserved metadata keys so behavior matches the
		// database-backed store exactly
		let mut stored = state.clone();
		stored.apply_stored_metadata(state.to_stored_metadata());
		self.inner.lock().rate_limits.insert(stored.key.clone(), stored);
		Ok(())
	}
}

#[async_trait::async_trait]
impl OutboxStore for InMemStores {
	async fn enqueue_event(&self, event: LifecycleEvent) -> Result<OutboxEntry, StoreError> {
		let now = Utc::now();
		let entry = OutboxEntry {
			event,
			status: OutboxStatus::Pending,
			attempts: 0,
			next_attempt_at: None,
			last_error: None,
			created_at: now,
			updated_at: now,
		};
		self.inner.lock().outbox.insert(entry.event.id.clone(), entry.clone());
		Ok(entry)
	}

	async fn claim_event_batch(
		&self,
		limit: usize,
		now: DateTime<Utc>,
		lease: Duration,
	) -> Result<Vec<OutboxEntry>, StoreError> {
		let lease = chrono::Duration::from_std(lease)
			.map_err(|e| StoreError::InvalidRecord(format!("claim lease: {e}")))?;
		let mut inner = self.inner.lock();

		let mut due: Vec<(DateTime<Utc>, EventId)> = inner
			.outbox
			.values()
			.filter(|entry| match entry.status {
				OutboxStatus::Pending =>
					entry.next_attempt_at.map(|at| at <= now).unwrap_or(true),
				OutboxStatus::Processing =>
					entry.next_attempt_at.map(|at| at <= now).unwrap_or(false),
				_ => false,
			})
			.map(|entry| (entry.event.occurred_at, entry.event.id.clone()))
			.collect();
		due.sort();
		due.truncate(limit);

		let mut claimed = Vec::with_capacity(due.len());
		for (_, id) in due {
			let entry = inner.outbox.get_mut(&id).expect("claimed entry");
			entry.status = OutboxStatus::Processing;
			entry.next_attempt_at = Some(now + lease);
			entry.updated_at = now;

			let mut snapshot = entry.clone();
			snapshot
				.event
				.metadata
				.insert("attempts".to_owned(), Value::from(snapshot.attempts));
			claimed.push(snapshot);
		}

		Ok(claimed)
	}

	async fn ack_event(&self, event_id: &EventId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		if let Some(entry) = inner.outbox.get_mut(event_id) {
			entry.status = OutboxStatus::Delivered;
			entry.last_error = None;
			entry.next_attempt_at = None;
			entry.updated_at = Utc::now();
		}
		Ok(())
	}

	async fn retry_event(
		&self,
		event_id: &EventId,
		cause: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<OutboxStatus, StoreError> {
		let mut inner = self.inner.lock();
		let entry = inner.outbox.get_mut(event_id).ok_or(StoreError::RecordNotFound)?;

		let status = match next_attempt_at {
			Some(_) => OutboxStatus::Pending,
			None => OutboxStatus::Failed,
		};
		entry.status = status;
		entry.attempts += 1;
		entry.next_attempt_at = next_attempt_at;
		entry.last_error = Some(cause.to_owned());
		entry.updated_at = Utc::now();
		Ok(status)
	}
}

#[async_trait::async_trait]
impl NotificationDispatchLedger for InMemStores {
	async fn dispatch_seen(&self, idempotency_key: &str) -> Result<bool, StoreError> {
		Ok(self.inner.lock().dispatches.contains_key(idempotency_key))
	}

	async fn record_dispatch(&self, dispatch: NotificationDispatch) -> Result<(), StoreError> {
		let mut inner = self.inner.lock();
		// Duplicate records are a silent no-op
		inner.dispatches.entry(dispatch.idempotency_key.clone()).or_insert(dispatch);
		Ok(())
	}
}

#[async_trait::async_trait]
impl ServicesActivitySink for InMemStores {
	async fn record_activity(
		&self,
		activity: NewServiceActivity,
	) -> Result<ServiceActivity, StoreError> {
		let entry = ServiceActivity {
			id: ActivityEntryId::generate(),
			provider_id: activity.provider_id,
			scope: activity.scope,
			connection_id: activity.connection_id,
			installation_id: activity.installation_id,
			subscription_id: activity.subscription_id,
			sync_job_id: activity.sync_job_id,
			channel: activity.channel,
			action: activity.action,
			object_type: activity.object_type,
			object_id: activity.object_id,
			actor: activity.actor,
			actor_type: activity.actor_type,
			status: activity.status,
			metadata: redact_metadata(&activity.metadata),
			created_at: Utc::now(),
		};
		self.inner.lock().activity.push(entry.clone());
		Ok(entry)
	}
}

#[async_trait::async_trait]
impl ActivityRetentionPruner for InMemStores {
	async fn prune_activity(
		&self,
		policy: &RetentionPolicy,
		now: DateTime<Utc>,
	) -> Result<u64, StoreError> {
		let ttl = chrono::Duration::from_std(policy.ttl)
			.map_err(|e| StoreError::InvalidRecord(format!("retention ttl: {e}")))?;
		let horizon = now - ttl;

		let mut inner = self.inner.lock();
		let before = inner.activity.len();
		inner.activity.retain(|entry| entry.created_at >= horizon);
		let expired = before - inner.activity.len();

		let over_cap = inner.activity.len().saturating_sub(policy.row_cap as usize);
		if over_cap > 0 {
			inner.activity.sort_by_key(|entry| entry.created_at);
			inner.activity.drain(0..over_cap);
		}

		Ok((expired + over_cap) as u64)
	}
}

#[cfg(test)]
mod test {
	use serde_json::json;

	use common::activity::NewServiceActivity;

	use super::*;

	fn scope() -> ScopeRef {
		ScopeRef::new("user", "u1").unwrap()
	}

	#[tokio::test]
	async fn sensitive_metadata_never_reaches_the_store() {
		let stores = InMemStores::new();
		let runtime = stores.stores();

		let mut metadata = Map::new();
		metadata.insert("access_token".to_owned(), json!("live-token"));
		metadata.insert(
			"nested".to_owned(),
			json!({"client_secret": "live-secret", "items": [{"api-key": "k"}]}),
		);
		metadata.insert("region".to_owned(), json!("eu"));

		runtime
			.activity
			.record_activity(
				NewServiceActivity::new(
					ProviderId::from("github"),
					scope(),
					"connection.refresh",
					"connection",
					"conn_1",
				)
				.with_metadata(metadata),
			)
			.await
			.unwrap();

		let recorded = &stores.activity_entries()[0];
		assert_eq!(recorded.metadata["access_token"], json!("[REDACTED]"));
		assert_eq!(recorded.metadata["nested"]["client_secret"], json!("[REDACTED]"));
		assert_eq!(recorded.metadata["nested"]["items"][0]["api-key"], json!("[REDACTED]"));
		assert_eq!(recorded.metadata["region"], json!("eu"));
		assert!(!serde_json::to_string(&recorded.metadata).unwrap().contains("live-"));
	}

	#[tokio::test]
	async fn retention_prunes_by_ttl_then_row_cap() {
		let stores = InMemStores::new();
		let runtime = stores.stores();

		for i in 0..6 {
			runtime
				.activity
				.record_activity(NewServiceActivity::new(
					ProviderId::from("github"),
					scope(),
					format!("action.{i}"),
					"connection",
					"conn_1",
				))
				.await
				.unwrap();
		}

		// Nothing is older than the TTL, but four rows exceed the cap
		let policy = RetentionPolicy { ttl: Duration::from_secs(3600), row_cap: 2 };
		let deleted = runtime.activity_pruner.prune_activity(&policy, Utc::now()).await.unwrap();
		assert_eq!(deleted, 4);
		assert_eq!(stores.activity_entries().len(), 2);

		// With everything past the TTL the ledger empties
		let deleted = runtime
			.activity_pruner
			.prune_activity(&policy, Utc::now() + chrono::Duration::seconds(7200))
			.await
			.unwrap();
		assert_eq!(deleted, 2);
		assert_eq!(stores.activity_entries().len(), 0);
	}

	#[tokio::test]
	async fn duplicate_dispatch_records_collapse_to_one_row() {
		let stores = InMemStores::new();
		let runtime = stores.stores();

		let dispatch = NotificationDispatch {
			event_id: EventId::from("evt_1"),
			projector: "notifications".to_owned(),
			definition_code: "connection.connected".to_owned(),
			recipient_key: "user:u1".to_owned(),
			idempotency_key: "notifications:evt_1".to_owned(),
			status: "delivered".to_owned(),
			error: None,
			metadata: Map::new(),
			created_at: Utc::now(),
		};

		runtime.dispatches.record_dispatch(dispatch.clone()).await.unwrap();
		let mut replay = dispatch.clone();
		replay.status = "replayed".to_owned();
		runtime.dispatches.record_dispatch(replay).await.unwrap();

		assert!(runtime.dispatches.dispatch_seen("notifications:evt_1").await.unwrap());
		// First write wins; the replay was a no-op
		assert_eq!(stores.inner.lock().dispatches.len(), 1);
		assert_eq!(
			stores.inner.lock().dispatches["notifications:evt_1"].status,
			"delivered"
		);
	}

	#[tokio::test]
	async fn connection_identity_is_unique_among_live_rows() {
		let stores = InMemStores::new();
		let runtime = stores.stores();

		let new = || NewConnection {
			provider_id: ProviderId::from("github"),
			scope: scope(),
			external_account_id: "acct_1".to_owned(),
			inherits_from: None,
		};

		let first = runtime.connections.insert_connection(new()).await.unwrap();
		let err = runtime.connections.insert_connection(new()).await.unwrap_err();
		assert!(matches!(err, StoreError::UniqueViolation(message)
			if message.contains("unique constraint")));

		// Soft-deleting the live row frees the identity tuple
		runtime.connections.soft_delete_connection(&first.id).await.unwrap();
		runtime.connections.insert_connection(new()).await.unwrap();
	}
}
