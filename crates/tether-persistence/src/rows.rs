use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde_json::{Map, Value};

use common::{
	activity::{ActivityStatus, ServiceActivity},
	connection::{Connection, ConnectionStatus, Credential, CredentialStatus},
	grants::{GrantEvent, GrantEventType, GrantSnapshot},
	ids::{
		ActivityEntryId, ConnectionId, CredentialId, EventId, InstallationId, ProviderId,
		SubscriptionId, SyncJobId,
	},
	installation::{Installation, InstallationStatus},
	outbox::{LifecycleEvent, NotificationDispatch, OutboxEntry, OutboxStatus},
	ratelimit::{RateLimitKey, RateLimitState},
	scope::ScopeRef,
	store::StoreError,
	subscription::{Subscription, SubscriptionStatus},
	sync::{SyncCursor, SyncJob, SyncJobMode, SyncJobStatus},
	webhook::{WebhookDelivery, WebhookDeliveryStatus},
};

use crate::schema::*;

pub(crate) fn json_text(metadata: &Map<String, Value>) -> Result<String, StoreError> {
	Ok(serde_json::to_string(metadata)?)
}

pub(crate) fn json_map(text: &str) -> Result<Map<String, Value>, StoreError> {
	if text.is_empty() {
		return Ok(Map::new());
	}
	Ok(serde_json::from_str(text)?)
}

pub(crate) fn json_list(items: &[String]) -> Result<String, StoreError> {
	Ok(serde_json::to_string(items)?)
}

pub(crate) fn list_from_json(text: &str) -> Result<Vec<String>, StoreError> {
	if text.is_empty() {
		return Ok(vec![]);
	}
	Ok(serde_json::from_str(text)?)
}

pub(crate) fn parse_stored<T>(value: &str) -> Result<T, StoreError>
where
	T: FromStr,
	T::Err: core::fmt::Display,
{
	value.parse().map_err(|e: T::Err| StoreError::InvalidRecord(e.to_string()))
}

pub(crate) fn scope_ref(scope_type: &str, scope_id: &str) -> Result<ScopeRef, StoreError> {
	ScopeRef::new(scope_type, scope_id).map_err(|e| StoreError::InvalidRecord(e.to_string()))
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = connection)]
pub struct ConnectionRow {
	pub id: String,
	pub provider_id: String,
	pub scope_type: String,
	pub scope_id: String,
	pub external_account_id: String,
	pub status: String,
	pub inherits_from: Option<String>,
	pub last_error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<ConnectionRow> for Connection {
	type Error = StoreError;

	fn try_from(row: ConnectionRow) -> Result<Self, Self::Error> {
		Ok(Connection {
			id: ConnectionId::from(row.id),
			provider_id: ProviderId::from(row.provider_id.as_str()),
			scope: scope_ref(&row.scope_type, &row.scope_id)?,
			external_account_id: row.external_account_id,
			status: parse_stored::<ConnectionStatus>(&row.status)?,
			inherits_from: row.inherits_from.map(ConnectionId::from),
			last_error: row.last_error,
			created_at: row.created_at,
			updated_at: row.updated_at,
			deleted_at: row.deleted_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = credential)]
pub struct CredentialRow {
	pub id: String,
	pub connection_id: String,
	pub version: i32,
	pub encrypted_payload: Vec<u8>,
	pub payload_format: String,
	pub payload_version: i32,
	pub token_type: String,
	pub requested_scopes: String,
	pub granted_scopes: String,
	pub expires_at: Option<DateTime<Utc>>,
	pub rotates_at: Option<DateTime<Utc>>,
	pub refreshable: bool,
	pub status: String,
	pub grant_version: i32,
	pub encryption_key_id: String,
	pub encryption_version: i32,
	pub revocation_reason: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<CredentialRow> for Credential {
	type Error = StoreError;

	fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
		Ok(Credential {
			id: CredentialId::from(row.id),
			connection_id: ConnectionId::from(row.connection_id),
			version: row.version,
			encrypted_payload: row.encrypted_payload,
			payload_format: row.payload_format,
			payload_version: row.payload_version,
			token_type: row.token_type,
			requested_scopes: list_from_json(&row.requested_scopes)?,
			granted_scopes: list_from_json(&row.granted_scopes)?,
			expires_at: row.expires_at,
			rotates_at: row.rotates_at,
			refreshable: row.refreshable,
			status: parse_stored::<CredentialStatus>(&row.status)?,
			grant_version: row.grant_version,
			encryption_key_id: row.encryption_key_id,
			encryption_version: row.encryption_version,
			revocation_reason: row.revocation_reason,
			created_at: row.created_at,
			updated_at: row.updated_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = grant_snapshot)]
pub struct GrantSnapshotRow {
	pub connection_id: String,
	pub version: i32,
	pub requested: String,
	pub granted: String,
	pub captured_at: DateTime<Utc>,
	pub metadata: String,
}

impl TryFrom<GrantSnapshotRow> for GrantSnapshot {
	type Error = StoreError;

	fn try_from(row: GrantSnapshotRow) -> Result<Self, Self::Error> {
		Ok(GrantSnapshot {
			connection_id: ConnectionId::from(row.connection_id),
			version: row.version,
			requested: list_from_json(&row.requested)?,
			granted: list_from_json(&row.granted)?,
			captured_at: row.captured_at,
			metadata: json_map(&row.metadata)?,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = grant_event)]
pub struct GrantEventRow {
	pub id: String,
	pub connection_id: String,
	pub event_type: String,
	pub added: String,
	pub removed: String,
	pub occurred_at: DateTime<Utc>,
	pub metadata: String,
}

impl TryFrom<GrantEventRow> for GrantEvent {
	type Error = StoreError;

	fn try_from(row: GrantEventRow) -> Result<Self, Self::Error> {
		Ok(GrantEvent {
			connection_id: ConnectionId::from(row.connection_id),
			event_type: parse_stored::<GrantEventType>(&row.event_type)?,
			added: list_from_json(&row.added)?,
			removed: list_from_json(&row.removed)?,
			occurred_at: row.occurred_at,
			metadata: json_map(&row.metadata)?,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = installation)]
pub struct InstallationRow {
	pub id: String,
	pub provider_id: String,
	pub scope_type: String,
	pub scope_id: String,
	pub install_type: String,
	pub status: String,
	pub granted_at: Option<DateTime<Utc>>,
	pub revoked_at: Option<DateTime<Utc>>,
	pub metadata: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<InstallationRow> for Installation {
	type Error = StoreError;

	fn try_from(row: InstallationRow) -> Result<Self, Self::Error> {
		Ok(Installation {
			id: InstallationId::from(row.id),
			provider_id: ProviderId::from(row.provider_id.as_str()),
			scope: scope_ref(&row.scope_type, &row.scope_id)?,
			install_type: row.install_type,
			status: parse_stored::<InstallationStatus>(&row.status)?,
			granted_at: row.granted_at,
			revoked_at: row.revoked_at,
			metadata: json_map(&row.metadata)?,
			created_at: row.created_at,
			updated_at: row.updated_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = subscription)]
pub struct SubscriptionRow {
	pub id: String,
	pub connection_id: String,
	pub provider_id: String,
	pub resource_type: String,
	pub resource_id: String,
	pub channel_id: String,
	pub remote_subscription_id: Option<String>,
	pub callback_url: String,
	pub verification_token_ref: Option<String>,
	pub status: String,
	pub expires_at: Option<DateTime<Utc>>,
	pub last_notified_at: Option<DateTime<Utc>>,
	pub metadata: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<SubscriptionRow> for Subscription {
	type Error = StoreError;

	fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
		Ok(Subscription {
			id: SubscriptionId::from(row.id),
			connection_id: ConnectionId::from(row.connection_id),
			provider_id: ProviderId::from(row.provider_id.as_str()),
			resource_type: row.resource_type,
			resource_id: row.resource_id,
			channel_id: row.channel_id,
			remote_subscription_id: row.remote_subscription_id,
			callback_url: row.callback_url,
			verification_token_ref: row.verification_token_ref,
			status: parse_stored::<SubscriptionStatus>(&row.status)?,
			expires_at: row.expires_at,
			last_notified_at: row.last_notified_at,
			metadata: json_map(&row.metadata)?,
			created_at: row.created_at,
			updated_at: row.updated_at,
			deleted_at: row.deleted_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = sync_cursor)]
pub struct SyncCursorRow {
	pub connection_id: String,
	pub resource_type: String,
	pub resource_id: String,
	pub provider_id: String,
	pub cursor: String,
	pub status: String,
	pub last_synced_at: Option<DateTime<Utc>>,
	pub metadata: String,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<SyncCursorRow> for SyncCursor {
	type Error = StoreError;

	fn try_from(row: SyncCursorRow) -> Result<Self, Self::Error> {
		Ok(SyncCursor {
			connection_id: ConnectionId::from(row.connection_id),
			provider_id: ProviderId::from(row.provider_id.as_str()),
			resource_type: row.resource_type,
			resource_id: row.resource_id,
			cursor: row.cursor,
			status: row.status,
			last_synced_at: row.last_synced_at,
			metadata: json_map(&row.metadata)?,
			updated_at: row.updated_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = sync_job)]
pub struct SyncJobRow {
	pub id: String,
	pub connection_id: String,
	pub provider_id: String,
	pub mode: String,
	pub checkpoint: Option<String>,
	pub status: String,
	pub attempts: i32,
	pub next_attempt_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub metadata: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<SyncJobRow> for SyncJob {
	type Error = StoreError;

	fn try_from(row: SyncJobRow) -> Result<Self, Self::Error> {
		Ok(SyncJob {
			id: SyncJobId::from(row.id),
			connection_id: ConnectionId::from(row.connection_id),
			provider_id: ProviderId::from(row.provider_id.as_str()),
			mode: parse_stored::<SyncJobMode>(&row.mode)?,
			checkpoint: row.checkpoint,
			status: parse_stored::<SyncJobStatus>(&row.status)?,
			attempts: row.attempts,
			next_attempt_at: row.next_attempt_at,
			last_error: row.last_error,
			metadata: json_map(&row.metadata)?,
			created_at: row.created_at,
			updated_at: row.updated_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = sync_job_idempotency)]
pub struct SyncJobIdempotencyRow {
	pub id: String,
	pub scope_type: String,
	pub scope_id: String,
	pub provider_id: String,
	pub connection_id: String,
	pub mode: String,
	pub idempotency_key: String,
	pub sync_job_id: String,
	pub requested_by: Option<String>,
	pub created_at: DateTime<Utc>,
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = webhook_delivery)]
pub struct WebhookDeliveryRow {
	pub provider_id: String,
	pub delivery_id: String,
	pub status: String,
	pub attempts: i32,
	pub next_attempt_at: Option<DateTime<Utc>>,
	pub payload: Vec<u8>,
	pub last_error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookDeliveryRow> for WebhookDelivery {
	type Error = StoreError;

	fn try_from(row: WebhookDeliveryRow) -> Result<Self, Self::Error> {
		Ok(WebhookDelivery {
			provider_id: ProviderId::from(row.provider_id.as_str()),
			delivery_id: row.delivery_id,
			status: parse_stored::<WebhookDeliveryStatus>(&row.status)?,
			attempts: row.attempts,
			next_attempt_at: row.next_attempt_at,
			payload: row.payload,
			last_error: row.last_error,
			created_at: row.created_at,
			updated_at: row.updated_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = rate_limit_state)]
pub struct RateLimitStateRow {
	pub provider_id: String,
	pub scope_type: String,
	pub scope_id: String,
	pub bucket_key: String,
	pub limit_value: Option<i64>,
	pub remaining: Option<i64>,
	pub reset_at: Option<DateTime<Utc>>,
	pub retry_after_seconds: Option<i64>,
	pub metadata: String,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<RateLimitStateRow> for RateLimitState {
	type Error = StoreError;

	fn try_from(row: RateLimitStateRow) -> Result<Self, Self::Error> {
		let key =
			RateLimitKey::new(&row.provider_id, &row.scope_type, &row.scope_id, &row.bucket_key);
		let mut state = RateLimitState::empty(key, row.updated_at);
		state.limit = row.limit_value;
		state.remaining = row.remaining;
		state.reset_at = row.reset_at;
		state.retry_after = row.retry_after_seconds.map(Duration::seconds);
		state.apply_stored_metadata(json_map(&row.metadata)?);
		Ok(state)
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = lifecycle_outbox)]
pub struct LifecycleOutboxRow {
	pub event_id: String,
	pub event_name: String,
	pub provider_id: String,
	pub scope_type: String,
	pub scope_id: String,
	pub connection_id: Option<String>,
	pub payload: String,
	pub metadata: String,
	pub status: String,
	pub attempts: i32,
	pub next_attempt_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub occurred_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<LifecycleOutboxRow> for OutboxEntry {
	type Error = StoreError;

	fn try_from(row: LifecycleOutboxRow) -> Result<Self, Self::Error> {
		let event = LifecycleEvent {
			id: EventId::from(row.event_id),
			name: row.event_name,
			provider_id: ProviderId::from(row.provider_id.as_str()),
			scope: scope_ref(&row.scope_type, &row.scope_id)?,
			connection_id: row.connection_id.map(ConnectionId::from),
			occurred_at: row.occurred_at,
			payload: serde_json::from_str(&row.payload)?,
			metadata: json_map(&row.metadata)?,
		};
		Ok(OutboxEntry {
			event,
			status: parse_stored::<OutboxStatus>(&row.status)?,
			attempts: row.attempts,
			next_attempt_at: row.next_attempt_at,
			last_error: row.last_error,
			created_at: row.created_at,
			updated_at: row.updated_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = notification_dispatch)]
pub struct NotificationDispatchRow {
	pub idempotency_key: String,
	pub event_id: String,
	pub projector: String,
	pub definition_code: String,
	pub recipient_key: String,
	pub status: String,
	pub error: Option<String>,
	pub metadata: String,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<NotificationDispatchRow> for NotificationDispatch {
	type Error = StoreError;

	fn try_from(row: NotificationDispatchRow) -> Result<Self, Self::Error> {
		Ok(NotificationDispatch {
			event_id: EventId::from(row.event_id),
			projector: row.projector,
			definition_code: row.definition_code,
			recipient_key: row.recipient_key,
			idempotency_key: row.idempotency_key,
			status: row.status,
			error: row.error,
			metadata: json_map(&row.metadata)?,
			created_at: row.created_at,
		})
	}
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = service_activity)]
pub struct ServiceActivityRow {
	pub id: String,
	pub provider_id: String,
	pub scope_type: String,
	pub scope_id: String,
	pub connection_id: Option<String>,
	pub installation_id: Option<String>,
	pub subscription_id: Option<String>,
	pub sync_job_id: Option<String>,
	pub channel: String,
	pub action: String,
	pub object_type: String,
	pub object_id: String,
	pub actor: String,
	pub actor_type: String,
	pub status: String,
	pub metadata: String,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<ServiceActivityRow> for ServiceActivity {
	type Error = StoreError;

	fn try_from(row: ServiceActivityRow) -> Result<Self, Self::Error> {
		let status = match row.status.as_str() {
			"ok" => ActivityStatus::Ok,
			"warn" => ActivityStatus::Warn,
			"error" => ActivityStatus::Error,
			other => return Err(StoreError::InvalidRecord(format!("activity status {:?}", other))),
		};
		Ok(ServiceActivity {
			id: ActivityEntryId::from(row.id),
			provider_id: ProviderId::from(row.provider_id.as_str()),
			scope: scope_ref(&row.scope_type, &row.scope_id)?,
			connection_id: row.connection_id.map(ConnectionId::from),
			installation_id: row.installation_id.map(InstallationId::from),
			subscription_id: row.subscription_id.map(SubscriptionId::from),
			sync_job_id: row.sync_job_id.map(SyncJobId::from),
			channel: row.channel,
			action: row.action,
			object_type: row.object_type,
			object_id: row.object_id,
			actor: row.actor,
			actor_type: row.actor_type,
			status,
			metadata: json_map(&row.metadata)?,
			created_at: row.created_at,
		})
	}
}
