use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	errors::{codes, ServiceError},
	ids::{ConnectionId, EventId, ProviderId},
	scope::ScopeRef,
};

/// Dotted lifecycle event names emitted by the runtime.
pub mod events {
	pub const CONNECTION_CONNECTED: &str = "connection.connected";
	pub const CONNECTION_STATUS_CHANGED: &str = "connection.status_changed";
	pub const CONNECTION_REFRESHED: &str = "connection.refreshed";
	pub const CONNECTION_REFRESH_FAILED: &str = "connection.refresh_failed";
	pub const CONNECTION_REVOKED: &str = "connection.revoked";
	pub const GRANT_EXPANDED: &str = "grant.expanded";
	pub const GRANT_DOWNGRADED: &str = "grant.downgraded";
	pub const INSTALLATION_STATUS_CHANGED: &str = "installation.status_changed";
	pub const SUBSCRIPTION_CREATED: &str = "subscription.created";
	pub const SUBSCRIPTION_RENEWED: &str = "subscription.renewed";
	pub const SUBSCRIPTION_CANCELLED: &str = "subscription.cancelled";
	pub const SYNC_JOB_CREATED: &str = "sync.job_created";
	pub const SYNC_CURSOR_ADVANCED: &str = "sync.cursor_advanced";
	pub const WEBHOOK_DEAD_LETTERED: &str = "webhook.dead_lettered";
}

/// The wire payload projected to downstream consumers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
	pub id: EventId,
	pub name: String,
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub connection_id: Option<ConnectionId>,
	pub occurred_at: DateTime<Utc>,
	pub payload: Value,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub metadata: Map<String, Value>,
}

impl LifecycleEvent {
	pub fn new(
		name: impl Into<String>,
		provider_id: ProviderId,
		scope: ScopeRef,
		connection_id: Option<ConnectionId>,
		payload: Value,
	) -> Self {
		Self {
			id: EventId::generate(),
			name: name.into(),
			provider_id,
			scope,
			connection_id,
			occurred_at: Utc::now(),
			payload,
			metadata: Map::new(),
		}
	}

	pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
		self.metadata = metadata;
		self
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
	Pending,
	Processing,
	Delivered,
	Failed,
}

impl OutboxStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			OutboxStatus::Pending => "pending",
			OutboxStatus::Processing => "processing",
			OutboxStatus::Delivered => "delivered",
			OutboxStatus::Failed => "failed",
		}
	}
}

impl FromStr for OutboxStatus {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pending" => Ok(OutboxStatus::Pending),
			"processing" => Ok(OutboxStatus::Processing),
			"delivered" => Ok(OutboxStatus::Delivered),
			"failed" => Ok(OutboxStatus::Failed),
			other => Err(ServiceError::validation(
				codes::INVALID_STATE_TRANSITION,
				format!("unknown outbox status {:?}", other),
			)),
		}
	}
}

/// One at-least-once emission. Rows leave the table only after `delivered`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboxEntry {
	pub event: LifecycleEvent,
	pub status: OutboxStatus,
	pub attempts: i32,
	pub next_attempt_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// Dedupe record for downstream projection; `idempotency_key` is unique and
/// duplicate records are silent no-ops.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationDispatch {
	pub event_id: EventId,
	pub projector: String,
	pub definition_code: String,
	pub recipient_key: String,
	pub idempotency_key: String,
	pub status: String,
	pub error: Option<String>,
	pub metadata: Map<String, Value>,
	pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn event_payload_wire_shape() {
		let event = LifecycleEvent::new(
			events::CONNECTION_REFRESH_FAILED,
			ProviderId::from("github"),
			ScopeRef::new("user", "u1").unwrap(),
			Some(ConnectionId::from("conn_1")),
			serde_json::json!({"attempts": 2}),
		);

		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(json["name"], "connection.refresh_failed");
		assert_eq!(json["providerId"], "github");
		assert_eq!(json["scope"], serde_json::json!({"type": "user", "id": "u1"}));
		assert_eq!(json["connectionId"], "conn_1");
		assert!(json["occurredAt"].as_str().unwrap().contains('T'));
	}

	#[test]
	fn event_names_are_dotted() {
		for name in [
			events::CONNECTION_CONNECTED,
			events::SUBSCRIPTION_RENEWED,
			events::SYNC_CURSOR_ADVANCED,
		] {
			assert!(name.contains('.'), "{} is not dotted", name);
		}
	}
}
