use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	ids::{ActivityEntryId, ConnectionId, InstallationId, ProviderId, SubscriptionId, SyncJobId},
	scope::ScopeRef,
};

pub const DEFAULT_ACTIVITY_CHANNEL: &str = "services.lifecycle";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
	Ok,
	Warn,
	Error,
}

impl ActivityStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			ActivityStatus::Ok => "ok",
			ActivityStatus::Warn => "warn",
			ActivityStatus::Error => "error",
		}
	}
}

/// One append-only audit entry. Every state-changing operation records one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceActivity {
	pub id: ActivityEntryId,
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub connection_id: Option<ConnectionId>,
	pub installation_id: Option<InstallationId>,
	pub subscription_id: Option<SubscriptionId>,
	pub sync_job_id: Option<SyncJobId>,
	pub channel: String,
	pub action: String,
	pub object_type: String,
	pub object_id: String,
	pub actor: String,
	pub actor_type: String,
	pub status: ActivityStatus,
	pub metadata: Map<String, Value>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewServiceActivity {
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub connection_id: Option<ConnectionId>,
	pub installation_id: Option<InstallationId>,
	pub subscription_id: Option<SubscriptionId>,
	pub sync_job_id: Option<SyncJobId>,
	pub channel: String,
	pub action: String,
	pub object_type: String,
	pub object_id: String,
	pub actor: String,
	pub actor_type: String,
	pub status: ActivityStatus,
	pub metadata: Map<String, Value>,
}

impl NewServiceActivity {
	pub fn new(
		provider_id: ProviderId,
		scope: ScopeRef,
		action: impl Into<String>,
		object_type: impl Into<String>,
		object_id: impl Into<String>,
	) -> Self {
		Self {
			provider_id,
			scope,
			connection_id: None,
			installation_id: None,
			subscription_id: None,
			sync_job_id: None,
			channel: DEFAULT_ACTIVITY_CHANNEL.to_owned(),
			action: action.into(),
			object_type: object_type.into(),
			object_id: object_id.into(),
			actor: "system".to_owned(),
			actor_type: "service".to_owned(),
			status: ActivityStatus::Ok,
			metadata: Map::new(),
		}
	}

	pub fn with_connection(mut self, connection_id: ConnectionId) -> Self {
		self.connection_id = Some(connection_id);
		self
	}

	pub fn with_status(mut self, status: ActivityStatus) -> Self {
		self.status = status;
		self
	}

	pub fn with_actor(mut self, actor: impl Into<String>, actor_type: impl Into<String>) -> Self {
		self.actor = actor.into();
		self.actor_type = actor_type.into();
		self
	}

	pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
		self.metadata = metadata;
		self
	}

	/// The `type:id` object reference recorded in the ledger
	pub fn object_ref(&self) -> String {
		format!("{}:{}", self.object_type, self.object_id)
	}
}

/// Retention for the activity ledger: entries older than `ttl` go first,
/// then the oldest entries beyond `row_cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
	pub ttl: Duration,
	pub row_cap: u64,
}

impl Default for RetentionPolicy {
	fn default() -> Self {
		// 90 days, one million rows
		Self { ttl: Duration::from_secs(90 * 24 * 60 * 60), row_cap: 1_000_000 }
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn object_ref_is_type_colon_id() {
		let activity = NewServiceActivity::new(
			ProviderId::from("github"),
			ScopeRef::new("user", "u1").unwrap(),
			"connection.revoke",
			"connection",
			"conn_1",
		);
		assert_eq!(activity.object_ref(), "connection:conn_1");
		assert_eq!(activity.channel, DEFAULT_ACTIVITY_CHANNEL);
	}
}
