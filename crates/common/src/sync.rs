use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	errors::{codes, ServiceError},
	ids::{ConnectionId, ProviderId, SyncJobId},
	scope::ScopeRef,
};

/// Metadata key written by invalidation recovery upserts.
pub const RECOVERY_METADATA_KEY: &str = "recovery";
pub const RECOVERY_INVALIDATION: &str = "invalidation";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobMode {
	Full,
	Delta,
	Bootstrap,
	Backfill,
	Incremental,
}

impl SyncJobMode {
	pub fn as_str(self) -> &'static str {
		match self {
			SyncJobMode::Full => "full",
			SyncJobMode::Delta => "delta",
			SyncJobMode::Bootstrap => "bootstrap",
			SyncJobMode::Backfill => "backfill",
			SyncJobMode::Incremental => "incremental",
		}
	}
}

impl FromStr for SyncJobMode {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"full" => Ok(SyncJobMode::Full),
			"delta" => Ok(SyncJobMode::Delta),
			"bootstrap" => Ok(SyncJobMode::Bootstrap),
			"backfill" => Ok(SyncJobMode::Backfill),
			"incremental" => Ok(SyncJobMode::Incremental),
			other => Err(ServiceError::validation(
				codes::INVALID_STATE_TRANSITION,
				format!("unknown sync job mode {:?}", other),
			)),
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
	Queued,
	Running,
	Failed,
	Succeeded,
	Cancelled,
}

impl SyncJobStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			SyncJobStatus::Queued => "queued",
			SyncJobStatus::Running => "running",
			SyncJobStatus::Failed => "failed",
			SyncJobStatus::Succeeded => "succeeded",
			SyncJobStatus::Cancelled => "cancelled",
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, SyncJobStatus::Succeeded | SyncJobStatus::Cancelled)
	}
}

impl FromStr for SyncJobStatus {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"queued" => Ok(SyncJobStatus::Queued),
			"running" => Ok(SyncJobStatus::Running),
			"failed" => Ok(SyncJobStatus::Failed),
			"succeeded" => Ok(SyncJobStatus::Succeeded),
			"cancelled" => Ok(SyncJobStatus::Cancelled),
			other => Err(ServiceError::validation(
				codes::INVALID_STATE_TRANSITION,
				format!("unknown sync job status {:?}", other),
			)),
		}
	}
}

/// A provider-opaque token marking progress through one resource's change
/// stream. `(connection_id, resource_type, resource_id)` is unique; the
/// cursor only moves through compare-and-swap.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncCursor {
	pub connection_id: ConnectionId,
	pub provider_id: ProviderId,
	pub resource_type: String,
	pub resource_id: String,
	pub cursor: String,
	pub status: String,
	pub last_synced_at: Option<DateTime<Utc>>,
	pub metadata: Map<String, Value>,
	pub updated_at: DateTime<Utc>,
}

/// CAS input for a cursor advance. The expected cursor is compared
/// case-insensitively; an empty expected cursor asserts the resource row
/// does not exist yet.
#[derive(Debug, Clone)]
pub struct AdvanceCursor {
	pub connection_id: ConnectionId,
	pub provider_id: ProviderId,
	pub resource_type: String,
	pub resource_id: String,
	pub expected_cursor: String,
	pub cursor: String,
	pub status: Option<String>,
	pub last_synced_at: Option<DateTime<Utc>>,
	pub metadata: Option<Map<String, Value>>,
}

/// Blind write used for invalidation recovery; bypasses the CAS.
#[derive(Debug, Clone)]
pub struct UpsertCursor {
	pub connection_id: ConnectionId,
	pub provider_id: ProviderId,
	pub resource_type: String,
	pub resource_id: String,
	pub cursor: String,
	pub status: Option<String>,
	pub last_synced_at: Option<DateTime<Utc>>,
	pub metadata: Option<Map<String, Value>>,
}

impl UpsertCursor {
	/// Mark the upsert as cursor-invalidation recovery
	pub fn for_invalidation_recovery(mut self) -> Self {
		let mut metadata = self.metadata.unwrap_or_default();
		metadata.insert(
			RECOVERY_METADATA_KEY.to_owned(),
			Value::String(RECOVERY_INVALIDATION.to_owned()),
		);
		self.metadata = Some(metadata);
		self
	}
}

/// A checkpointed, resumable unit of synchronization work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncJob {
	pub id: SyncJobId,
	pub connection_id: ConnectionId,
	pub provider_id: ProviderId,
	pub mode: SyncJobMode,
	pub checkpoint: Option<String>,
	pub status: SyncJobStatus,
	pub attempts: i32,
	pub next_attempt_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub metadata: Map<String, Value>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateSyncJob {
	pub connection_id: ConnectionId,
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub mode: SyncJobMode,
	pub checkpoint: Option<String>,
	/// Non-empty key enables replay semantics over
	/// `(scope, provider, mode, key)`
	pub idempotency_key: Option<String>,
	pub requested_by: Option<String>,
	pub metadata: Map<String, Value>,
}

/// Result of an idempotent job creation. `created` is true for exactly one
/// caller per idempotency tuple.
#[derive(Debug, Clone)]
pub struct CreatedSyncJob {
	pub job: SyncJob,
	pub created: bool,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn terminal_statuses() {
		assert!(SyncJobStatus::Succeeded.is_terminal());
		assert!(SyncJobStatus::Cancelled.is_terminal());
		assert!(!SyncJobStatus::Failed.is_terminal());
		assert!(!SyncJobStatus::Queued.is_terminal());
	}

	#[test]
	fn recovery_upsert_tags_metadata() {
		let upsert = UpsertCursor {
			connection_id: ConnectionId::from("c1"),
			provider_id: ProviderId::from("github"),
			resource_type: "repo".to_owned(),
			resource_id: "r1".to_owned(),
			cursor: "fresh".to_owned(),
			status: None,
			last_synced_at: None,
			metadata: None,
		}
		.for_invalidation_recovery();

		assert_eq!(
			upsert.metadata.unwrap().get(RECOVERY_METADATA_KEY),
			Some(&Value::String(RECOVERY_INVALIDATION.to_owned()))
		);
	}

	#[test]
	fn mode_text_round_trips() {
		for mode in [
			SyncJobMode::Full,
			SyncJobMode::Delta,
			SyncJobMode::Bootstrap,
			SyncJobMode::Backfill,
			SyncJobMode::Incremental,
		] {
			assert_eq!(mode.as_str().parse::<SyncJobMode>().unwrap(), mode);
		}
	}
}
