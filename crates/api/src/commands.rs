use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use common::{
	capability::CapabilityDecision,
	connection::Connection,
	grants::GrantEventType,
	ids::{ConnectionId, ProviderId, SyncJobId},
	scope::ScopeRef,
	sync::SyncJob,
};

#[derive(Debug, Clone)]
pub enum ConnectionCommand {
	Connect {
		provider_id: ProviderId,
		scope: ScopeRef,
		requested_grants: Vec<String>,
		redirect_uri: Option<String>,
		metadata: Map<String, Value>,
	},
	CompleteCallback {
		code: String,
		state: String,
	},
	Refresh {
		connection_id: ConnectionId,
	},
	Revoke {
		connection_id: ConnectionId,
		reason: String,
	},
	Suspend {
		connection_id: ConnectionId,
	},
	Reinstate {
		connection_id: ConnectionId,
	},
	InvokeCapability {
		connection_id: ConnectionId,
		capability: String,
	},
}

#[derive(Debug, Clone)]
pub enum SyncCommand {
	StartBootstrap {
		connection_id: ConnectionId,
		resource_type: Option<String>,
		resource_id: Option<String>,
		idempotency_key: Option<String>,
		requested_by: Option<String>,
		metadata: Map<String, Value>,
	},
	StartBackfill {
		connection_id: ConnectionId,
		from: DateTime<Utc>,
		to: DateTime<Utc>,
		idempotency_key: Option<String>,
		requested_by: Option<String>,
		metadata: Map<String, Value>,
	},
	StartIncremental {
		connection_id: ConnectionId,
		idempotency_key: Option<String>,
		requested_by: Option<String>,
		metadata: Map<String, Value>,
	},
	SaveCheckpoint {
		job_id: SyncJobId,
		checkpoint: Option<String>,
		metadata: Option<Map<String, Value>>,
	},
	Fail {
		job_id: SyncJobId,
		error: String,
		next_attempt_at: Option<DateTime<Utc>>,
	},
	Resume {
		job_id: SyncJobId,
	},
}

#[derive(Debug, Clone)]
pub enum ApiCommand {
	Connection(ConnectionCommand),
	Sync(SyncCommand),
}

#[derive(Debug)]
pub enum ApiResponse {
	/// The api has successfully executed the operation, but has no useful
	/// output
	Unit,
	/// An authorization redirect plus the single-use state token backing it
	ConnectStarted { authorize_url: String, state: String },
	/// A connection with a freshly rotated active credential
	Connected { connection: Connection, credential_version: i32 },
	/// The outcome of a credential refresh
	Refreshed {
		connection_id: ConnectionId,
		credential_version: i32,
		grant_event: GrantEventType,
	},
	/// A capability permission decision; denial is data, not an error
	Capability { decision: CapabilityDecision },
	/// A sync job, possibly replayed from the idempotency ledger
	SyncJob { job: Box<SyncJob>, created: bool },
}

impl ApiResponse {
	pub fn unit() -> Self {
		ApiResponse::Unit
	}

	pub fn sync_job(job: SyncJob, created: bool) -> Self {
		ApiResponse::SyncJob { job: Box::new(job), created }
	}
}
