use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{instrument, warn};

use common::{
	activity::NewServiceActivity,
	connection::Connection,
	ids::{ConnectionId, SyncJobId},
	outbox::{events, LifecycleEvent},
	store::{ConnectionStore, OutboxStore, RuntimeStores, SyncCursorStore, SyncJobStore},
	sync::{
		AdvanceCursor, CreateSyncJob, CreatedSyncJob, SyncCursor, SyncJob, SyncJobMode,
		UpsertCursor,
	},
};

use crate::{activity::ActivityRecorder, error::ApiError};

#[derive(Debug, Clone)]
pub struct BootstrapRequest {
	pub connection_id: ConnectionId,
	/// When given, the new job inherits its checkpoint from this resource's
	/// persisted cursor
	pub resource_type: Option<String>,
	pub resource_id: Option<String>,
	pub idempotency_key: Option<String>,
	pub requested_by: Option<String>,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct BackfillRequest {
	pub connection_id: ConnectionId,
	pub from: DateTime<Utc>,
	pub to: DateTime<Utc>,
	pub idempotency_key: Option<String>,
	pub requested_by: Option<String>,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct IncrementalRequest {
	pub connection_id: ConnectionId,
	pub idempotency_key: Option<String>,
	pub requested_by: Option<String>,
	pub metadata: Map<String, Value>,
}

/// Creates and steers checkpointed sync jobs and owns cursor movement.
pub struct SyncOrchestrator {
	stores: RuntimeStores,
	recorder: ActivityRecorder,
}

impl SyncOrchestrator {
	pub fn new(stores: RuntimeStores) -> Arc<Self> {
		let recorder = ActivityRecorder::new(stores.activity.clone());
		Arc::new(Self { stores, recorder })
	}

	/// Initial full sync; checkpoint inherited from the persisted cursor,
	/// empty when none exists yet
	#[instrument(skip(self, request), fields(connection_id = %request.connection_id))]
	pub async fn start_bootstrap(
		&self,
		request: BootstrapRequest,
	) -> Result<CreatedSyncJob, ApiError> {
		let connection = self.stores.connections.connection(&request.connection_id).await?;

		let checkpoint = match (&request.resource_type, &request.resource_id) {
			(Some(resource_type), Some(resource_id)) => self
				.stores
				.sync_cursors
				.cursor(&request.connection_id, resource_type, resource_id)
				.await?
				.map(|cursor| cursor.cursor),
			_ => None,
		};

		self.create_job(
			&connection,
			SyncJobMode::Bootstrap,
			checkpoint,
			request.idempotency_key,
			request.requested_by,
			request.metadata,
		)
		.await
	}

	/// Historic window sync; the window rides in the job metadata
	#[instrument(skip(self, request), fields(connection_id = %request.connection_id))]
	pub async fn start_backfill(
		&self,
		request: BackfillRequest,
	) -> Result<CreatedSyncJob, ApiError> {
		let connection = self.stores.connections.connection(&request.connection_id).await?;

		let mut metadata = request.metadata;
		metadata.insert("from".to_owned(), Value::String(request.from.to_rfc3339()));
		metadata.insert("to".to_owned(), Value::String(request.to.to_rfc3339()));

		self.create_job(
			&connection,
			SyncJobMode::Backfill,
			None,
			request.idempotency_key,
			request.requested_by,
			metadata,
		)
		.await
	}

	#[instrument(skip(self, request), fields(connection_id = %request.connection_id))]
	pub async fn start_incremental(
		&self,
		request: IncrementalRequest,
	) -> Result<CreatedSyncJob, ApiError> {
		let connection = self.stores.connections.connection(&request.connection_id).await?;
		self.create_job(
			&connection,
			SyncJobMode::Incremental,
			None,
			request.idempotency_key,
			request.requested_by,
			request.metadata,
		)
		.await
	}

	/// Coarse job-level creation for `full`/`delta` dedup modes
	pub async fn start(
		&self,
		connection_id: &ConnectionId,
		mode: SyncJobMode,
		idempotency_key: Option<String>,
		metadata: Map<String, Value>,
	) -> Result<CreatedSyncJob, ApiError> {
		let connection = self.stores.connections.connection(connection_id).await?;
		self.create_job(&connection, mode, None, idempotency_key, None, metadata).await
	}

	pub async fn save_checkpoint(
		&self,
		job_id: &SyncJobId,
		checkpoint: Option<String>,
		metadata: Option<Map<String, Value>>,
	) -> Result<SyncJob, ApiError> {
		Ok(self.stores.sync_jobs.save_checkpoint(job_id, checkpoint, metadata).await?)
	}

	pub async fn mark_running(&self, job_id: &SyncJobId) -> Result<SyncJob, ApiError> {
		Ok(self.stores.sync_jobs.mark_running(job_id).await?)
	}

	/// A `None` next attempt leaves the job terminally failed but still
	/// resumable through [`SyncOrchestrator::resume`]
	#[instrument(skip(self, error))]
	pub async fn fail(
		&self,
		job_id: &SyncJobId,
		error: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<SyncJob, ApiError> {
		Ok(self.stores.sync_jobs.fail_sync_job(job_id, error, next_attempt_at).await?)
	}

	/// `failed → queued`, checkpoint preserved
	pub async fn resume(&self, job_id: &SyncJobId) -> Result<SyncJob, ApiError> {
		Ok(self.stores.sync_jobs.resume_sync_job(job_id).await?)
	}

	pub async fn complete(&self, job_id: &SyncJobId) -> Result<SyncJob, ApiError> {
		Ok(self.stores.sync_jobs.complete_sync_job(job_id).await?)
	}

	pub async fn cancel(&self, job_id: &SyncJobId) -> Result<SyncJob, ApiError> {
		Ok(self.stores.sync_jobs.cancel_sync_job(job_id).await?)
	}

	pub async fn job(&self, job_id: &SyncJobId) -> Result<SyncJob, ApiError> {
		Ok(self.stores.sync_jobs.sync_job(job_id).await?)
	}

	/// CAS cursor advance; conflicts surface as `sync_cursor_conflict` and
	/// leave stored state untouched
	#[instrument(skip(self, advance), fields(connection_id = %advance.connection_id))]
	pub async fn advance_cursor(&self, advance: AdvanceCursor) -> Result<SyncCursor, ApiError> {
		let cursor = self.stores.sync_cursors.advance(advance).await?;

		// Cursor rows carry no scope; borrow it from the owning connection
		match self.stores.connections.connection(&cursor.connection_id).await {
			Ok(connection) => {
				let event = LifecycleEvent::new(
					events::SYNC_CURSOR_ADVANCED,
					cursor.provider_id.clone(),
					connection.scope,
					Some(cursor.connection_id.clone()),
					json!({
						"resourceType": cursor.resource_type,
						"resourceId": cursor.resource_id,
						"cursor": cursor.cursor,
					}),
				);
				if let Err(error) = self.stores.outbox.enqueue_event(event).await {
					warn!(?error, "Failed to enqueue cursor advance event");
				}
			},
			Err(error) => warn!(?error, "Cursor advanced for an unknown connection"),
		}

		Ok(cursor)
	}

	/// Invalidation recovery: blind-write a fresh baseline so subsequent
	/// `advance(expected="")`-style forward progress resumes
	#[instrument(skip(self, upsert), fields(connection_id = %upsert.connection_id))]
	pub async fn recover_cursor(&self, upsert: UpsertCursor) -> Result<SyncCursor, ApiError> {
		Ok(self.stores.sync_cursors.upsert(upsert.for_invalidation_recovery()).await?)
	}

	pub async fn cursor(
		&self,
		connection_id: &ConnectionId,
		resource_type: &str,
		resource_id: &str,
	) -> Result<Option<SyncCursor>, ApiError> {
		Ok(self.stores.sync_cursors.cursor(connection_id, resource_type, resource_id).await?)
	}

	async fn create_job(
		&self,
		connection: &Connection,
		mode: SyncJobMode,
		checkpoint: Option<String>,
		idempotency_key: Option<String>,
		requested_by: Option<String>,
		metadata: Map<String, Value>,
	) -> Result<CreatedSyncJob, ApiError> {
		let created = self
			.stores
			.sync_jobs
			.create_sync_job(CreateSyncJob {
				connection_id: connection.id.clone(),
				provider_id: connection.provider_id.clone(),
				scope: connection.scope.clone(),
				mode,
				checkpoint,
				idempotency_key,
				requested_by: requested_by.clone(),
				metadata,
			})
			.await?;

		if created.created {
			let event = LifecycleEvent::new(
				events::SYNC_JOB_CREATED,
				connection.provider_id.clone(),
				connection.scope.clone(),
				Some(connection.id.clone()),
				json!({
					"syncJobId": created.job.id.as_str(),
					"mode": mode.as_str(),
				}),
			);
			if let Err(error) = self.stores.outbox.enqueue_event(event).await {
				warn!(?error, "Failed to enqueue job created event");
			}

			self.recorder
				.record(
					NewServiceActivity::new(
						connection.provider_id.clone(),
						connection.scope.clone(),
						"sync.job_create",
						"sync_job",
						created.job.id.as_str(),
					)
					.with_connection(connection.id.clone()),
				)
				.await;
		}

		Ok(created)
	}
}

impl core::fmt::Debug for SyncOrchestrator {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("SyncOrchestrator").finish_non_exhaustive()
	}
}
