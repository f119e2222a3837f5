use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::{debug, instrument};
use uuid::Uuid;

use common::{
	ids::{ConnectionId, SyncJobId},
	redaction::redact_metadata,
	store::{StoreError, SyncCursorStore, SyncJobStore},
	sync::{
		AdvanceCursor, CreateSyncJob, CreatedSyncJob, SyncCursor, SyncJob, SyncJobMode,
		SyncJobStatus, UpsertCursor,
	},
};
use serde_json::{Map, Value};

use crate::{
	rows::{json_text, SyncCursorRow, SyncJobIdempotencyRow, SyncJobRow},
	schema::{sync_cursor, sync_job, sync_job_idempotency},
	Store,
};

diesel::sql_function! {
	fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text;
}

pub(crate) const CURSOR_STATUS_ACTIVE: &str = "active";

#[derive(AsChangeset)]
#[diesel(table_name = sync_cursor)]
struct CursorChanges {
	cursor: String,
	status: Option<String>,
	last_synced_at: Option<DateTime<Utc>>,
	metadata: Option<String>,
	updated_at: DateTime<Utc>,
}

impl Store {
	fn cursor_sync(
		&self,
		connection_id: &ConnectionId,
		resource_type: &str,
		resource_id: &str,
	) -> Result<Option<SyncCursor>, StoreError> {
		use crate::schema::sync_cursor::dsl;

		let mut conn = self.connection()?;
		let row: Option<SyncCursorRow> = sync_cursor::table
			.filter(
				dsl::connection_id
					.eq(connection_id.as_str())
					.and(dsl::resource_type.eq(resource_type))
					.and(dsl::resource_id.eq(resource_id)),
			)
			.first(&mut conn)
			.optional()?;

		row.map(TryInto::try_into).transpose()
	}

	#[instrument(level = "debug", skip(self, advance), fields(
		connection_id = %advance.connection_id,
		resource = %advance.resource_type,
	))]
	fn advance_cursor_sync(&self, advance: AdvanceCursor) -> Result<SyncCursor, StoreError> {
		use crate::schema::sync_cursor::dsl;

		let mut conn = self.connection()?;
		let row = conn.build_transaction().run::<_, StoreError, _>(|conn| {
			let existing: Option<SyncCursorRow> = sync_cursor::table
				.filter(
					dsl::connection_id
						.eq(advance.connection_id.as_str())
						.and(dsl::resource_type.eq(&advance.resource_type))
						.and(dsl::resource_id.eq(&advance.resource_id)),
				)
				.first(conn)
				.optional()?;

			let now = Utc::now();

			if existing.is_none() {
				// A missing resource row satisfies only an empty expectation
				if !advance.expected_cursor.is_empty() {
					return Err(StoreError::SyncCursorConflict);
				}

				let row = SyncCursorRow {
					connection_id: advance.connection_id.to_string(),
					resource_type: advance.resource_type.clone(),
					resource_id: advance.resource_id.clone(),
					provider_id: advance.provider_id.to_string(),
					cursor: advance.cursor.clone(),
					status: advance
						.status
						.clone()
						.unwrap_or_else(|| CURSOR_STATUS_ACTIVE.to_owned()),
					last_synced_at: advance.last_synced_at,
					metadata: json_text(&redact_metadata(
						&advance.metadata.clone().unwrap_or_default(),
					))?,
					updated_at: now,
				};
				diesel::insert_into(sync_cursor::table).values(&row).execute(conn)?;
				return Ok(row);
			}

			// CAS with a case-insensitive expected compare
			let updated = diesel::update(
				sync_cursor::table.filter(
					dsl::connection_id
						.eq(advance.connection_id.as_str())
						.and(dsl::resource_type.eq(&advance.resource_type))
						.and(dsl::resource_id.eq(&advance.resource_id))
						.and(lower(dsl::cursor).eq(advance.expected_cursor.to_lowercase())),
				),
			)
			.set(CursorChanges {
				cursor: advance.cursor.clone(),
				status: advance.status.clone(),
				last_synced_at: advance.last_synced_at,
				metadata: advance
					.metadata
					.as_ref()
					.map(|m| json_text(&redact_metadata(m)))
					.transpose()?,
				updated_at: now,
			})
			.execute(conn)?;

			if updated == 0 {
				debug!(expected = %advance.expected_cursor, "Cursor advance lost the race");
				return Err(StoreError::SyncCursorConflict);
			}

			Ok(sync_cursor::table
				.filter(
					dsl::connection_id
						.eq(advance.connection_id.as_str())
						.and(dsl::resource_type.eq(&advance.resource_type))
						.and(dsl::resource_id.eq(&advance.resource_id)),
				)
				.first(conn)?)
		})?;

		row.try_into()
	}

	#[instrument(level = "debug", skip(self, upsert), fields(connection_id = %upsert.connection_id))]
	fn upsert_cursor_sync(&self, upsert: UpsertCursor) -> Result<SyncCursor, StoreError> {
		use crate::schema::sync_cursor::dsl;

		let mut conn = self.connection()?;
		let now = Utc::now();
		let metadata = json_text(&redact_metadata(&upsert.metadata.clone().unwrap_or_default()))?;
		let status =
			upsert.status.clone().unwrap_or_else(|| CURSOR_STATUS_ACTIVE.to_owned());

		let row = SyncCursorRow {
			connection_id: upsert.connection_id.to_string(),
			resource_type: upsert.resource_type.clone(),
			resource_id: upsert.resource_id.clone(),
			provider_id: upsert.provider_id.to_string(),
			cursor: upsert.cursor.clone(),
			status: status.clone(),
			last_synced_at: upsert.last_synced_at,
			metadata: metadata.clone(),
			updated_at: now,
		};

		diesel::insert_into(sync_cursor::table)
			.values(&row)
			.on_conflict((dsl::connection_id, dsl::resource_type, dsl::resource_id))
			.do_update()
			.set((
				dsl::cursor.eq(&upsert.cursor),
				dsl::status.eq(&status),
				dsl::last_synced_at.eq(upsert.last_synced_at),
				dsl::metadata.eq(&metadata),
				dsl::updated_at.eq(now),
			))
			.execute(&mut conn)?;

		let stored: SyncCursorRow = sync_cursor::table
			.filter(
				dsl::connection_id
					.eq(upsert.connection_id.as_str())
					.and(dsl::resource_type.eq(&upsert.resource_type))
					.and(dsl::resource_id.eq(&upsert.resource_id)),
			)
			.first(&mut conn)?;
		stored.try_into()
	}
}

impl Store {
	#[instrument(level = "debug", skip(self, create), fields(
		connection_id = %create.connection_id,
		mode = create.mode.as_str(),
	))]
	fn create_sync_job_sync(&self, create: CreateSyncJob) -> Result<CreatedSyncJob, StoreError> {
		use crate::schema::sync_job::dsl as job;
		use crate::schema::sync_job_idempotency::dsl as idem;

		let mut conn = self.connection()?;

		let (row, created) = conn.build_transaction().run::<_, StoreError, _>(|conn| {
			let now = Utc::now();

			match create.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
				Some(key) => {
					let job_id = Uuid::new_v4().to_string();
					let ledger_row = SyncJobIdempotencyRow {
						id: Uuid::new_v4().to_string(),
						scope_type: create.scope.scope_type.to_string(),
						scope_id: create.scope.id.clone(),
						provider_id: create.provider_id.to_string(),
						connection_id: create.connection_id.to_string(),
						mode: create.mode.as_str().to_owned(),
						idempotency_key: key.to_owned(),
						sync_job_id: job_id.clone(),
						requested_by: create.requested_by.clone(),
						created_at: now,
					};

					let inserted = diesel::insert_into(sync_job_idempotency::table)
						.values(&ledger_row)
						.on_conflict_do_nothing()
						.execute(conn)?;

					if inserted == 0 {
						// Replay: surface the job the ledger already points at
						let existing: SyncJobIdempotencyRow = sync_job_idempotency::table
							.filter(
								idem::scope_type
									.eq(create.scope.scope_type.as_str())
									.and(idem::scope_id.eq(&create.scope.id))
									.and(idem::provider_id.eq(create.provider_id.as_str()))
									.and(idem::mode.eq(create.mode.as_str()))
									.and(idem::idempotency_key.eq(key)),
							)
							.first(conn)?;

						let row: SyncJobRow = sync_job::table
							.filter(job::id.eq(&existing.sync_job_id))
							.first(conn)?;
						return Ok((row, false));
					}

					let row = new_job_row(job_id, &create, now)?;
					diesel::insert_into(sync_job::table).values(&row).execute(conn)?;
					Ok((row, true))
				},
				None => {
					// Without a key, the open job for (connection, mode) wins
					let open: Option<SyncJobRow> = sync_job::table
						.filter(
							job::connection_id
								.eq(create.connection_id.as_str())
								.and(job::mode.eq(create.mode.as_str()))
								.and(job::status.ne_all(vec![
									SyncJobStatus::Succeeded.as_str(),
									SyncJobStatus::Cancelled.as_str(),
								])),
						)
						.order(job::created_at.desc())
						.first(conn)
						.optional()?;

					if let Some(row) = open {
						return Ok((row, false));
					}

					let row = new_job_row(Uuid::new_v4().to_string(), &create, now)?;
					diesel::insert_into(sync_job::table).values(&row).execute(conn)?;
					Ok((row, true))
				},
			}
		})?;

		Ok(CreatedSyncJob { job: row.try_into()?, created })
	}

	fn sync_job_sync(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		use crate::schema::sync_job::dsl;

		let mut conn = self.connection()?;
		let row: SyncJobRow = sync_job::table
			.filter(dsl::id.eq(id.as_str()))
			.first(&mut conn)
			.optional()?
			.ok_or(StoreError::RecordNotFound)?;
		row.try_into()
	}

	fn save_checkpoint_sync(
		&self,
		id: &SyncJobId,
		checkpoint: Option<String>,
		metadata: Option<Map<String, Value>>,
	) -> Result<SyncJob, StoreError> {
		use crate::schema::sync_job::dsl;

		let mut conn = self.connection()?;
		let metadata_text =
			metadata.as_ref().map(|m| json_text(&redact_metadata(m))).transpose()?;

		#[derive(AsChangeset)]
		#[diesel(table_name = sync_job)]
		struct CheckpointChanges {
			checkpoint: Option<String>,
			metadata: Option<String>,
			updated_at: DateTime<Utc>,
		}

		let updated = diesel::update(sync_job::table.filter(dsl::id.eq(id.as_str())))
			.set(CheckpointChanges {
				checkpoint,
				metadata: metadata_text,
				updated_at: Utc::now(),
			})
			.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		self.sync_job_sync(id)
	}

	fn mark_running_sync(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		use crate::schema::sync_job::dsl;

		let mut conn = self.connection()?;
		let updated = diesel::update(
			sync_job::table.filter(
				dsl::id
					.eq(id.as_str())
					.and(dsl::status.eq(SyncJobStatus::Queued.as_str())),
			),
		)
		.set((
			dsl::status.eq(SyncJobStatus::Running.as_str()),
			dsl::updated_at.eq(Utc::now()),
		))
		.execute(&mut conn)?;

		if updated == 0 {
			let current = self.sync_job_sync(id)?;
			return Err(StoreError::InvalidTransition {
				from: current.status.as_str().to_owned(),
				to: SyncJobStatus::Running.as_str().to_owned(),
			});
		}
		self.sync_job_sync(id)
	}

	#[instrument(level = "debug", skip(self))]
	fn fail_sync_job_sync(
		&self,
		id: &SyncJobId,
		error: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<SyncJob, StoreError> {
		use crate::schema::sync_job::dsl;

		let mut conn = self.connection()?;
		let updated = diesel::update(sync_job::table.filter(dsl::id.eq(id.as_str())))
			.set((
				dsl::status.eq(SyncJobStatus::Failed.as_str()),
				dsl::attempts.eq(dsl::attempts + 1),
				dsl::next_attempt_at.eq(next_attempt_at),
				dsl::last_error.eq(error),
				dsl::updated_at.eq(Utc::now()),
			))
			.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		self.sync_job_sync(id)
	}

	fn resume_sync_job_sync(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		use crate::schema::sync_job::dsl;

		let mut conn = self.connection()?;
		let updated = diesel::update(
			sync_job::table.filter(
				dsl::id
					.eq(id.as_str())
					.and(dsl::status.eq(SyncJobStatus::Failed.as_str())),
			),
		)
		.set((
			dsl::status.eq(SyncJobStatus::Queued.as_str()),
			dsl::next_attempt_at.eq(None::<DateTime<Utc>>),
			dsl::updated_at.eq(Utc::now()),
		))
		.execute(&mut conn)?;

		if updated == 0 {
			let current = self.sync_job_sync(id)?;
			return Err(StoreError::InvalidTransition {
				from: current.status.as_str().to_owned(),
				to: SyncJobStatus::Queued.as_str().to_owned(),
			});
		}
		self.sync_job_sync(id)
	}

	fn finish_sync_job_sync(
		&self,
		id: &SyncJobId,
		status: SyncJobStatus,
	) -> Result<SyncJob, StoreError> {
		use crate::schema::sync_job::dsl;

		let mut conn = self.connection()?;
		let updated = diesel::update(sync_job::table.filter(dsl::id.eq(id.as_str())))
			.set((dsl::status.eq(status.as_str()), dsl::updated_at.eq(Utc::now())))
			.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		self.sync_job_sync(id)
	}

	fn active_sync_job_sync(
		&self,
		connection_id: &ConnectionId,
		mode: SyncJobMode,
	) -> Result<Option<SyncJob>, StoreError> {
		use crate::schema::sync_job::dsl;

		let mut conn = self.connection()?;
		let row: Option<SyncJobRow> = sync_job::table
			.filter(
				dsl::connection_id
					.eq(connection_id.as_str())
					.and(dsl::mode.eq(mode.as_str()))
					.and(dsl::status.ne_all(vec![
						SyncJobStatus::Succeeded.as_str(),
						SyncJobStatus::Cancelled.as_str(),
					])),
			)
			.order(dsl::created_at.desc())
			.first(&mut conn)
			.optional()?;

		row.map(TryInto::try_into).transpose()
	}
}

fn new_job_row(
	id: String,
	create: &CreateSyncJob,
	now: DateTime<Utc>,
) -> Result<SyncJobRow, StoreError> {
	Ok(SyncJobRow {
		id,
		connection_id: create.connection_id.to_string(),
		provider_id: create.provider_id.to_string(),
		mode: create.mode.as_str().to_owned(),
		checkpoint: create.checkpoint.clone(),
		status: SyncJobStatus::Queued.as_str().to_owned(),
		attempts: 0,
		next_attempt_at: None,
		last_error: None,
		metadata: json_text(&redact_metadata(&create.metadata))?,
		created_at: now,
		updated_at: now,
	})
}

#[async_trait::async_trait]
impl SyncCursorStore for Store {
	async fn cursor(
		&self,
		connection_id: &ConnectionId,
		resource_type: &str,
		resource_id: &str,
	) -> Result<Option<SyncCursor>, StoreError> {
		let connection_id = connection_id.clone();
		let resource_type = resource_type.to_owned();
		let resource_id = resource_id.to_owned();
		self.blocking(move |store| {
			store.cursor_sync(&connection_id, &resource_type, &resource_id)
		})
		.await
	}

	async fn advance(&self, advance: AdvanceCursor) -> Result<SyncCursor, StoreError> {
		self.blocking(move |store| store.advance_cursor_sync(advance)).await
	}

	async fn upsert(&self, upsert: UpsertCursor) -> Result<SyncCursor, StoreError> {
		self.blocking(move |store| store.upsert_cursor_sync(upsert)).await
	}
}

#[async_trait::async_trait]
impl SyncJobStore for Store {
	async fn create_sync_job(&self, create: CreateSyncJob) -> Result<CreatedSyncJob, StoreError> {
		self.blocking(move |store| store.create_sync_job_sync(create)).await
	}

	async fn sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.sync_job_sync(&id)).await
	}

	async fn save_checkpoint(
		&self,
		id: &SyncJobId,
		checkpoint: Option<String>,
		metadata: Option<Map<String, Value>>,
	) -> Result<SyncJob, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.save_checkpoint_sync(&id, checkpoint, metadata)).await
	}

	async fn mark_running(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.mark_running_sync(&id)).await
	}

	async fn fail_sync_job(
		&self,
		id: &SyncJobId,
		error: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<SyncJob, StoreError> {
		let id = id.clone();
		let error = error.to_owned();
		self.blocking(move |store| store.fail_sync_job_sync(&id, &error, next_attempt_at)).await
	}

	async fn resume_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.resume_sync_job_sync(&id)).await
	}

	async fn complete_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.finish_sync_job_sync(&id, SyncJobStatus::Succeeded))
			.await
	}

	async fn cancel_sync_job(&self, id: &SyncJobId) -> Result<SyncJob, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.finish_sync_job_sync(&id, SyncJobStatus::Cancelled))
			.await
	}

	async fn active_sync_job(
		&self,
		connection_id: &ConnectionId,
		mode: SyncJobMode,
	) -> Result<Option<SyncJob>, StoreError> {
		let connection_id = connection_id.clone();
		self.blocking(move |store| store.active_sync_job_sync(&connection_id, mode)).await
	}
}
