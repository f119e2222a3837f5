use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use tracing::{debug, instrument};

use common::{
	ids::EventId,
	outbox::{LifecycleEvent, NotificationDispatch, OutboxEntry, OutboxStatus},
	store::{NotificationDispatchLedger, OutboxStore, StoreError},
};

use crate::{
	rows::{json_text, LifecycleOutboxRow, NotificationDispatchRow},
	schema::{lifecycle_outbox, notification_dispatch},
	Store,
};

impl Store {
	#[instrument(level = "debug", skip(self, event), fields(event_name = %event.name))]
	fn enqueue_event_sync(&self, event: LifecycleEvent) -> Result<OutboxEntry, StoreError> {
		let now = Utc::now();
		let row = LifecycleOutboxRow {
			event_id: event.id.to_string(),
			event_name: event.name.clone(),
			provider_id: event.provider_id.to_string(),
			scope_type: event.scope.scope_type.to_string(),
			scope_id: event.scope.id.clone(),
			connection_id: event.connection_id.as_ref().map(|id| id.to_string()),
			payload: serde_json::to_string(&event.payload)?,
			metadata: json_text(&event.metadata)?,
			status: OutboxStatus::Pending.as_str().to_owned(),
			attempts: 0,
			next_attempt_at: None,
			last_error: None,
			occurred_at: event.occurred_at,
			created_at: now,
			updated_at: now,
		};

		let mut conn = self.connection()?;
		diesel::insert_into(lifecycle_outbox::table).values(&row).execute(&mut conn)?;

		row.try_into()
	}

	/// Select-and-mark in one transaction. Stale `processing` rows whose
	/// lease lapsed are re-claimable alongside due `pending` rows.
	#[instrument(level = "debug", skip(self))]
	fn claim_event_batch_sync(
		&self,
		limit: usize,
		now: DateTime<Utc>,
		lease: chrono::Duration,
	) -> Result<Vec<OutboxEntry>, StoreError> {
		use crate::schema::lifecycle_outbox::dsl;

		let mut conn = self.connection()?;
		let rows = conn.build_transaction().run::<_, StoreError, _>(|conn| {
			let due = dsl::status
				.eq(OutboxStatus::Pending.as_str())
				.and(dsl::next_attempt_at.is_null().or(dsl::next_attempt_at.le(now)))
				.or(dsl::status
					.eq(OutboxStatus::Processing.as_str())
					.and(dsl::next_attempt_at.le(now)));

			let ids: Vec<String> = lifecycle_outbox::table
				.filter(due)
				.order(dsl::occurred_at.asc())
				.limit(limit as i64)
				.select(dsl::event_id)
				.load(conn)?;

			if ids.is_empty() {
				return Ok(vec![]);
			}

			diesel::update(lifecycle_outbox::table.filter(dsl::event_id.eq_any(&ids)))
				.set((
					dsl::status.eq(OutboxStatus::Processing.as_str()),
					dsl::next_attempt_at.eq(now + lease),
					dsl::updated_at.eq(now),
				))
				.execute(conn)?;

			let mut rows: Vec<LifecycleOutboxRow> = lifecycle_outbox::table
				.filter(dsl::event_id.eq_any(&ids))
				.load(conn)?;
			rows.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
			Ok(rows)
		})?;

		rows.into_iter()
			.map(|row| {
				let mut entry: OutboxEntry = row.try_into()?;
				entry
					.event
					.metadata
					.insert("attempts".to_owned(), Value::from(entry.attempts));
				Ok(entry)
			})
			.collect()
	}

	#[instrument(level = "debug", skip(self))]
	fn ack_event_sync(&self, event_id: &EventId) -> Result<(), StoreError> {
		use crate::schema::lifecycle_outbox::dsl;

		let mut conn = self.connection()?;
		diesel::update(lifecycle_outbox::table.filter(dsl::event_id.eq(event_id.as_str())))
			.set((
				dsl::status.eq(OutboxStatus::Delivered.as_str()),
				dsl::last_error.eq(None::<String>),
				dsl::next_attempt_at.eq(None::<DateTime<Utc>>),
				dsl::updated_at.eq(Utc::now()),
			))
			.execute(&mut conn)?;

		// Acking an already-delivered or pruned event stays a no-op
		Ok(())
	}

	#[instrument(level = "debug", skip(self, cause))]
	fn retry_event_sync(
		&self,
		event_id: &EventId,
		cause: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<OutboxStatus, StoreError> {
		use crate::schema::lifecycle_outbox::dsl;

		let status = match next_attempt_at {
			Some(_) => OutboxStatus::Pending,
			None => OutboxStatus::Failed,
		};

		let mut conn = self.connection()?;
		let updated =
			diesel::update(lifecycle_outbox::table.filter(dsl::event_id.eq(event_id.as_str())))
				.set((
					dsl::status.eq(status.as_str()),
					dsl::attempts.eq(dsl::attempts + 1),
					dsl::next_attempt_at.eq(next_attempt_at),
					dsl::last_error.eq(cause),
					dsl::updated_at.eq(Utc::now()),
				))
				.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		Ok(status)
	}
}

#[async_trait::async_trait]
impl OutboxStore for Store {
	async fn enqueue_event(&self, event: LifecycleEvent) -> Result<OutboxEntry, StoreError> {
		self.blocking(move |store| store.enqueue_event_sync(event)).await
	}

	async fn claim_event_batch(
		&self,
		limit: usize,
		now: DateTime<Utc>,
		lease: std::time::Duration,
	) -> Result<Vec<OutboxEntry>, StoreError> {
		let lease = chrono::Duration::from_std(lease)
			.map_err(|e| StoreError::InvalidRecord(format!("claim lease: {e}")))?;
		self.blocking(move |store| store.claim_event_batch_sync(limit, now, lease)).await
	}

	async fn ack_event(&self, event_id: &EventId) -> Result<(), StoreError> {
		let event_id = event_id.clone();
		self.blocking(move |store| store.ack_event_sync(&event_id)).await
	}

	async fn retry_event(
		&self,
		event_id: &EventId,
		cause: &str,
		next_attempt_at: Option<DateTime<Utc>>,
	) -> Result<OutboxStatus, StoreError> {
		let event_id = event_id.clone();
		let cause = cause.to_owned();
		self.blocking(move |store| store.retry_event_sync(&event_id, &cause, next_attempt_at))
			.await
	}
}

impl Store {
	fn dispatch_seen_sync(&self, idempotency_key: &str) -> Result<bool, StoreError> {
		use crate::schema::notification_dispatch::dsl;

		let mut conn = self.connection()?;
		let found: Option<String> = notification_dispatch::table
			.filter(dsl::idempotency_key.eq(idempotency_key))
			.select(dsl::idempotency_key)
			.first(&mut conn)
			.optional()?;
		Ok(found.is_some())
	}

	#[instrument(level = "debug", skip(self, dispatch), fields(key = %dispatch.idempotency_key))]
	fn record_dispatch_sync(&self, dispatch: NotificationDispatch) -> Result<(), StoreError> {
		let row = NotificationDispatchRow {
			idempotency_key: dispatch.idempotency_key,
			event_id: dispatch.event_id.to_string(),
			projector: dispatch.projector,
			definition_code: dispatch.definition_code,
			recipient_key: dispatch.recipient_key,
			status: dispatch.status,
			error: dispatch.error,
			metadata: json_text(&dispatch.metadata)?,
			created_at: dispatch.created_at,
		};

		let mut conn = self.connection()?;
		let inserted = diesel::insert_into(notification_dispatch::table)
			.values(&row)
			.on_conflict_do_nothing()
			.execute(&mut conn)?;

		if inserted == 0 {
			debug!("Duplicate dispatch record suppressed");
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl NotificationDispatchLedger for Store {
	async fn dispatch_seen(&self, idempotency_key: &str) -> Result<bool, StoreError> {
		let idempotency_key = idempotency_key.to_owned();
		self.blocking(move |store| store.dispatch_seen_sync(&idempotency_key)).await
	}

	async fn record_dispatch(&self, dispatch: NotificationDispatch) -> Result<(), StoreError> {
		self.blocking(move |store| store.record_dispatch_sync(dispatch)).await
	}
}
