use chrono::Utc;
use diesel::{prelude::*, PgConnection};
use tracing::instrument;
use uuid::Uuid;

use common::{
	grants::{GrantEvent, GrantSnapshot, NewGrantEvent, NewGrantSnapshot},
	ids::ConnectionId,
	redaction::redact_metadata,
	store::{GrantStore, StoreError},
};

use crate::{
	rows::{json_list, json_text, GrantEventRow, GrantSnapshotRow},
	schema::{grant_event, grant_snapshot},
	Store,
};

/// Assign the next snapshot version and write the snapshot plus its paired
/// event. Runs inside the caller's transaction so credential rotation can
/// compose with it.
pub(crate) fn save_snapshot_in_txn(
	conn: &mut PgConnection,
	snapshot: NewGrantSnapshot,
	event: Option<NewGrantEvent>,
) -> Result<GrantSnapshotRow, StoreError> {
	use crate::schema::grant_snapshot::dsl;

	let next_version: i32 = grant_snapshot::table
		.filter(dsl::connection_id.eq(snapshot.connection_id.as_str()))
		.select(diesel::dsl::max(dsl::version))
		.first::<Option<i32>>(conn)?
		.unwrap_or(0)
		+ 1;

	let row = GrantSnapshotRow {
		connection_id: snapshot.connection_id.to_string(),
		version: next_version,
		requested: json_list(&snapshot.requested)?,
		granted: json_list(&snapshot.granted)?,
		captured_at: Utc::now(),
		metadata: json_text(&redact_metadata(&snapshot.metadata))?,
	};
	diesel::insert_into(grant_snapshot::table).values(&row).execute(conn)?;

	if let Some(event) = event {
		save_event_in_txn(conn, event)?;
	}

	Ok(row)
}

pub(crate) fn save_event_in_txn(
	conn: &mut PgConnection,
	event: NewGrantEvent,
) -> Result<(), StoreError> {
	let row = GrantEventRow {
		id: Uuid::new_v4().to_string(),
		connection_id: event.connection_id.to_string(),
		event_type: event.event_type.as_str().to_owned(),
		added: json_list(&event.added)?,
		removed: json_list(&event.removed)?,
		occurred_at: Utc::now(),
		metadata: json_text(&redact_metadata(&event.metadata))?,
	};
	diesel::insert_into(grant_event::table).values(&row).execute(conn)?;
	Ok(())
}

impl Store {
	fn latest_snapshot_sync(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Option<GrantSnapshot>, StoreError> {
		use crate::schema::grant_snapshot::dsl;

		let mut conn = self.connection()?;
		let row: Option<GrantSnapshotRow> = grant_snapshot::table
			.filter(dsl::connection_id.eq(connection_id.as_str()))
			.order((dsl::version.desc(), dsl::captured_at.desc()))
			.first(&mut conn)
			.optional()?;

		row.map(TryInto::try_into).transpose()
	}

	#[instrument(level = "debug", skip(self, snapshot, event))]
	fn save_snapshot_with_event_sync(
		&self,
		snapshot: NewGrantSnapshot,
		event: Option<NewGrantEvent>,
	) -> Result<GrantSnapshot, StoreError> {
		let mut conn = self.connection()?;
		let row = conn
			.build_transaction()
			.run::<_, StoreError, _>(|conn| save_snapshot_in_txn(conn, snapshot, event))?;
		row.try_into()
	}

	fn snapshot_history_sync(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<GrantSnapshot>, StoreError> {
		use crate::schema::grant_snapshot::dsl;

		let mut conn = self.connection()?;
		let rows: Vec<GrantSnapshotRow> = grant_snapshot::table
			.filter(dsl::connection_id.eq(connection_id.as_str()))
			.order(dsl::version.asc())
			.load(&mut conn)?;
		rows.into_iter().map(TryInto::try_into).collect()
	}

	fn grant_events_sync(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<GrantEvent>, StoreError> {
		use crate::schema::grant_event::dsl;

		let mut conn = self.connection()?;
		let rows: Vec<GrantEventRow> = grant_event::table
			.filter(dsl::connection_id.eq(connection_id.as_str()))
			.order(dsl::occurred_at.asc())
			.load(&mut conn)?;
		rows.into_iter().map(TryInto::try_into).collect()
	}
}

#[async_trait::async_trait]
impl GrantStore for Store {
	async fn latest_snapshot(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Option<GrantSnapshot>, StoreError> {
		let connection_id = connection_id.clone();
		self.blocking(move |store| store.latest_snapshot_sync(&connection_id)).await
	}

	async fn save_snapshot_with_event(
		&self,
		snapshot: NewGrantSnapshot,
		event: Option<NewGrantEvent>,
	) -> Result<GrantSnapshot, StoreError> {
		self.blocking(move |store| store.save_snapshot_with_event_sync(snapshot, event)).await
	}

	async fn snapshot_history(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<GrantSnapshot>, StoreError> {
		let connection_id = connection_id.clone();
		self.blocking(move |store| store.snapshot_history_sync(&connection_id)).await
	}

	async fn grant_events(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<GrantEvent>, StoreError> {
		let connection_id = connection_id.clone();
		self.blocking(move |store| store.grant_events_sync(&connection_id)).await
	}
}
