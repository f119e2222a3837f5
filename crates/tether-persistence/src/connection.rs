use chrono::Utc;
use diesel::prelude::*;
use tracing::instrument;
use uuid::Uuid;

use common::{
	connection::{Connection, ConnectionStatus, NewConnection},
	ids::{ConnectionId, ProviderId},
	scope::ScopeRef,
	store::{ConnectionStore, StoreError},
};

use crate::{
	rows::ConnectionRow,
	schema::connection::{self, dsl},
	Store,
};

impl Store {
	#[instrument(level = "debug", skip(self))]
	fn insert_connection_sync(&self, new: NewConnection) -> Result<Connection, StoreError> {
		let now = Utc::now();
		let row = ConnectionRow {
			id: Uuid::new_v4().to_string(),
			provider_id: new.provider_id.to_string(),
			scope_type: new.scope.scope_type.to_string(),
			scope_id: new.scope.id.clone(),
			external_account_id: new.external_account_id,
			status: ConnectionStatus::Active.as_str().to_owned(),
			inherits_from: new.inherits_from.map(|id| id.to_string()),
			last_error: None,
			created_at: now,
			updated_at: now,
			deleted_at: None,
		};

		let mut conn = self.connection()?;
		diesel::insert_into(connection::table).values(&row).execute(&mut conn)?;

		row.try_into()
	}

	fn connection_sync(&self, id: &ConnectionId) -> Result<Connection, StoreError> {
		let mut conn = self.connection()?;
		let row: ConnectionRow = connection::table
			.filter(dsl::id.eq(id.as_str()))
			.first(&mut conn)
			.optional()?
			.ok_or(StoreError::RecordNotFound)?;
		row.try_into()
	}

	fn find_connection_sync(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		external_account_id: &str,
	) -> Result<Option<Connection>, StoreError> {
		let mut conn = self.connection()?;
		let row: Option<ConnectionRow> = connection::table
			.filter(
				dsl::provider_id
					.eq(provider_id.as_str())
					.and(dsl::scope_type.eq(scope.scope_type.as_str()))
					.and(dsl::scope_id.eq(&scope.id))
					.and(dsl::external_account_id.eq(external_account_id))
					.and(dsl::deleted_at.is_null()),
			)
			.first(&mut conn)
			.optional()?;

		row.map(TryInto::try_into).transpose()
	}

	#[instrument(level = "debug", skip(self))]
	fn transition_status_sync(
		&self,
		id: &ConnectionId,
		from: ConnectionStatus,
		to: ConnectionStatus,
	) -> Result<Connection, StoreError> {
		let mut conn = self.connection()?;
		let updated = diesel::update(
			connection::table.filter(
				dsl::id.eq(id.as_str()).and(dsl::status.eq(from.as_str())).and(dsl::deleted_at
					.is_null()),
			),
		)
		.set((dsl::status.eq(to.as_str()), dsl::updated_at.eq(Utc::now())))
		.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::InvalidTransition {
				from: from.as_str().to_owned(),
				to: to.as_str().to_owned(),
			});
		}

		self.connection_sync(id)
	}

	fn set_last_error_sync(
		&self,
		id: &ConnectionId,
		error: Option<String>,
	) -> Result<(), StoreError> {
		let mut conn = self.connection()?;
		let updated = diesel::update(connection::table.filter(dsl::id.eq(id.as_str())))
			.set((dsl::last_error.eq(error), dsl::updated_at.eq(Utc::now())))
			.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		Ok(())
	}

	fn soft_delete_connection_sync(&self, id: &ConnectionId) -> Result<(), StoreError> {
		let mut conn = self.connection()?;
		let now = Utc::now();
		let updated = diesel::update(
			connection::table.filter(dsl::id.eq(id.as_str()).and(dsl::deleted_at.is_null())),
		)
		.set((dsl::deleted_at.eq(now), dsl::updated_at.eq(now)))
		.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		Ok(())
	}

	fn list_connections_for_scope_sync(
		&self,
		scope: &ScopeRef,
		include_deleted: bool,
	) -> Result<Vec<Connection>, StoreError> {
		let mut conn = self.connection()?;
		let mut query = connection::table
			.filter(dsl::scope_type.eq(scope.scope_type.as_str()).and(dsl::scope_id.eq(&scope.id)))
			.into_boxed();

		if !include_deleted {
			query = query.filter(dsl::deleted_at.is_null());
		}

		let rows: Vec<ConnectionRow> = query.order(dsl::created_at.asc()).load(&mut conn)?;
		rows.into_iter().map(TryInto::try_into).collect()
	}
}

#[async_trait::async_trait]
impl ConnectionStore for Store {
	async fn insert_connection(&self, new: NewConnection) -> Result<Connection, StoreError> {
		self.blocking(move |store| store.insert_connection_sync(new)).await
	}

	async fn connection(&self, id: &ConnectionId) -> Result<Connection, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.connection_sync(&id)).await
	}

	async fn find_connection(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		external_account_id: &str,
	) -> Result<Option<Connection>, StoreError> {
		let provider_id = provider_id.clone();
		let scope = scope.clone();
		let external_account_id = external_account_id.to_owned();
		self.blocking(move |store| {
			store.find_connection_sync(&provider_id, &scope, &external_account_id)
		})
		.await
	}

	async fn transition_status(
		&self,
		id: &ConnectionId,
		from: ConnectionStatus,
		to: ConnectionStatus,
	) -> Result<Connection, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.transition_status_sync(&id, from, to)).await
	}

	async fn set_last_error(
		&self,
		id: &ConnectionId,
		error: Option<String>,
	) -> Result<(), StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.set_last_error_sync(&id, error)).await
	}

	async fn soft_delete_connection(&self, id: &ConnectionId) -> Result<(), StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.soft_delete_connection_sync(&id)).await
	}

	async fn list_connections_for_scope(
		&self,
		scope: &ScopeRef,
		include_deleted: bool,
	) -> Result<Vec<Connection>, StoreError> {
		let scope = scope.clone();
		self.blocking(move |store| store.list_connections_for_scope_sync(&scope, include_deleted))
			.await
	}
}
