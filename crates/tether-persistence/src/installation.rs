use chrono::Utc;
use diesel::prelude::*;
use tracing::instrument;
use uuid::Uuid;

use common::{
	ids::ProviderId,
	installation::{Installation, InstallationStatus, UpsertInstallation},
	redaction::redact_metadata,
	scope::ScopeRef,
	store::{InstallationStore, StoreError},
};

use crate::{
	rows::{json_text, InstallationRow},
	schema::installation::{self, dsl},
	Store,
};

impl Store {
	#[instrument(level = "debug", skip(self, upsert), fields(provider_id = %upsert.provider_id))]
	fn upsert_installation_sync(
		&self,
		upsert: UpsertInstallation,
	) -> Result<Installation, StoreError> {
		let now = Utc::now();
		let metadata = json_text(&redact_metadata(&upsert.metadata))?;
		let revoked_at = match upsert.status {
			InstallationStatus::Uninstalled => Some(now),
			_ => None,
		};

		let row = InstallationRow {
			id: Uuid::new_v4().to_string(),
			provider_id: upsert.provider_id.to_string(),
			scope_type: upsert.scope.scope_type.to_string(),
			scope_id: upsert.scope.id.clone(),
			install_type: upsert.install_type.clone(),
			status: upsert.status.as_str().to_owned(),
			granted_at: upsert.granted_at,
			revoked_at,
			metadata: metadata.clone(),
			created_at: now,
			updated_at: now,
		};

		let mut conn = self.connection()?;
		diesel::insert_into(installation::table)
			.values(&row)
			.on_conflict((dsl::provider_id, dsl::scope_type, dsl::scope_id))
			.do_update()
			.set((
				dsl::install_type.eq(&upsert.install_type),
				dsl::status.eq(upsert.status.as_str()),
				dsl::granted_at.eq(upsert.granted_at),
				dsl::revoked_at.eq(revoked_at),
				dsl::metadata.eq(&metadata),
				dsl::updated_at.eq(now),
			))
			.execute(&mut conn)?;

		self.installation_sync(&upsert.provider_id, &upsert.scope)?
			.ok_or(StoreError::RecordNotFound)
	}

	#[instrument(level = "debug", skip(self))]
	fn update_installation_status_sync(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		status: InstallationStatus,
	) -> Result<Installation, StoreError> {
		let current = self
			.installation_sync(provider_id, scope)?
			.ok_or(StoreError::RecordNotFound)?;

		if !current.status.can_update_to(status) {
			return Err(StoreError::InvalidTransition {
				from: current.status.as_str().to_owned(),
				to: status.as_str().to_owned(),
			});
		}

		let now = Utc::now();
		let revoked_at = match status {
			InstallationStatus::Uninstalled => Some(now),
			_ => current.revoked_at,
		};

		let mut conn = self.connection()?;
		let updated = diesel::update(
			installation::table.filter(
				dsl::provider_id
					.eq(provider_id.as_str())
					.and(dsl::scope_type.eq(scope.scope_type.as_str()))
					.and(dsl::scope_id.eq(&scope.id))
					.and(dsl::status.eq(current.status.as_str())),
			),
		)
		.set((
			dsl::status.eq(status.as_str()),
			dsl::revoked_at.eq(revoked_at),
			dsl::updated_at.eq(now),
		))
		.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::InvalidTransition {
				from: current.status.as_str().to_owned(),
				to: status.as_str().to_owned(),
			});
		}

		self.installation_sync(provider_id, scope)?.ok_or(StoreError::RecordNotFound)
	}

	fn installation_sync(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
	) -> Result<Option<Installation>, StoreError> {
		let mut conn = self.connection()?;
		let row: Option<InstallationRow> = installation::table
			.filter(
				dsl::provider_id
					.eq(provider_id.as_str())
					.and(dsl::scope_type.eq(scope.scope_type.as_str()))
					.and(dsl::scope_id.eq(&scope.id)),
			)
			.first(&mut conn)
			.optional()?;

		row.map(TryInto::try_into).transpose()
	}
}

#[async_trait::async_trait]
impl InstallationStore for Store {
	async fn upsert_installation(
		&self,
		upsert: UpsertInstallation,
	) -> Result<Installation, StoreError> {
		self.blocking(move |store| store.upsert_installation_sync(upsert)).await
	}

	async fn update_installation_status(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		status: InstallationStatus,
	) -> Result<Installation, StoreError> {
		let provider_id = provider_id.clone();
		let scope = scope.clone();
		self.blocking(move |store| {
			store.update_installation_status_sync(&provider_id, &scope, status)
		})
		.await
	}

	async fn installation(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
	) -> Result<Option<Installation>, StoreError> {
		let provider_id = provider_id.clone();
		let scope = scope.clone();
		self.blocking(move |store| store.installation_sync(&provider_id, &scope)).await
	}
}
