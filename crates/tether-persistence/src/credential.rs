use chrono::Utc;
use diesel::prelude::*;
use tracing::instrument;
use uuid::Uuid;

use common::{
	connection::{Credential, CredentialStatus, NewCredential},
	grants::{NewGrantEvent, NewGrantSnapshot},
	ids::{ConnectionId, CredentialId},
	store::{CredentialRotation, CredentialStore, StoreError},
};

use crate::{
	grants::save_snapshot_in_txn,
	rows::{json_list, CredentialRow},
	schema::credential::{self, dsl},
	Store,
};

const ROTATION_REASON: &str = "rotated";

impl Store {
	fn active_credential_sync(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Option<Credential>, StoreError> {
		let mut conn = self.connection()?;
		let row: Option<CredentialRow> = credential::table
			.filter(
				dsl::connection_id
					.eq(connection_id.as_str())
					.and(dsl::status.eq(CredentialStatus::Active.as_str())),
			)
			.first(&mut conn)
			.optional()?;

		row.map(TryInto::try_into).transpose()
	}

	/// Revoke the prior active credential, insert the next version, and
	/// write the grant snapshot plus paired event, all in one transaction.
	#[instrument(level = "debug", skip(self, new, snapshot, event), fields(connection_id = %new.connection_id))]
	fn rotate_credential_sync(
		&self,
		new: NewCredential,
		snapshot: NewGrantSnapshot,
		event: Option<NewGrantEvent>,
	) -> Result<CredentialRotation, StoreError> {
		let mut conn = self.connection()?;

		let (credential_row, snapshot_row, revoked) =
			conn.build_transaction().run::<_, StoreError, _>(|conn| {
				let now = Utc::now();

				let prior: Option<CredentialRow> = credential::table
					.filter(
						dsl::connection_id
							.eq(new.connection_id.as_str())
							.and(dsl::status.eq(CredentialStatus::Active.as_str())),
					)
					.first(conn)
					.optional()?;

				if let Some(prior) = &prior {
					diesel::update(credential::table.filter(dsl::id.eq(&prior.id)))
						.set((
							dsl::status.eq(CredentialStatus::Revoked.as_str()),
							dsl::revocation_reason.eq(ROTATION_REASON),
							dsl::updated_at.eq(now),
						))
						.execute(conn)?;
				}

				let next_version: i32 = credential::table
					.filter(dsl::connection_id.eq(new.connection_id.as_str()))
					.select(diesel::dsl::max(dsl::version))
					.first::<Option<i32>>(conn)?
					.unwrap_or(0)
					+ 1;

				let snapshot_row = save_snapshot_in_txn(conn, snapshot, event)?;

				let row = CredentialRow {
					id: Uuid::new_v4().to_string(),
					connection_id: new.connection_id.to_string(),
					version: next_version,
					encrypted_payload: new.encrypted_payload,
					payload_format: new.payload_format,
					payload_version: new.payload_version,
					token_type: new.token_type,
					requested_scopes: json_list(&new.requested_scopes)?,
					granted_scopes: json_list(&new.granted_scopes)?,
					expires_at: new.expires_at,
					rotates_at: new.rotates_at,
					refreshable: new.refreshable,
					status: CredentialStatus::Active.as_str().to_owned(),
					grant_version: snapshot_row.version,
					encryption_key_id: new.encryption_key_id,
					encryption_version: new.encryption_version,
					revocation_reason: None,
					created_at: now,
					updated_at: now,
				};
				diesel::insert_into(credential::table).values(&row).execute(conn)?;

				Ok((row, snapshot_row, prior.map(|p| CredentialId::from(p.id))))
			})?;

		Ok(CredentialRotation {
			credential: credential_row.try_into()?,
			snapshot: snapshot_row.try_into()?,
			revoked,
		})
	}

	#[instrument(level = "debug", skip(self))]
	fn revoke_active_sync(
		&self,
		connection_id: &ConnectionId,
		reason: &str,
	) -> Result<Option<Credential>, StoreError> {
		let mut conn = self.connection()?;

		conn.build_transaction().run::<_, StoreError, _>(|conn| {
			let active: Option<CredentialRow> = credential::table
				.filter(
					dsl::connection_id
						.eq(connection_id.as_str())
						.and(dsl::status.eq(CredentialStatus::Active.as_str())),
				)
				.first(conn)
				.optional()?;

			let Some(active) = active else {
				return Ok(None);
			};

			diesel::update(credential::table.filter(dsl::id.eq(&active.id)))
				.set((
					dsl::status.eq(CredentialStatus::Revoked.as_str()),
					dsl::revocation_reason.eq(reason),
					dsl::updated_at.eq(Utc::now()),
				))
				.execute(conn)?;

			let row: CredentialRow =
				credential::table.filter(dsl::id.eq(&active.id)).first(conn)?;
			Ok(Some(row.try_into()?))
		})
	}

	fn credential_history_sync(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<Credential>, StoreError> {
		let mut conn = self.connection()?;
		let rows: Vec<CredentialRow> = credential::table
			.filter(dsl::connection_id.eq(connection_id.as_str()))
			.order(dsl::version.asc())
			.load(&mut conn)?;
		rows.into_iter().map(TryInto::try_into).collect()
	}
}

#[async_trait::async_trait]
impl CredentialStore for Store {
	async fn active_credential(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Option<Credential>, StoreError> {
		let connection_id = connection_id.clone();
		self.blocking(move |store| store.active_credential_sync(&connection_id)).await
	}

	async fn rotate_credential(
		&self,
		new: NewCredential,
		snapshot: NewGrantSnapshot,
		event: Option<NewGrantEvent>,
	) -> Result<CredentialRotation, StoreError> {
		self.blocking(move |store| store.rotate_credential_sync(new, snapshot, event)).await
	}

	async fn revoke_active(
		&self,
		connection_id: &ConnectionId,
		reason: &str,
	) -> Result<Option<Credential>, StoreError> {
		let connection_id = connection_id.clone();
		let reason = reason.to_owned();
		self.blocking(move |store| store.revoke_active_sync(&connection_id, &reason)).await
	}

	async fn credential_history(
		&self,
		connection_id: &ConnectionId,
	) -> Result<Vec<Credential>, StoreError> {
		let connection_id = connection_id.clone();
		self.blocking(move |store| store.credential_history_sync(&connection_id)).await
	}
}
