use chrono::{Duration, Utc};
use diesel::prelude::*;
use tracing::{debug, instrument};

use common::{
	ids::ProviderId,
	store::{ClaimDelivery, StoreError, WebhookDeliveryLedger},
	webhook::{DeliveryClaim, WebhookDelivery, WebhookDeliveryStatus, DEFAULT_CLAIM_LEASE},
};

use crate::{
	rows::WebhookDeliveryRow,
	schema::webhook_delivery::{self, dsl},
	Store,
};

impl Store {
	/// Insert-if-absent then CAS to `processing`. The row is claimable while
	/// `pending`, or `retry_ready`/`processing` once its attempt lease has
	/// lapsed.
	#[instrument(level = "debug", skip(self, claim), fields(
		provider_id = %claim.provider_id,
		delivery_id = %claim.delivery_id,
	))]
	fn claim_delivery_sync(
		&self,
		claim: ClaimDelivery,
	) -> Result<Option<DeliveryClaim>, StoreError> {
		let lease = if claim.lease.is_zero() { DEFAULT_CLAIM_LEASE } else { claim.lease };
		let lease = Duration::from_std(lease)
			.map_err(|e| StoreError::InvalidRecord(format!("claim lease: {e}")))?;
		let now = claim.now;

		let mut conn = self.connection()?;
		conn.build_transaction().run::<_, StoreError, _>(|conn| {
			let row = WebhookDeliveryRow {
				provider_id: claim.provider_id.to_string(),
				delivery_id: claim.delivery_id.clone(),
				status: WebhookDeliveryStatus::Pending.as_str().to_owned(),
				attempts: 0,
				next_attempt_at: None,
				payload: claim.payload.clone(),
				last_error: None,
				created_at: now,
				updated_at: now,
			};
			diesel::insert_into(webhook_delivery::table)
				.values(&row)
				.on_conflict_do_nothing()
				.execute(conn)?;

			let claimable = dsl::provider_id
				.eq(claim.provider_id.as_str())
				.and(dsl::delivery_id.eq(&claim.delivery_id))
				.and(
					dsl::status
						.eq(WebhookDeliveryStatus::Pending.as_str())
						.or(dsl::status
							.eq(WebhookDeliveryStatus::RetryReady.as_str())
							.and(dsl::next_attempt_at.le(now)))
						.or(dsl::status
							.eq(WebhookDeliveryStatus::Processing.as_str())
							.and(dsl::next_attempt_at.le(now))),
				);

			let updated = diesel::update(webhook_delivery::table.filter(claimable))
				.set((
					dsl::status.eq(WebhookDeliveryStatus::Processing.as_str()),
					dsl::attempts.eq(dsl::attempts + 1),
					dsl::next_attempt_at.eq(now + lease),
					dsl::updated_at.eq(now),
				))
				.execute(conn)?;

			if updated == 0 {
				debug!("Delivery not claimable; treating as duplicate");
				return Ok(None);
			}

			let stored: WebhookDeliveryRow = webhook_delivery::table
				.filter(
					dsl::provider_id
						.eq(claim.provider_id.as_str())
						.and(dsl::delivery_id.eq(&claim.delivery_id)),
				)
				.first(conn)?;

			Ok(Some(DeliveryClaim {
				provider_id: claim.provider_id.clone(),
				delivery_id: claim.delivery_id.clone(),
				attempts: stored.attempts,
			}))
		})
	}

	#[instrument(level = "debug", skip(self), fields(claim = %claim))]
	fn complete_delivery_sync(&self, claim: &DeliveryClaim) -> Result<bool, StoreError> {
		let mut conn = self.connection()?;
		let updated = diesel::update(
			webhook_delivery::table.filter(
				dsl::provider_id
					.eq(claim.provider_id.as_str())
					.and(dsl::delivery_id.eq(&claim.delivery_id))
					.and(dsl::status.eq(WebhookDeliveryStatus::Processing.as_str()))
					.and(dsl::attempts.eq(claim.attempts)),
			),
		)
		.set((
			dsl::status.eq(WebhookDeliveryStatus::Processed.as_str()),
			dsl::next_attempt_at.eq(None::<chrono::DateTime<Utc>>),
			dsl::last_error.eq(None::<String>),
			dsl::updated_at.eq(Utc::now()),
		))
		.execute(&mut conn)?;

		Ok(updated == 1)
	}

	#[instrument(level = "debug", skip(self, error), fields(claim = %claim))]
	fn fail_delivery_sync(
		&self,
		claim: &DeliveryClaim,
		error: &str,
		next_attempt_at: chrono::DateTime<Utc>,
		max_attempts: i32,
	) -> Result<Option<WebhookDeliveryStatus>, StoreError> {
		let mut conn = self.connection()?;
		conn.build_transaction().run::<_, StoreError, _>(|conn| {
			let stored: Option<WebhookDeliveryRow> = webhook_delivery::table
				.filter(
					dsl::provider_id
						.eq(claim.provider_id.as_str())
						.and(dsl::delivery_id.eq(&claim.delivery_id)),
				)
				.first(conn)
				.optional()?;

			// An unknown delivery is an invalid claim; a stale attempt is a
			// no-op
			let stored = stored.ok_or(StoreError::RecordNotFound)?;
			if stored.status != WebhookDeliveryStatus::Processing.as_str()
				|| stored.attempts != claim.attempts
			{
				return Ok(None);
			}

			let dead = claim.attempts >= max_attempts;
			let (status, next) = if dead {
				(WebhookDeliveryStatus::Dead, None)
			} else {
				(WebhookDeliveryStatus::RetryReady, Some(next_attempt_at))
			};

			let updated = diesel::update(
				webhook_delivery::table.filter(
					dsl::provider_id
						.eq(claim.provider_id.as_str())
						.and(dsl::delivery_id.eq(&claim.delivery_id))
						.and(dsl::status.eq(WebhookDeliveryStatus::Processing.as_str()))
						.and(dsl::attempts.eq(claim.attempts)),
				),
			)
			.set((
				dsl::status.eq(status.as_str()),
				dsl::next_attempt_at.eq(next),
				dsl::last_error.eq(error),
				dsl::updated_at.eq(Utc::now()),
			))
			.execute(conn)?;

			if updated == 0 {
				return Ok(None);
			}
			Ok(Some(status))
		})
	}

	fn delivery_sync(
		&self,
		provider_id: &ProviderId,
		delivery_id: &str,
	) -> Result<Option<WebhookDelivery>, StoreError> {
		let mut conn = self.connection()?;
		let row: Option<WebhookDeliveryRow> = webhook_delivery::table
			.filter(
				dsl::provider_id
					.eq(provider_id.as_str())
					.and(dsl::delivery_id.eq(delivery_id)),
			)
			.first(&mut conn)
			.optional()?;

		row.map(TryInto::try_into).transpose()
	}
}

#[async_trait::async_trait]
impl WebhookDeliveryLedger for Store {
	async fn claim_delivery(
		&self,
		claim: ClaimDelivery,
	) -> Result<Option<DeliveryClaim>, StoreError> {
		self.blocking(move |store| store.claim_delivery_sync(claim)).await
	}

	async fn complete_delivery(&self, claim: &DeliveryClaim) -> Result<bool, StoreError> {
		let claim = claim.clone();
		self.blocking(move |store| store.complete_delivery_sync(&claim)).await
	}

	async fn fail_delivery(
		&self,
		claim: &DeliveryClaim,
		error: &str,
		next_attempt_at: chrono::DateTime<Utc>,
		max_attempts: i32,
	) -> Result<Option<WebhookDeliveryStatus>, StoreError> {
		let claim = claim.clone();
		let error = error.to_owned();
		self.blocking(move |store| {
			store.fail_delivery_sync(&claim, &error, next_attempt_at, max_attempts)
		})
		.await
	}

	async fn delivery(
		&self,
		provider_id: &ProviderId,
		delivery_id: &str,
	) -> Result<Option<WebhookDelivery>, StoreError> {
		let provider_id = provider_id.clone();
		let delivery_id = delivery_id.to_owned();
		self.blocking(move |store| store.delivery_sync(&provider_id, &delivery_id)).await
	}
}
