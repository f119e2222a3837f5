use chrono::Utc;
use diesel::prelude::*;
use tracing::instrument;

use common::{
	ratelimit::{RateLimitKey, RateLimitState},
	store::{RateLimitStateStore, StoreError},
};

use crate::{
	rows::{json_text, RateLimitStateRow},
	schema::rate_limit_state::{self, dsl},
	Store,
};

impl Store {
	fn rate_limit_state_sync(&self, key: &RateLimitKey) -> Result<RateLimitState, StoreError> {
		let mut conn = self.connection()?;
		let row: Option<RateLimitStateRow> = rate_limit_state::table
			.filter(
				dsl::provider_id
					.eq(key.provider_id())
					.and(dsl::scope_type.eq(key.scope_type()))
					.and(dsl::scope_id.eq(key.scope_id()))
					.and(dsl::bucket_key.eq(key.bucket_key())),
			)
			.first(&mut conn)
			.optional()?;

		row.ok_or(StoreError::StateNotFound)?.try_into()
	}

	#[instrument(level = "debug", skip(self, state), fields(key = %state.key))]
	fn upsert_rate_limit_state_sync(&self, state: RateLimitState) -> Result<(), StoreError> {
		let row = RateLimitStateRow {
			provider_id: state.key.provider_id().to_owned(),
			scope_type: state.key.scope_type().to_owned(),
			scope_id: state.key.scope_id().to_owned(),
			bucket_key: state.key.bucket_key().to_owned(),
			limit_value: state.limit,
			remaining: state.remaining,
			reset_at: state.reset_at,
			retry_after_seconds: state.retry_after.map(|d| d.num_seconds()),
			metadata: json_text(&state.to_stored_metadata())?,
			updated_at: Utc::now(),
		};

		let mut conn = self.connection()?;
		diesel::insert_into(rate_limit_state::table)
			.values(&row)
			.on_conflict((dsl::provider_id, dsl::scope_type, dsl::scope_id, dsl::bucket_key))
			.do_update()
			.set((
				dsl::limit_value.eq(row.limit_value),
				dsl::remaining.eq(row.remaining),
				dsl::reset_at.eq(row.reset_at),
				dsl::retry_after_seconds.eq(row.retry_after_seconds),
				dsl::metadata.eq(&row.metadata),
				dsl::updated_at.eq(row.updated_at),
			))
			.execute(&mut conn)?;

		Ok(())
	}
}

#[async_trait::async_trait]
impl RateLimitStateStore for Store {
	async fn rate_limit_state(&self, key: &RateLimitKey) -> Result<RateLimitState, StoreError> {
		let key = key.clone();
		self.blocking(move |store| store.rate_limit_state_sync(&key)).await
	}

	async fn upsert_rate_limit_state(&self, state: RateLimitState) -> Result<(), StoreError> {
		self.blocking(move |store| store.upsert_rate_limit_state_sync(state)).await
	}
}
