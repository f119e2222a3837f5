use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use tracing::{debug, instrument};
use uuid::Uuid;

use common::{
	activity::{NewServiceActivity, RetentionPolicy, ServiceActivity},
	redaction::redact_metadata,
	store::{ActivityRetentionPruner, ServicesActivitySink, StoreError},
};

use crate::{
	rows::{json_text, ServiceActivityRow},
	schema::service_activity::{self, dsl},
	Store,
};

impl Store {
	#[instrument(level = "debug", skip(self, activity), fields(action = %activity.action))]
	fn record_activity_sync(
		&self,
		activity: NewServiceActivity,
	) -> Result<ServiceActivity, StoreError> {
		let row = ServiceActivityRow {
			id: Uuid::new_v4().to_string(),
			provider_id: activity.provider_id.to_string(),
			scope_type: activity.scope.scope_type.to_string(),
			scope_id: activity.scope.id.clone(),
			connection_id: activity.connection_id.as_ref().map(|id| id.to_string()),
			installation_id: activity.installation_id.as_ref().map(|id| id.to_string()),
			subscription_id: activity.subscription_id.as_ref().map(|id| id.to_string()),
			sync_job_id: activity.sync_job_id.as_ref().map(|id| id.to_string()),
			channel: activity.channel.clone(),
			action: activity.action.clone(),
			object_type: activity.object_type.clone(),
			object_id: activity.object_id.clone(),
			actor: activity.actor.clone(),
			actor_type: activity.actor_type.clone(),
			status: activity.status.as_str().to_owned(),
			metadata: json_text(&redact_metadata(&activity.metadata))?,
			created_at: Utc::now(),
		};

		let mut conn = self.connection()?;
		diesel::insert_into(service_activity::table).values(&row).execute(&mut conn)?;

		row.try_into()
	}

	/// TTL deletion first, then trim the oldest rows beyond the cap.
	#[instrument(level = "debug", skip(self))]
	fn prune_activity_sync(
		&self,
		policy: &RetentionPolicy,
		now: DateTime<Utc>,
	) -> Result<u64, StoreError> {
		let ttl = Duration::from_std(policy.ttl)
			.map_err(|e| StoreError::InvalidRecord(format!("retention ttl: {e}")))?;
		let horizon = now - ttl;

		let mut conn = self.connection()?;
		let expired = diesel::delete(service_activity::table.filter(dsl::created_at.lt(horizon)))
			.execute(&mut conn)? as u64;

		let total: i64 = service_activity::table.count().get_result(&mut conn)?;
		let over_cap = (total as u64).saturating_sub(policy.row_cap);

		let trimmed = if over_cap > 0 {
			let victims: Vec<String> = service_activity::table
				.order(dsl::created_at.asc())
				.limit(over_cap as i64)
				.select(dsl::id)
				.load(&mut conn)?;

			diesel::delete(service_activity::table.filter(dsl::id.eq_any(&victims)))
				.execute(&mut conn)? as u64
		} else {
			0
		};

		debug!(expired, trimmed, "Pruned activity ledger");
		Ok(expired + trimmed)
	}
}

#[async_trait::async_trait]
impl ServicesActivitySink for Store {
	async fn record_activity(
		&self,
		activity: NewServiceActivity,
	) -> Result<ServiceActivity, StoreError> {
		self.blocking(move |store| store.record_activity_sync(activity)).await
	}
}

#[async_trait::async_trait]
impl ActivityRetentionPruner for Store {
	async fn prune_activity(
		&self,
		policy: &RetentionPolicy,
		now: DateTime<Utc>,
	) -> Result<u64, StoreError> {
		let policy = *policy;
		self.blocking(move |store| store.prune_activity_sync(&policy, now)).await
	}
}
