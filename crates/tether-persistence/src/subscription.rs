use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::instrument;
use uuid::Uuid;

use common::{
	ids::{ProviderId, SubscriptionId},
	redaction::redact_metadata,
	store::{StoreError, SubscriptionStore},
	subscription::{NewSubscription, Subscription, SubscriptionStatus},
};

use crate::{
	rows::{json_text, SubscriptionRow},
	schema::subscription::{self, dsl},
	Store,
};

impl Store {
	#[instrument(level = "debug", skip(self, new), fields(
		provider_id = %new.provider_id,
		channel_id = %new.channel_id,
	))]
	fn insert_subscription_sync(&self, new: NewSubscription) -> Result<Subscription, StoreError> {
		let now = Utc::now();
		let row = SubscriptionRow {
			id: Uuid::new_v4().to_string(),
			connection_id: new.connection_id.to_string(),
			provider_id: new.provider_id.to_string(),
			resource_type: new.resource_type,
			resource_id: new.resource_id,
			channel_id: new.channel_id,
			remote_subscription_id: new.remote_subscription_id,
			callback_url: new.callback_url,
			verification_token_ref: new.verification_token_ref,
			status: SubscriptionStatus::Active.as_str().to_owned(),
			expires_at: new.expires_at,
			last_notified_at: None,
			metadata: json_text(&redact_metadata(&new.metadata))?,
			created_at: now,
			updated_at: now,
			deleted_at: None,
		};

		let mut conn = self.connection()?;
		diesel::insert_into(subscription::table).values(&row).execute(&mut conn)?;

		row.try_into()
	}

	fn subscription_sync(&self, id: &SubscriptionId) -> Result<Subscription, StoreError> {
		let mut conn = self.connection()?;
		let row: SubscriptionRow = subscription::table
			.filter(dsl::id.eq(id.as_str()))
			.first(&mut conn)
			.optional()?
			.ok_or(StoreError::RecordNotFound)?;
		row.try_into()
	}

	fn subscription_by_channel_sync(
		&self,
		provider_id: &ProviderId,
		channel_id: &str,
	) -> Result<Option<Subscription>, StoreError> {
		let mut conn = self.connection()?;
		let row: Option<SubscriptionRow> = subscription::table
			.filter(
				dsl::provider_id
					.eq(provider_id.as_str())
					.and(dsl::channel_id.eq(channel_id))
					.and(dsl::deleted_at.is_null()),
			)
			.first(&mut conn)
			.optional()?;

		row.map(TryInto::try_into).transpose()
	}

	#[instrument(level = "debug", skip(self))]
	fn update_subscription_status_sync(
		&self,
		id: &SubscriptionId,
		status: SubscriptionStatus,
	) -> Result<Subscription, StoreError> {
		let mut conn = self.connection()?;
		let updated = diesel::update(
			subscription::table.filter(dsl::id.eq(id.as_str()).and(dsl::deleted_at.is_null())),
		)
		.set((dsl::status.eq(status.as_str()), dsl::updated_at.eq(Utc::now())))
		.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		self.subscription_sync(id)
	}

	#[instrument(level = "debug", skip(self))]
	fn renew_subscription_sync(
		&self,
		id: &SubscriptionId,
		remote_subscription_id: Option<String>,
		expires_at: Option<DateTime<Utc>>,
	) -> Result<Subscription, StoreError> {
		#[derive(AsChangeset)]
		#[diesel(table_name = subscription)]
		struct RenewChanges {
			remote_subscription_id: Option<String>,
			expires_at: Option<DateTime<Utc>>,
			status: String,
			updated_at: DateTime<Utc>,
		}

		let mut conn = self.connection()?;
		let updated = diesel::update(
			subscription::table.filter(dsl::id.eq(id.as_str()).and(dsl::deleted_at.is_null())),
		)
		.set(RenewChanges {
			remote_subscription_id,
			expires_at,
			status: SubscriptionStatus::Active.as_str().to_owned(),
			updated_at: Utc::now(),
		})
		.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		self.subscription_sync(id)
	}

	fn mark_notified_sync(
		&self,
		id: &SubscriptionId,
		at: DateTime<Utc>,
	) -> Result<(), StoreError> {
		let mut conn = self.connection()?;
		diesel::update(subscription::table.filter(dsl::id.eq(id.as_str())))
			.set(dsl::last_notified_at.eq(at))
			.execute(&mut conn)?;
		Ok(())
	}

	fn expiring_subscriptions_sync(
		&self,
		before: DateTime<Utc>,
	) -> Result<Vec<Subscription>, StoreError> {
		let mut conn = self.connection()?;
		let rows: Vec<SubscriptionRow> = subscription::table
			.filter(
				dsl::status
					.eq(SubscriptionStatus::Active.as_str())
					.and(dsl::expires_at.le(before))
					.and(dsl::deleted_at.is_null()),
			)
			.order(dsl::expires_at.asc())
			.load(&mut conn)?;
		rows.into_iter().map(TryInto::try_into).collect()
	}

	fn soft_delete_subscription_sync(&self, id: &SubscriptionId) -> Result<(), StoreError> {
		let mut conn = self.connection()?;
		let now = Utc::now();
		let updated = diesel::update(
			subscription::table.filter(dsl::id.eq(id.as_str()).and(dsl::deleted_at.is_null())),
		)
		.set((dsl::deleted_at.eq(now), dsl::updated_at.eq(now)))
		.execute(&mut conn)?;

		if updated == 0 {
			return Err(StoreError::RecordNotFound);
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl SubscriptionStore for Store {
	async fn insert_subscription(
		&self,
		new: NewSubscription,
	) -> Result<Subscription, StoreError> {
		self.blocking(move |store| store.insert_subscription_sync(new)).await
	}

	async fn subscription(&self, id: &SubscriptionId) -> Result<Subscription, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.subscription_sync(&id)).await
	}

	async fn subscription_by_channel(
		&self,
		provider_id: &ProviderId,
		channel_id: &str,
	) -> Result<Option<Subscription>, StoreError> {
		let provider_id = provider_id.clone();
		let channel_id = channel_id.to_owned();
		self.blocking(move |store| store.subscription_by_channel_sync(&provider_id, &channel_id))
			.await
	}

	async fn update_subscription_status(
		&self,
		id: &SubscriptionId,
		status: SubscriptionStatus,
	) -> Result<Subscription, StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.update_subscription_status_sync(&id, status)).await
	}

	async fn renew_subscription(
		&self,
		id: &SubscriptionId,
		remote_subscription_id: Option<String>,
		expires_at: Option<DateTime<Utc>>,
	) -> Result<Subscription, StoreError> {
		let id = id.clone();
		self.blocking(move |store| {
			store.renew_subscription_sync(&id, remote_subscription_id, expires_at)
		})
		.await
	}

	async fn mark_notified(
		&self,
		id: &SubscriptionId,
		at: DateTime<Utc>,
	) -> Result<(), StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.mark_notified_sync(&id, at)).await
	}

	async fn expiring_subscriptions(
		&self,
		before: DateTime<Utc>,
	) -> Result<Vec<Subscription>, StoreError> {
		self.blocking(move |store| store.expiring_subscriptions_sync(before)).await
	}

	async fn soft_delete_subscription(&self, id: &SubscriptionId) -> Result<(), StoreError> {
		let id = id.clone();
		self.blocking(move |store| store.soft_delete_subscription_sync(&id)).await
	}
}
