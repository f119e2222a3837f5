use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{instrument, warn};
use uuid::Uuid;

use common::{
	activity::NewServiceActivity,
	ids::{ConnectionId, ProviderId, SubscriptionId},
	outbox::{events, LifecycleEvent},
	provider::ProviderRegistry,
	store::{ConnectionStore, OutboxStore, RuntimeStores, SubscriptionStore},
	subscription::{
		subscription_unsupported, NewSubscription, SubscribeRequest, Subscription,
		SubscriptionStatus,
	},
};

use crate::{activity::ActivityRecorder, error::ApiError};

#[derive(Debug, Clone)]
pub struct CreateSubscription {
	pub connection_id: ConnectionId,
	pub resource_type: String,
	pub resource_id: String,
	pub callback_url: String,
	pub metadata: Map<String, Value>,
}

/// Remote change-notification subscriptions: create, renew ahead of expiry,
/// cancel, and route inbound channels back to their connection.
pub struct SubscriptionService {
	registry: Arc<ProviderRegistry>,
	stores: RuntimeStores,
	recorder: ActivityRecorder,
}

impl SubscriptionService {
	pub fn new(registry: Arc<ProviderRegistry>, stores: RuntimeStores) -> Arc<Self> {
		let recorder = ActivityRecorder::new(stores.activity.clone());
		Arc::new(Self { registry, stores, recorder })
	}

	#[instrument(skip(self, request), fields(connection_id = %request.connection_id))]
	pub async fn subscribe(&self, request: CreateSubscription) -> Result<Subscription, ApiError> {
		let connection = self.stores.connections.connection(&request.connection_id).await?;
		let provider = self.registry.get(&connection.provider_id)?;
		let operations = provider
			.subscriptions()
			.ok_or_else(|| subscription_unsupported(&connection.provider_id))?;

		let remote = operations
			.subscribe(SubscribeRequest {
				connection_id: request.connection_id.clone(),
				resource_type: request.resource_type.clone(),
				resource_id: request.resource_id.clone(),
				callback_url: request.callback_url.clone(),
				metadata: request.metadata.clone(),
			})
			.await?;

		let channel_id =
			remote.channel_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

		let subscription = self
			.stores
			.subscriptions
			.insert_subscription(NewSubscription {
				connection_id: request.connection_id.clone(),
				provider_id: connection.provider_id.clone(),
				resource_type: request.resource_type,
				resource_id: request.resource_id,
				channel_id,
				remote_subscription_id: Some(remote.remote_subscription_id),
				callback_url: request.callback_url,
				verification_token_ref: None,
				expires_at: remote.expires_at,
				metadata: request.metadata,
			})
			.await?;

		self.enqueue_event(
			events::SUBSCRIPTION_CREATED,
			&subscription,
			json!({
				"subscriptionId": subscription.id.as_str(),
				"channelId": subscription.channel_id,
				"resourceType": subscription.resource_type,
			}),
		)
		.await;

		self.recorder
			.record(
				NewServiceActivity::new(
					subscription.provider_id.clone(),
					connection.scope.clone(),
					"subscription.create",
					"subscription",
					subscription.id.as_str(),
				)
				.with_connection(request.connection_id),
			)
			.await;

		Ok(subscription)
	}

	/// Renew every active subscription expiring inside the window; returns
	/// how many were renewed. Individual failures are logged and skipped so
	/// one sick subscription cannot stall the sweep.
	#[instrument(skip(self))]
	pub async fn renew_expiring(&self, window: Duration) -> Result<usize, ApiError> {
		let horizon = Utc::now()
			+ chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
		let due = self.stores.subscriptions.expiring_subscriptions(horizon).await?;

		let mut renewed = 0;
		for subscription in due {
			match self.renew(&subscription).await {
				Ok(()) => renewed += 1,
				Err(error) => {
					warn!(?error, subscription_id = %subscription.id, "Subscription renewal failed")
				},
			}
		}
		Ok(renewed)
	}

	async fn renew(&self, subscription: &Subscription) -> Result<(), ApiError> {
		let provider = self.registry.get(&subscription.provider_id)?;
		let operations = provider
			.subscriptions()
			.ok_or_else(|| subscription_unsupported(&subscription.provider_id))?;

		let remote = operations.renew(subscription).await?;
		let updated = self
			.stores
			.subscriptions
			.renew_subscription(
				&subscription.id,
				Some(remote.remote_subscription_id),
				remote.expires_at,
			)
			.await?;

		self.enqueue_event(
			events::SUBSCRIPTION_RENEWED,
			&updated,
			json!({
				"subscriptionId": updated.id.as_str(),
				"expiresAt": updated.expires_at.map(|at| at.to_rfc3339()),
			}),
		)
		.await;

		Ok(())
	}

	#[instrument(skip(self))]
	pub async fn cancel(&self, subscription_id: &SubscriptionId) -> Result<Subscription, ApiError> {
		let subscription = self.stores.subscriptions.subscription(subscription_id).await?;
		let provider = self.registry.get(&subscription.provider_id)?;
		let operations = provider
			.subscriptions()
			.ok_or_else(|| subscription_unsupported(&subscription.provider_id))?;

		// Remote cancellation failures still cancel locally; the remote side
		// lapses at its own expiry
		if let Err(error) = operations.cancel(&subscription).await {
			warn!(?error, subscription_id = %subscription.id, "Remote cancel failed");
		}

		let updated = self
			.stores
			.subscriptions
			.update_subscription_status(subscription_id, SubscriptionStatus::Cancelled)
			.await?;

		self.enqueue_event(
			events::SUBSCRIPTION_CANCELLED,
			&updated,
			json!({"subscriptionId": updated.id.as_str()}),
		)
		.await;

		Ok(updated)
	}

	/// Webhook routing: resolve the owning subscription by `(provider,
	/// channel)` and opportunistically stamp `last_notified_at`
	pub async fn route_channel(
		&self,
		provider_id: &ProviderId,
		channel_id: &str,
	) -> Result<Option<Subscription>, ApiError> {
		let subscription =
			self.stores.subscriptions.subscription_by_channel(provider_id, channel_id).await?;

		if let Some(subscription) = &subscription {
			if let Err(error) =
				self.stores.subscriptions.mark_notified(&subscription.id, Utc::now()).await
			{
				warn!(?error, "Failed to stamp last_notified_at");
			}
		}

		Ok(subscription)
	}

	async fn enqueue_event(&self, name: &str, subscription: &Subscription, payload: Value) {
		let scope = match self.stores.connections.connection(&subscription.connection_id).await {
			Ok(connection) => connection.scope,
			Err(error) => {
				warn!(?error, "Subscription event without resolvable scope");
				return;
			},
		};

		let event = LifecycleEvent::new(
			name,
			subscription.provider_id.clone(),
			scope,
			Some(subscription.connection_id.clone()),
			payload,
		);
		if let Err(error) = self.stores.outbox.enqueue_event(event).await {
			warn!(?error, %name, "Failed to enqueue subscription event");
		}
	}
}

impl core::fmt::Debug for SubscriptionService {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("SubscriptionService").finish_non_exhaustive()
	}
}
