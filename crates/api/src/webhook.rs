use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use serde_json::json;

use common::{
	activity::{ActivityStatus, NewServiceActivity},
	connection::Connection,
	errors::{codes, ServiceError},
	ids::{ConnectionId, ProviderId},
	outbox::{events, LifecycleEvent},
	provider::ProviderRegistry,
	store::{
		ClaimDelivery, ConnectionStore, OutboxStore, RuntimeStores, SubscriptionStore,
		WebhookDeliveryLedger,
	},
	webhook::{
		meta_keys, DeliveryClaim, InboundRequest, InboundResult, WebhookDeliveryStatus,
		DEFAULT_CLAIM_LEASE, DEFAULT_MAX_ATTEMPTS,
	},
};

use crate::{activity::ActivityRecorder, backoff, error::ApiError};

#[derive(Debug, Clone)]
pub struct WebhookProcessorOptions {
	pub lease: Duration,
	pub max_attempts: i32,
	pub retry_backoff_base: Duration,
}

impl Default for WebhookProcessorOptions {
	fn default() -> Self {
		Self {
			lease: DEFAULT_CLAIM_LEASE,
			max_attempts: DEFAULT_MAX_ATTEMPTS,
			retry_backoff_base: Duration::from_secs(60),
		}
	}
}

/// Application callback invoked once per claimed delivery.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
	async fn handle(&self, request: &InboundRequest, claim: &DeliveryClaim)
		-> Result<(), ServiceError>;
}

/// Verifies, deduplicates, claims and dispatches inbound provider
/// notifications over the delivery ledger.
pub struct WebhookProcessor {
	registry: Arc<ProviderRegistry>,
	stores: RuntimeStores,
	recorder: ActivityRecorder,
	handlers: RwLock<BTreeMap<ProviderId, Arc<dyn InboundHandler>>>,
	options: WebhookProcessorOptions,
}

impl WebhookProcessor {
	pub fn new(
		registry: Arc<ProviderRegistry>,
		stores: RuntimeStores,
		options: WebhookProcessorOptions,
	) -> Arc<Self> {
		let recorder = ActivityRecorder::new(stores.activity.clone());
		Arc::new(Self {
			registry,
			stores,
			recorder,
			handlers: RwLock::new(BTreeMap::new()),
			options,
		})
	}

	fn ledger(&self) -> &Arc<dyn WebhookDeliveryLedger> {
		&self.stores.webhook_deliveries
	}

	pub fn register_handler(&self, provider_id: ProviderId, handler: Arc<dyn InboundHandler>) {
		self.handlers.write().insert(provider_id, handler);
	}

	pub async fn process(&self, request: InboundRequest) -> Result<InboundResult, ApiError> {
		self.process_at(request, Utc::now()).await
	}

	/// Verify → extract → claim → dispatch → complete/fail. A duplicate
	/// within the lease window returns deduped without invoking the handler.
	#[instrument(skip(self, request), fields(provider_id = %request.provider_id))]
	pub async fn process_at(
		&self,
		request: InboundRequest,
		now: DateTime<Utc>,
	) -> Result<InboundResult, ApiError> {
		let provider = self.registry.get(&request.provider_id)?;
		let template = provider.webhook().ok_or_else(|| {
			ServiceError::config(
				codes::PROVIDER_NOT_REGISTERED,
				format!("provider {} exposes no webhook template", request.provider_id),
			)
		})?;

		// Verification failure must leave no ledger side effect
		template.verify(&request)?;

		let delivery_id = template
			.delivery_id(&request)
			.filter(|id| !id.is_empty())
			.ok_or_else(|| {
				ServiceError::validation(
					codes::WEBHOOK_MISSING_DELIVERY_ID,
					"request carries no delivery id",
				)
			})?;

		let claim = self
			.ledger()
			.claim_delivery(ClaimDelivery {
				provider_id: request.provider_id.clone(),
				delivery_id: delivery_id.clone(),
				payload: request.body.clone(),
				lease: self.options.lease,
				now,
			})
			.await?;

		let Some(claim) = claim else {
			debug!(%delivery_id, "Duplicate delivery deduped");
			return Ok(InboundResult::deduped());
		};

		let handler = self.handlers.read().get(&request.provider_id).cloned();
		let Some(handler) = handler else {
			let error = ServiceError::config(
				codes::WEBHOOK_HANDLER_MISSING,
				format!("no handler registered for {}", request.provider_id),
			);
			// Release the claim back into retry so a later registration can
			// drain the delivery
			self.fail(&claim.token(), &error.to_string(), None, now).await?;
			return Err(error.into());
		};

		match handler.handle(&request, &claim).await {
			Ok(()) => {
				self.complete(&claim.token()).await?;
				Ok(InboundResult::processed())
			},
			Err(error) => {
				let status = self.fail(&claim.token(), &error.to_string(), None, now).await?;
				if status == Some(WebhookDeliveryStatus::Dead) {
					warn!(%delivery_id, "Delivery dead-lettered");
					self.emit_dead_letter(&request, &delivery_id, &error).await;
				}
				Err(error.into())
			},
		}
	}

	/// Mark the claimed attempt processed. Conditional on the claim still
	/// being live; a stale claim is logged and dropped.
	#[instrument(skip(self))]
	pub async fn complete(&self, claim_token: &str) -> Result<(), ApiError> {
		let claim = DeliveryClaim::parse(claim_token)?;
		if !self.ledger().complete_delivery(&claim).await? {
			debug!(%claim, "Complete on a stale claim ignored");
		}
		Ok(())
	}

	/// Schedule a retry for the claimed attempt, dead-lettering once the
	/// attempt budget is spent. `next_attempt_at` defaults to exponential
	/// backoff on the attempt number.
	#[instrument(skip(self, error))]
	pub async fn fail(
		&self,
		claim_token: &str,
		error: &str,
		next_attempt_at: Option<DateTime<Utc>>,
		now: DateTime<Utc>,
	) -> Result<Option<WebhookDeliveryStatus>, ApiError> {
		let claim = DeliveryClaim::parse(claim_token)?;
		let next_attempt_at = next_attempt_at.unwrap_or_else(|| {
			let delay =
				backoff::exponential(self.options.retry_backoff_base, claim.attempts as u32);
			now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
		});

		Ok(self
			.ledger()
			.fail_delivery(&claim, error, next_attempt_at, self.options.max_attempts)
			.await?)
	}

	/// Resolve the owning connection and surface the dead-lettered delivery
	/// downstream. Resolution is best effort; a delivery that routes to no
	/// connection is only logged.
	async fn emit_dead_letter(
		&self,
		request: &InboundRequest,
		delivery_id: &str,
		error: &ServiceError,
	) {
		let Some(connection) = self.resolve_connection(request).await else {
			warn!(%delivery_id, "Dead-lettered delivery has no resolvable connection");
			return;
		};

		let event = LifecycleEvent::new(
			events::WEBHOOK_DEAD_LETTERED,
			connection.provider_id.clone(),
			connection.scope.clone(),
			Some(connection.id.clone()),
			json!({
				"deliveryId": delivery_id,
				"error": error.to_string(),
			}),
		);
		if let Err(enqueue_error) = self.stores.outbox.enqueue_event(event).await {
			warn!(?enqueue_error, "Failed to enqueue dead-letter event");
		}

		self.recorder
			.record(
				NewServiceActivity::new(
					connection.provider_id.clone(),
					connection.scope.clone(),
					"webhook.dead_letter",
					"webhook_delivery",
					delivery_id,
				)
				.with_connection(connection.id)
				.with_status(ActivityStatus::Error),
			)
			.await;
	}

	async fn resolve_connection(&self, request: &InboundRequest) -> Option<Connection> {
		if let Some(connection_id) = request.metadata_str(meta_keys::CONNECTION_ID) {
			if let Ok(connection) =
				self.stores.connections.connection(&ConnectionId::from(connection_id)).await
			{
				return Some(connection);
			}
		}

		let channel_id = request.metadata_str(meta_keys::CHANNEL_ID)?;
		let subscription = self
			.stores
			.subscriptions
			.subscription_by_channel(&request.provider_id, channel_id)
			.await
			.ok()
			.flatten()?;
		self.stores.connections.connection(&subscription.connection_id).await.ok()
	}
}

impl core::fmt::Debug for WebhookProcessor {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("WebhookProcessor").field("options", &self.options).finish_non_exhaustive()
	}
}
