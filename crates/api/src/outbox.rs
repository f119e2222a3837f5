use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, instrument, warn};

use common::{
	errors::ServiceError,
	outbox::{NotificationDispatch, OutboxEntry},
	store::{NotificationDispatchLedger, OutboxStore},
};

use crate::{backoff, error::ApiError};

#[derive(Debug, Clone)]
pub struct OutboxDispatcherOptions {
	pub batch_size: usize,
	/// Re-claim lease on `processing` rows, covering crashed dispatchers
	pub lease: Duration,
	pub retry_backoff_base: Duration,
	pub max_attempts: i32,
	pub poll_interval: Duration,
}

impl Default for OutboxDispatcherOptions {
	fn default() -> Self {
		Self {
			batch_size: 32,
			lease: Duration::from_secs(30),
			retry_backoff_base: Duration::from_secs(30),
			max_attempts: 10,
			poll_interval: Duration::from_secs(5),
		}
	}
}

/// The downstream consumer of claimed lifecycle events. Delivery is
/// at-least-once; projectors dedupe through the dispatch ledger.
#[async_trait::async_trait]
pub trait EventProjector: Send + Sync {
	async fn project(&self, entry: &OutboxEntry) -> Result<(), ServiceError>;
}

/// Claims pending events in occurred-at order and drives them through the
/// projector, acking or scheduling retries.
pub struct OutboxDispatcher {
	outbox: Arc<dyn OutboxStore>,
	projector: Arc<dyn EventProjector>,
	options: OutboxDispatcherOptions,
}

impl OutboxDispatcher {
	pub fn new(
		outbox: Arc<dyn OutboxStore>,
		projector: Arc<dyn EventProjector>,
		options: OutboxDispatcherOptions,
	) -> Arc<Self> {
		Arc::new(Self { outbox, projector, options })
	}

	/// One claim-and-drain cycle; returns how many events were claimed
	#[instrument(skip(self))]
	pub async fn run_once(&self) -> Result<usize, ApiError> {
		let now = Utc::now();
		let batch =
			self.outbox.claim_event_batch(self.options.batch_size, now, self.options.lease).await?;
		let claimed = batch.len();

		for entry in batch {
			match self.projector.project(&entry).await {
				Ok(()) => {
					self.outbox.ack_event(&entry.event.id).await?;
				},
				Err(error) => {
					let attempts = entry.attempts + 1;
					// Past the attempt budget the row dead-ends as failed
					let next_attempt_at = if attempts >= self.options.max_attempts {
						None
					} else {
						let delay = backoff::exponential(
							self.options.retry_backoff_base,
							attempts as u32,
						);
						Some(
							now + chrono::Duration::from_std(delay)
								.unwrap_or_else(|_| chrono::Duration::hours(1)),
						)
					};

					let status = self
						.outbox
						.retry_event(&entry.event.id, &error.to_string(), next_attempt_at)
						.await?;
					debug!(event = %entry.event.name, ?status, "Event delivery retry scheduled");
				},
			}
		}

		Ok(claimed)
	}

	/// Poll until the surrounding task is dropped
	pub async fn run(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.options.poll_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			if let Err(error) = self.run_once().await {
				warn!(?error, "Outbox dispatch cycle failed");
			}
		}
	}
}

impl core::fmt::Debug for OutboxDispatcher {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("OutboxDispatcher").field("options", &self.options).finish_non_exhaustive()
	}
}

/// Suppresses duplicate projections of one event by one projector. `Ack` may
/// fail after external delivery succeeded, so re-claimed events reach the
/// projector again; the ledger makes that harmless.
pub struct DedupingProjector {
	ledger: Arc<dyn NotificationDispatchLedger>,
	inner: Arc<dyn EventProjector>,
	projector_name: String,
}

impl DedupingProjector {
	pub fn new(
		ledger: Arc<dyn NotificationDispatchLedger>,
		inner: Arc<dyn EventProjector>,
		projector_name: impl Into<String>,
	) -> Arc<Self> {
		Arc::new(Self { ledger, inner, projector_name: projector_name.into() })
	}

	fn idempotency_key(&self, entry: &OutboxEntry) -> String {
		format!("{}:{}", self.projector_name, entry.event.id)
	}
}

#[async_trait::async_trait]
impl EventProjector for DedupingProjector {
	async fn project(&self, entry: &OutboxEntry) -> Result<(), ServiceError> {
		let key = self.idempotency_key(entry);
		if self
			.ledger
			.dispatch_seen(&key)
			.await
			.map_err(|e| ServiceError::internal(e.to_string()))?
		{
			debug!(%key, "Duplicate projection suppressed");
			return Ok(());
		}

		self.inner.project(entry).await?;

		// Unique-violation on a concurrent record is a silent no-op
		self.ledger
			.record_dispatch(NotificationDispatch {
				event_id: entry.event.id.clone(),
				projector: self.projector_name.clone(),
				definition_code: entry.event.name.clone(),
				recipient_key: entry.event.scope.to_string(),
				idempotency_key: key,
				status: "delivered".to_owned(),
				error: None,
				metadata: serde_json::Map::new(),
				created_at: Utc::now(),
			})
			.await
			.map_err(|e| ServiceError::internal(e.to_string()))?;

		Ok(())
	}
}

impl core::fmt::Debug for DedupingProjector {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("DedupingProjector")
			.field("projector_name", &self.projector_name)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use parking_lot::Mutex;
	use serde_json::json;

	use common::{
		ids::ProviderId,
		outbox::{events, LifecycleEvent, OutboxStatus},
		scope::ScopeRef,
	};

	use crate::inmem::InMemStores;

	use super::*;

	struct CountingProjector {
		projected: AtomicUsize,
		failures: Mutex<usize>,
	}

	impl CountingProjector {
		fn new(failures: usize) -> Arc<Self> {
			Arc::new(Self { projected: AtomicUsize::new(0), failures: Mutex::new(failures) })
		}
	}

	#[async_trait::async_trait]
	impl EventProjector for CountingProjector {
		async fn project(&self, _entry: &OutboxEntry) -> Result<(), ServiceError> {
			let mut failures = self.failures.lock();
			if *failures > 0 {
				*failures -= 1;
				return Err(ServiceError::external("projector_down", "try later"));
			}
			self.projected.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	fn event(name: &str) -> LifecycleEvent {
		LifecycleEvent::new(
			name,
			ProviderId::from("github"),
			ScopeRef::new("user", "u1").unwrap(),
			None,
			json!({}),
		)
	}

	#[tokio::test]
	async fn enqueue_claim_ack_removes_from_further_claims() {
		let stores = InMemStores::new().stores();
		let projector = CountingProjector::new(0);
		let dispatcher = OutboxDispatcher::new(
			stores.outbox.clone(),
			projector.clone(),
			OutboxDispatcherOptions::default(),
		);

		let entry = stores.outbox.enqueue_event(event(events::CONNECTION_CONNECTED)).await.unwrap();
		assert_eq!(entry.status, OutboxStatus::Pending);

		assert_eq!(dispatcher.run_once().await.unwrap(), 1);
		assert_eq!(projector.projected.load(Ordering::SeqCst), 1);

		// The delivered event is gone from subsequent claims, and acking it
		// again stays harmless
		assert_eq!(dispatcher.run_once().await.unwrap(), 0);
		stores.outbox.ack_event(&entry.event.id).await.unwrap();
	}

	#[tokio::test]
	async fn failed_projection_retries_with_backoff_then_delivers() {
		let stores = InMemStores::new().stores();
		let projector = CountingProjector::new(1);
		let dispatcher = OutboxDispatcher::new(
			stores.outbox.clone(),
			projector.clone(),
			OutboxDispatcherOptions::default(),
		);

		stores.outbox.enqueue_event(event(events::CONNECTION_REFRESHED)).await.unwrap();

		assert_eq!(dispatcher.run_once().await.unwrap(), 1);
		assert_eq!(projector.projected.load(Ordering::SeqCst), 0);

		// The retry is scheduled in the future, so an immediate cycle claims
		// nothing
		assert_eq!(dispatcher.run_once().await.unwrap(), 0);

		// Force the retry due by claiming at a future instant
		let due = Utc::now() + chrono::Duration::hours(2);
		let batch = stores
			.outbox
			.claim_event_batch(10, due, Duration::from_secs(30))
			.await
			.unwrap();
		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].attempts, 1);
		assert_eq!(batch[0].event.metadata.get("attempts"), Some(&json!(1)));
	}

	#[tokio::test]
	async fn exhausted_retries_dead_end_as_failed() {
		let stores = InMemStores::new().stores();
		let entry = stores.outbox.enqueue_event(event(events::CONNECTION_REVOKED)).await.unwrap();

		// Terminal retry: no next attempt
		let status =
			stores.outbox.retry_event(&entry.event.id, "gone for good", None).await.unwrap();
		assert_eq!(status, OutboxStatus::Failed);

		let claimed = stores
			.outbox
			.claim_event_batch(10, Utc::now(), Duration::from_secs(30))
			.await
			.unwrap();
		assert!(claimed.is_empty());
	}

	#[tokio::test]
	async fn claims_follow_occurred_at_order() {
		let stores = InMemStores::new().stores();

		let mut first = event(events::CONNECTION_CONNECTED);
		first.occurred_at = Utc::now() - chrono::Duration::seconds(60);
		let mut second = event(events::CONNECTION_REFRESHED);
		second.occurred_at = Utc::now() - chrono::Duration::seconds(30);

		// Insert newest first to prove ordering comes from occurred_at
		stores.outbox.enqueue_event(second).await.unwrap();
		stores.outbox.enqueue_event(first).await.unwrap();

		let batch = stores
			.outbox
			.claim_event_batch(10, Utc::now(), Duration::from_secs(30))
			.await
			.unwrap();
		assert_eq!(batch.len(), 2);
		assert_eq!(batch[0].event.name, events::CONNECTION_CONNECTED);
		assert_eq!(batch[1].event.name, events::CONNECTION_REFRESHED);
	}

	#[tokio::test]
	async fn deduping_projector_suppresses_replays() {
		let stores = InMemStores::new().stores();
		let counting = CountingProjector::new(0);
		let deduping = DedupingProjector::new(
			stores.dispatches.clone(),
			counting.clone(),
			"notifications",
		);

		let entry = stores.outbox.enqueue_event(event(events::SUBSCRIPTION_RENEWED)).await.unwrap();
		let claimed = stores
			.outbox
			.claim_event_batch(1, Utc::now(), Duration::from_secs(30))
			.await
			.unwrap();

		// Ack may fail after delivery; the re-claimed event reaches the
		// projector again and must be suppressed
		deduping.project(&claimed[0]).await.unwrap();
		deduping.project(&claimed[0]).await.unwrap();
		assert_eq!(counting.projected.load(Ordering::SeqCst), 1);

		assert!(stores
			.dispatches
			.dispatch_seen(&format!("notifications:{}", entry.event.id))
			.await
			.unwrap());
	}
}
