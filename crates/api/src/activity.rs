use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, instrument, warn};

use common::{
	activity::{NewServiceActivity, RetentionPolicy},
	store::{ActivityRetentionPruner, ServicesActivitySink},
};

/// Best-effort audit recording. A failed audit write is logged, never
/// propagated; audit must not take the operation down with it.
#[derive(Clone)]
pub struct ActivityRecorder {
	sink: Arc<dyn ServicesActivitySink>,
}

impl ActivityRecorder {
	pub fn new(sink: Arc<dyn ServicesActivitySink>) -> Self {
		Self { sink }
	}

	pub async fn record(&self, activity: NewServiceActivity) {
		let action = activity.action.clone();
		if let Err(error) = self.sink.record_activity(activity).await {
			warn!(?error, %action, "Activity record failed");
		}
	}
}

impl core::fmt::Debug for ActivityRecorder {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("ActivityRecorder").finish_non_exhaustive()
	}
}

/// Asynchronous retention sweep over the activity ledger.
pub struct RetentionSweeper {
	pruner: Arc<dyn ActivityRetentionPruner>,
	policy: RetentionPolicy,
	interval: Duration,
}

impl RetentionSweeper {
	pub fn new(
		pruner: Arc<dyn ActivityRetentionPruner>,
		policy: RetentionPolicy,
		interval: Duration,
	) -> Self {
		Self { pruner, policy, interval }
	}

	#[instrument(skip(self))]
	pub async fn sweep_once(&self) -> u64 {
		match self.pruner.prune_activity(&self.policy, Utc::now()).await {
			Ok(deleted) => {
				debug!(deleted, "Activity retention sweep");
				deleted
			},
			Err(error) => {
				warn!(?error, "Activity retention sweep failed");
				0
			},
		}
	}

	/// Run until the surrounding task is dropped
	pub async fn run(self) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			self.sweep_once().await;
		}
	}
}

impl core::fmt::Debug for RetentionSweeper {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("RetentionSweeper")
			.field("policy", &self.policy)
			.field("interval", &self.interval)
			.finish_non_exhaustive()
	}
}
