use std::sync::Arc;

use serde_json::json;
use tracing::{instrument, warn};

use common::{
	activity::NewServiceActivity,
	ids::ProviderId,
	installation::{Installation, InstallationStatus, UpsertInstallation},
	outbox::{events, LifecycleEvent},
	scope::ScopeRef,
	store::{InstallationStore, OutboxStore, RuntimeStores},
};

use crate::{activity::ActivityRecorder, error::ApiError};

/// Org-level install lifecycle. Upsert is the only path that reinstates a
/// suspended install; `update_status` walks the validated transition graph.
pub struct InstallationService {
	stores: RuntimeStores,
	recorder: ActivityRecorder,
}

impl InstallationService {
	pub fn new(stores: RuntimeStores) -> Arc<Self> {
		let recorder = ActivityRecorder::new(stores.activity.clone());
		Arc::new(Self { stores, recorder })
	}

	#[instrument(skip(self, upsert), fields(provider_id = %upsert.provider_id))]
	pub async fn upsert(&self, upsert: UpsertInstallation) -> Result<Installation, ApiError> {
		let prior = self
			.stores
			.installations
			.installation(&upsert.provider_id, &upsert.scope)
			.await?
			.map(|installation| installation.status);

		let installation = self.stores.installations.upsert_installation(upsert).await?;

		if prior != Some(installation.status) {
			self.emit_status_change(&installation, prior).await;
		}

		self.recorder
			.record(NewServiceActivity::new(
				installation.provider_id.clone(),
				installation.scope.clone(),
				"installation.upsert",
				"installation",
				installation.id.as_str(),
			))
			.await;

		Ok(installation)
	}

	#[instrument(skip(self))]
	pub async fn update_status(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
		status: InstallationStatus,
	) -> Result<Installation, ApiError> {
		let prior = self
			.stores
			.installations
			.installation(provider_id, scope)
			.await?
			.map(|installation| installation.status);

		let installation =
			self.stores.installations.update_installation_status(provider_id, scope, status).await?;

		self.emit_status_change(&installation, prior).await;

		self.recorder
			.record(NewServiceActivity::new(
				installation.provider_id.clone(),
				installation.scope.clone(),
				"installation.update_status",
				"installation",
				installation.id.as_str(),
			))
			.await;

		Ok(installation)
	}

	pub async fn get(
		&self,
		provider_id: &ProviderId,
		scope: &ScopeRef,
	) -> Result<Option<Installation>, ApiError> {
		Ok(self.stores.installations.installation(provider_id, scope).await?)
	}

	async fn emit_status_change(
		&self,
		installation: &Installation,
		prior: Option<InstallationStatus>,
	) {
		let event = LifecycleEvent::new(
			events::INSTALLATION_STATUS_CHANGED,
			installation.provider_id.clone(),
			installation.scope.clone(),
			None,
			json!({
				"installationId": installation.id.as_str(),
				"priorStatus": prior.map(|status| status.as_str()),
				"newStatus": installation.status.as_str(),
			}),
		);
		if let Err(error) = self.stores.outbox.enqueue_event(event).await {
			warn!(?error, "Failed to enqueue installation event");
		}
	}
}

impl core::fmt::Debug for InstallationService {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("InstallationService").finish_non_exhaustive()
	}
}
