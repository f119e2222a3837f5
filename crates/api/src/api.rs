use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::{instrument, trace, warn};

use common::{
	activity::RetentionPolicy,
	provider::ProviderRegistry,
	store::RuntimeStores,
};
use tether_secrets::SecretProvider;

use crate::{
	activity::RetentionSweeper,
	commands::{ApiCommand, ApiResponse, ConnectionCommand, SyncCommand},
	connection::{ConnectRequest, ConnectionService, ConnectionServiceOptions},
	dispatch::{ApiDispatch, ApiSendWithReply},
	error::ApiError,
	sync::{BackfillRequest, BootstrapRequest, IncrementalRequest, SyncOrchestrator},
	webhook::{WebhookProcessor, WebhookProcessorOptions},
};

#[derive(Debug, Clone)]
pub struct ApiOptions {
	pub connection: ConnectionServiceOptions,
	pub webhook: WebhookProcessorOptions,
	pub retention: RetentionPolicy,
	pub retention_interval: Duration,
	pub purge_interval: Duration,
	pub command_buffer: usize,
}

impl Default for ApiOptions {
	fn default() -> Self {
		Self {
			connection: ConnectionServiceOptions::default(),
			webhook: WebhookProcessorOptions::default(),
			retention: RetentionPolicy::default(),
			retention_interval: Duration::from_secs(10 * 60),
			purge_interval: Duration::from_secs(60),
			command_buffer: 16,
		}
	}
}

/// The assembled runtime. Commands dispatched through [`ApiDispatch`] are
/// spawned one task each, so operations on distinct connections proceed in
/// parallel; per-connection ordering comes from the refresh lock and the
/// store's CAS primitives, not from the channel.
#[derive(Clone)]
pub struct Api {
	connections: Arc<ConnectionService>,
	sync: Arc<SyncOrchestrator>,
	webhooks: Arc<WebhookProcessor>,
}

impl core::fmt::Debug for Api {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Api").finish_non_exhaustive()
	}
}

impl Api {
	/// Wire the services, spawn the command loop and the background sweeps,
	/// and hand back a clonable dispatch handle alongside the api
	#[instrument(skip_all)]
	pub async fn new(
		registry: Arc<ProviderRegistry>,
		stores: RuntimeStores,
		secrets: Arc<dyn SecretProvider>,
		options: ApiOptions,
	) -> Result<(ApiDispatch, Api), ApiError> {
		let connections = ConnectionService::new(
			registry.clone(),
			stores.clone(),
			secrets,
			options.connection.clone(),
		);
		let sync = SyncOrchestrator::new(stores.clone());
		let webhooks =
			WebhookProcessor::new(registry, stores.clone(), options.webhook.clone());

		let api = Api { connections, sync, webhooks };

		let (tx, mut rx) = mpsc::channel::<ApiSendWithReply>(options.command_buffer);
		let dispatch = ApiDispatch { tx };

		let loop_api = api.clone();
		tokio::task::spawn(async move {
			while let Some((command, reply)) = rx.recv().await {
				trace!(?command, "Recv api command from channel");

				// One task per command; the loop never blocks on a slow
				// provider call
				let api = loop_api.clone();
				tokio::task::spawn(async move {
					let result = api.execute(command).await;
					reply
						.send(result)
						.await
						.map_err(|e| {
							warn!(?e, "Send reply to Api consumer failed");
						})
						.ok();
				});
			}
		});

		let sweeper = RetentionSweeper::new(
			stores.activity_pruner.clone(),
			options.retention,
			options.retention_interval,
		);
		tokio::task::spawn(sweeper.run());

		let purge_connections = api.connections.clone();
		let purge_interval = options.purge_interval;
		tokio::task::spawn(async move {
			let mut ticker = tokio::time::interval(purge_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				purge_connections.oauth_state().purge_expired();
				purge_connections.locker().purge_expired();
			}
		});

		Ok((dispatch, api))
	}

	pub fn connections(&self) -> &Arc<ConnectionService> {
		&self.connections
	}

	pub fn sync(&self) -> &Arc<SyncOrchestrator> {
		&self.sync
	}

	pub fn webhooks(&self) -> &Arc<WebhookProcessor> {
		&self.webhooks
	}

	async fn execute(&self, command: ApiCommand) -> Result<ApiResponse, ApiError> {
		match command {
			ApiCommand::Connection(command) => self.execute_connection(command).await,
			ApiCommand::Sync(command) => self.execute_sync(command).await,
		}
	}

	async fn execute_connection(
		&self,
		command: ConnectionCommand,
	) -> Result<ApiResponse, ApiError> {
		match command {
			ConnectionCommand::Connect {
				provider_id,
				scope,
				requested_grants,
				redirect_uri,
				metadata,
			} => {
				let started = self
					.connections
					.connect(ConnectRequest {
						provider_id,
						scope,
						requested_grants,
						redirect_uri,
						metadata,
					})
					.await?;
				Ok(ApiResponse::ConnectStarted {
					authorize_url: started.authorize_url,
					state: started.state,
				})
			},
			ConnectionCommand::CompleteCallback { code, state } => {
				let (connection, credential) =
					self.connections.complete_callback(&code, &state).await?;
				Ok(ApiResponse::Connected { connection, credential_version: credential.version })
			},
			ConnectionCommand::Refresh { connection_id } => {
				let outcome = self.connections.refresh(&connection_id).await?;
				Ok(ApiResponse::Refreshed {
					connection_id: outcome.connection_id,
					credential_version: outcome.credential_version,
					grant_event: outcome.grant_event,
				})
			},
			ConnectionCommand::Revoke { connection_id, reason } => {
				self.connections.revoke(&connection_id, &reason).await?;
				Ok(ApiResponse::unit())
			},
			ConnectionCommand::Suspend { connection_id } => {
				self.connections.suspend(&connection_id).await?;
				Ok(ApiResponse::unit())
			},
			ConnectionCommand::Reinstate { connection_id } => {
				self.connections.reinstate(&connection_id).await?;
				Ok(ApiResponse::unit())
			},
			ConnectionCommand::InvokeCapability { connection_id, capability } => {
				let decision =
					self.connections.invoke_capability(&connection_id, &capability).await?;
				Ok(ApiResponse::Capability { decision })
			},
		}
	}

	async fn execute_sync(&self, command: SyncCommand) -> Result<ApiResponse, ApiError> {
		match command {
			SyncCommand::StartBootstrap {
				connection_id,
				resource_type,
				resource_id,
				idempotency_key,
				requested_by,
				metadata,
			} => {
				let created = self
					.sync
					.start_bootstrap(BootstrapRequest {
						connection_id,
						resource_type,
						resource_id,
						idempotency_key,
						requested_by,
						metadata,
					})
					.await?;
				Ok(ApiResponse::sync_job(created.job, created.created))
			},
			SyncCommand::StartBackfill {
				connection_id,
				from,
				to,
				idempotency_key,
				requested_by,
				metadata,
			} => {
				let created = self
					.sync
					.start_backfill(BackfillRequest {
						connection_id,
						from,
						to,
						idempotency_key,
						requested_by,
						metadata,
					})
					.await?;
				Ok(ApiResponse::sync_job(created.job, created.created))
			},
			SyncCommand::StartIncremental {
				connection_id,
				idempotency_key,
				requested_by,
				metadata,
			} => {
				let created = self
					.sync
					.start_incremental(IncrementalRequest {
						connection_id,
						idempotency_key,
						requested_by,
						metadata,
					})
					.await?;
				Ok(ApiResponse::sync_job(created.job, created.created))
			},
			SyncCommand::SaveCheckpoint { job_id, checkpoint, metadata } => {
				let job = self.sync.save_checkpoint(&job_id, checkpoint, metadata).await?;
				Ok(ApiResponse::sync_job(job, false))
			},
			SyncCommand::Fail { job_id, error, next_attempt_at } => {
				let job = self.sync.fail(&job_id, &error, next_attempt_at).await?;
				Ok(ApiResponse::sync_job(job, false))
			},
			SyncCommand::Resume { job_id } => {
				let job = self.sync.resume(&job_id).await?;
				Ok(ApiResponse::sync_job(job, false))
			},
		}
	}
}
