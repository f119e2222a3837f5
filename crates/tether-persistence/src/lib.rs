#![cfg_attr(feature = "strict", deny(warnings))]

use std::time::Duration;

use diesel::{
	prelude::*,
	r2d2::{ConnectionManager, Pool, PooledConnection},
	PgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::instrument;

pub use common::store::StoreError;

pub mod activity;
pub mod connection;
pub mod credential;
pub mod grants;
pub mod installation;
pub mod migrations;
pub mod outbox;
pub mod ratelimit;
pub mod rows;
pub mod schema;
pub mod subscription;
pub mod sync;
pub mod webhook;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

#[derive(Debug, Clone)]
pub struct StoreConfig {
	pub database_url: String,
	pub pool_size: u32,
	pub connection_timeout: Duration,
}

impl StoreConfig {
	pub fn new(database_url: impl Into<String>) -> Self {
		Self {
			database_url: database_url.into(),
			pool_size: 10,
			connection_timeout: Duration::from_secs(5),
		}
	}
}

/// The diesel/Postgres implementation behind every store contract. Clonable;
/// all clones share the pool.
#[derive(Clone)]
pub struct Store {
	pool: Pool<ConnectionManager<PgConnection>>,
}

impl core::fmt::Debug for Store {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Store").finish_non_exhaustive()
	}
}

impl Store {
	pub fn new(pool: Pool<ConnectionManager<PgConnection>>) -> Self {
		Self { pool }
	}

	/// Build a pooled store from configuration. Incomplete wiring is a
	/// `store_config_error`.
	#[instrument(skip(config), fields(pool_size = config.pool_size))]
	pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
		if config.database_url.trim().is_empty() {
			return Err(StoreError::Config("database url is not set".to_owned()));
		}
		if config.pool_size == 0 {
			return Err(StoreError::Config("pool size must be at least one".to_owned()));
		}

		let pool = Pool::builder()
			.max_size(config.pool_size)
			.connection_timeout(config.connection_timeout)
			.build(ConnectionManager::<PgConnection>::new(&config.database_url))
			.map_err(|e| StoreError::Pool(e.to_string()))?;

		Ok(Self::new(pool))
	}

	pub fn apply_migrations(&self) -> Result<(), StoreError> {
		let mut connection = self.connection()?;
		connection
			.run_pending_migrations(MIGRATIONS)
			.map(|_| ())
			.map_err(|e| StoreError::Db(e.to_string()))
	}

	pub(crate) fn connection(
		&self,
	) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
		Ok(self.pool.get()?)
	}

	/// Run blocking diesel work off the async executor. The closure gets its
	/// own clone of the store.
	pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
	where
		F: FnOnce(Store) -> Result<T, StoreError> + Send + 'static,
		T: Send + 'static,
	{
		let store = self.clone();
		tokio::task::spawn_blocking(move || f(store))
			.await
			.map_err(|e| StoreError::Db(format!("blocking task failed: {e}")))?
	}
}
