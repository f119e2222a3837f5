use tracing::subscriber::set_global_default;
use tracing_log::{log::LevelFilter, LogTracer};

use tracing_subscriber::{prelude::*, EnvFilter, Registry};

#[derive(Debug, Clone, Copy)]
pub enum ConsoleLogging {
	Off,
	Pretty,
	Json,
}

macro_rules! stdio_layer {
	() => {
		tracing_subscriber::fmt::layer()
			.with_level(true)
			.with_target(true)
			.with_thread_ids(true)
	};
}

/// Install the global subscriber. Filtering comes from `RUST_LOG`, falling
/// back to `error`.
pub fn telemetry(console_logging: ConsoleLogging) {
	LogTracer::init_with_filter(LevelFilter::Trace).ok();

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error"));
	match console_logging {
		ConsoleLogging::Json =>
			set_global_default(Registry::default().with(env_filter).with(stdio_layer!().json())),
		ConsoleLogging::Pretty =>
			set_global_default(Registry::default().with(env_filter).with(stdio_layer!().pretty())),
		ConsoleLogging::Off => set_global_default(Registry::default().with(env_filter)),
	}
	.map_err(|e| eprintln!("Failed to set global default subscriber: {:?}", e))
	.ok();
}
