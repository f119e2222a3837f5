use thiserror::Error;
use tokio::{sync::mpsc::error::SendError, task::JoinError};
use user_error::UFE;

use common::{
	errors::{codes, ServiceError, ToServiceError},
	store::StoreError,
};
use tether_secrets::SecretError;

use crate::dispatch::ApiSendWithReply;

#[derive(Error, Debug)]
pub enum ApiError {
	#[error("Storage: {0:?}")]
	Store(
		#[from]
		#[source]
		StoreError,
	),

	#[error("Service: {0}")]
	Service(
		#[from]
		#[source]
		ServiceError,
	),

	#[error("Secrets: {0}")]
	Secrets(
		#[from]
		#[source]
		SecretError,
	),

	#[error("Api shut down before reply")]
	ApiShutdownRx,

	#[error("Api shut down before send: {0}")]
	ApiShutdownTx(
		#[from]
		#[source]
		SendError<ApiSendWithReply>,
	),

	#[error("Blocking thread pool: {0}")]
	Join(
		#[from]
		#[source]
		JoinError,
	),
}

impl UFE for ApiError {}

impl ApiError {
	/// Whether the underlying failure carries the given stable text code
	pub fn has_code(&self, text_code: &str) -> bool {
		self.to_service_error().is(text_code)
	}
}

impl ToServiceError for ApiError {
	fn to_service_error(&self) -> ServiceError {
		match self {
			ApiError::Store(store) => store.to_service_error(),
			ApiError::Service(service) => service.clone(),
			ApiError::Secrets(secrets) => ServiceError::new(
				common::errors::ErrorCategory::Internal,
				codes::SECRET_PROVIDER_FAILED,
				secrets.to_string(),
			),
			other => ServiceError::internal(other.to_string()),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn service_errors_pass_through_unchanged() {
		let err: ApiError =
			ServiceError::conflict(codes::REFRESH_LOCKED, "locked for refresh").into();
		assert!(err.has_code(codes::REFRESH_LOCKED));
	}

	#[test]
	fn store_errors_classify() {
		let err: ApiError = StoreError::SyncCursorConflict.into();
		assert!(err.has_code(codes::SYNC_CURSOR_CONFLICT));
	}
}
