use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Classification for every failure surfaced by the runtime. Adapters
/// translate provider-specific failures into this taxonomy, so callers only
/// ever pattern-match a small closed set.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
	Validation,
	Auth,
	Authz,
	Conflict,
	NotFound,
	RateLimited,
	External,
	Internal,
	Config,
}

impl ErrorCategory {
	/// The HTTP-ish numeric code used when a constructor does not override it
	pub fn default_code(self) -> u16 {
		match self {
			ErrorCategory::Validation => 400,
			ErrorCategory::Auth => 401,
			ErrorCategory::Authz => 403,
			ErrorCategory::Conflict => 409,
			ErrorCategory::NotFound => 404,
			ErrorCategory::RateLimited => 429,
			ErrorCategory::External => 502,
			ErrorCategory::Internal => 500,
			ErrorCategory::Config => 500,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ErrorCategory::Validation => "validation",
			ErrorCategory::Auth => "auth",
			ErrorCategory::Authz => "authz",
			ErrorCategory::Conflict => "conflict",
			ErrorCategory::NotFound => "not_found",
			ErrorCategory::RateLimited => "rate_limited",
			ErrorCategory::External => "external",
			ErrorCategory::Internal => "internal",
			ErrorCategory::Config => "config",
		}
	}
}

/// Stable text codes carried on [`ServiceError`]. These are wire contract,
/// not prose; callers match on them.
pub mod codes {
	pub const REFRESH_LOCKED: &str = "service_refresh_locked";
	pub const INVALID_STATE_TRANSITION: &str = "invalid_state_transition";
	pub const WEBHOOK_SIGNATURE_INVALID: &str = "webhook_signature_invalid";
	pub const WEBHOOK_MISSING_DELIVERY_ID: &str = "webhook_missing_delivery_id";
	pub const WEBHOOK_HANDLER_MISSING: &str = "webhook_handler_missing";
	pub const WEBHOOK_INVALID_CLAIM: &str = "webhook_invalid_claim";
	pub const STORE_CONFIG_ERROR: &str = "store_config_error";
	pub const SYNC_CURSOR_CONFLICT: &str = "sync_cursor_conflict";
	pub const RATE_LIMIT_THROTTLED: &str = "rate_limit_throttled";
	pub const RATE_LIMIT_STATE_NOT_FOUND: &str = "rate_limit_state_not_found";
	pub const PROVIDER_NOT_REGISTERED: &str = "provider_not_registered";
	pub const PROVIDER_ALREADY_REGISTERED: &str = "provider_already_registered";
	pub const PROVIDER_AUTH_FAILED: &str = "provider_auth_failed";
	pub const CAPABILITY_NOT_FOUND: &str = "capability_not_found";
	pub const SCOPE_TYPE_UNSUPPORTED: &str = "scope_type_unsupported";
	pub const OAUTH_STATE_INVALID: &str = "oauth_state_invalid";
	pub const CREDENTIAL_NOT_FOUND: &str = "credential_not_found";
	pub const CREDENTIAL_NOT_REFRESHABLE: &str = "credential_not_refreshable";
	pub const CONNECTION_NOT_FOUND: &str = "connection_not_found";
	pub const CONNECTION_NOT_ACTIVE: &str = "connection_not_active";
	pub const INVALID_PROVIDER_ID: &str = "invalid_provider_id";
	pub const INVALID_SCOPE_REF: &str = "invalid_scope_ref";
	pub const INVALID_GRANT_REQUEST: &str = "invalid_grant_request";
	pub const SECRET_PROVIDER_FAILED: &str = "secret_provider_failed";
	pub const SUBSCRIPTION_UNSUPPORTED: &str = "subscription_unsupported";
	pub const INTERNAL: &str = "internal_error";
}

/// The unified classified error surfaced across component boundaries.
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[error("{text_code}: {message}")]
pub struct ServiceError {
	pub category: ErrorCategory,
	pub code: u16,
	pub text_code: String,
	pub message: String,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub metadata: Map<String, Value>,
}

impl ServiceError {
	pub fn new(
		category: ErrorCategory,
		text_code: impl Into<String>,
		message: impl Into<String>,
	) -> Self {
		Self {
			category,
			code: category.default_code(),
			text_code: text_code.into(),
			message: message.into(),
			metadata: Map::new(),
		}
	}

	pub fn validation(text_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::Validation, text_code, message)
	}

	pub fn auth(text_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::Auth, text_code, message)
	}

	pub fn authz(text_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::Authz, text_code, message)
	}

	pub fn conflict(text_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::Conflict, text_code, message)
	}

	pub fn not_found(text_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::NotFound, text_code, message)
	}

	pub fn rate_limited(text_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::RateLimited, text_code, message)
	}

	pub fn external(text_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::External, text_code, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::Internal, codes::INTERNAL, message)
	}

	pub fn config(text_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::Config, text_code, message)
	}

	pub fn with_code(mut self, code: u16) -> Self {
		self.code = code;
		self
	}

	pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
		self.metadata.insert(key.into(), value);
		self
	}

	pub fn is(&self, text_code: &str) -> bool {
		self.text_code == text_code
	}
}

/// Boundary errors implement this so adapters can collapse any failure into
/// the taxonomy without knowing its concrete type.
pub trait ToServiceError {
	fn to_service_error(&self) -> ServiceError;
}

impl ToServiceError for ServiceError {
	fn to_service_error(&self) -> ServiceError {
		self.clone()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn categories_carry_default_codes() {
		assert_eq!(ErrorCategory::RateLimited.default_code(), 429);
		assert_eq!(
			ServiceError::conflict(codes::SYNC_CURSOR_CONFLICT, "cursor moved").code,
			409
		);
	}

	#[test]
	fn text_code_matching() {
		let err = ServiceError::conflict(codes::REFRESH_LOCKED, "locked for refresh");
		assert!(err.is(codes::REFRESH_LOCKED));
		assert!(err.to_string().contains("service_refresh_locked"));
	}

	#[test]
	fn serializes_category_as_snake_case() {
		let err = ServiceError::not_found(codes::CONNECTION_NOT_FOUND, "no such connection");
		let json = serde_json::to_value(&err).unwrap();
		assert_eq!(json["category"], "not_found");
		assert_eq!(json["code"], 404);
	}
}
