use std::{collections::BTreeMap, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	errors::{codes, ServiceError},
	ids::ProviderId,
};

/// Claim leases shorter than this make crash re-claims race the live
/// processor; non-positive leases coerce to it.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_ATTEMPTS: i32 = 8;

/// Path-style escaping for claim token and cache key segments. Preserves
/// `:` (segment separators are multi-character) and escapes the `|` claim
/// delimiter.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
	.remove(b'-')
	.remove(b'_')
	.remove(b'.')
	.remove(b'~')
	.remove(b':');

pub fn escape_segment(segment: &str) -> String {
	utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Well-known keys carried in inbound request metadata.
pub mod meta_keys {
	pub const DELIVERY_ID: &str = "delivery_id";
	pub const CHANNEL_ID: &str = "channel_id";
	pub const CONNECTION_ID: &str = "connection_id";
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDeliveryStatus {
	Pending,
	Processing,
	RetryReady,
	Processed,
	Dead,
}

impl WebhookDeliveryStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			WebhookDeliveryStatus::Pending => "pending",
			WebhookDeliveryStatus::Processing => "processing",
			WebhookDeliveryStatus::RetryReady => "retry_ready",
			WebhookDeliveryStatus::Processed => "processed",
			WebhookDeliveryStatus::Dead => "dead",
		}
	}
}

impl FromStr for WebhookDeliveryStatus {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pending" => Ok(WebhookDeliveryStatus::Pending),
			"processing" => Ok(WebhookDeliveryStatus::Processing),
			"retry_ready" => Ok(WebhookDeliveryStatus::RetryReady),
			"processed" => Ok(WebhookDeliveryStatus::Processed),
			"dead" => Ok(WebhookDeliveryStatus::Dead),
			other => Err(ServiceError::validation(
				codes::WEBHOOK_INVALID_CLAIM,
				format!("unknown delivery status {:?}", other),
			)),
		}
	}
}

/// One provider notification, retained indefinitely for audit.
/// `(provider_id, delivery_id)` is unique.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WebhookDelivery {
	pub provider_id: ProviderId,
	pub delivery_id: String,
	pub status: WebhookDeliveryStatus,
	pub attempts: i32,
	pub next_attempt_at: Option<DateTime<Utc>>,
	pub payload: Vec<u8>,
	pub last_error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// A live in-flight reservation on a delivery. The token encodes the
/// attempt that performed the claim, so ack/fail are conditional on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryClaim {
	pub provider_id: ProviderId,
	pub delivery_id: String,
	pub attempts: i32,
}

impl DeliveryClaim {
	pub fn token(&self) -> String {
		format!(
			"{}|{}|{}",
			escape_segment(self.provider_id.as_str()),
			escape_segment(&self.delivery_id),
			self.attempts
		)
	}

	pub fn parse(token: &str) -> Result<Self, ServiceError> {
		let invalid = || {
			ServiceError::validation(
				codes::WEBHOOK_INVALID_CLAIM,
				format!("claim token {:?} is malformed", token),
			)
		};

		let mut parts = token.split('|');
		let (provider, delivery, attempts) = match (
			parts.next(),
			parts.next(),
			parts.next(),
			parts.next(),
		) {
			(Some(provider), Some(delivery), Some(attempts), None) =>
				(provider, delivery, attempts),
			_ => return Err(invalid()),
		};

		let provider_id = percent_decode_str(provider)
			.decode_utf8()
			.map_err(|_| invalid())?
			.into_owned();
		let delivery_id = percent_decode_str(delivery)
			.decode_utf8()
			.map_err(|_| invalid())?
			.into_owned();
		let attempts: i32 = attempts.parse().map_err(|_| invalid())?;

		if provider_id.is_empty() || delivery_id.is_empty() || attempts < 1 {
			return Err(invalid());
		}

		Ok(Self { provider_id: ProviderId::from(provider_id.as_str()), delivery_id, attempts })
	}
}

impl core::fmt::Display for DeliveryClaim {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.write_str(&self.token())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundSurface {
	Webhook,
	Command,
	Interaction,
}

impl InboundSurface {
	pub fn as_str(self) -> &'static str {
		match self {
			InboundSurface::Webhook => "webhook",
			InboundSurface::Command => "command",
			InboundSurface::Interaction => "interaction",
		}
	}
}

/// An inbound provider notification as handed to the processor by the
/// transport glue.
#[derive(Debug, Clone)]
pub struct InboundRequest {
	pub provider_id: ProviderId,
	pub surface: InboundSurface,
	pub headers: BTreeMap<String, String>,
	pub body: Vec<u8>,
	pub metadata: Map<String, Value>,
}

impl InboundRequest {
	pub fn header(&self, name: &str) -> Option<&str> {
		let name = name.to_ascii_lowercase();
		self.headers
			.iter()
			.find(|(k, _)| k.to_ascii_lowercase() == name)
			.map(|(_, v)| v.as_str())
	}

	pub fn metadata_str(&self, key: &str) -> Option<&str> {
		self.metadata.get(key).and_then(Value::as_str)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundResult {
	pub accepted: bool,
	pub deduped: bool,
}

impl InboundResult {
	pub fn processed() -> Self {
		Self { accepted: true, deduped: false }
	}

	pub fn deduped() -> Self {
		Self { accepted: true, deduped: true }
	}
}

/// Per-provider inbound verification and delivery-id extraction.
pub trait WebhookTemplate: Send + Sync {
	/// Authenticate the request; failure must leave no ledger side effect
	fn verify(&self, request: &InboundRequest) -> Result<(), ServiceError>;

	/// The provider's unique redelivery-stable id for this notification
	fn delivery_id(&self, request: &InboundRequest) -> Option<String> {
		request.metadata_str(meta_keys::DELIVERY_ID).map(ToOwned::to_owned)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn claim_token_round_trips() {
		let claim = DeliveryClaim {
			provider_id: ProviderId::from("github"),
			delivery_id: "d1".to_owned(),
			attempts: 3,
		};
		assert_eq!(claim.token(), "github|d1|3");
		assert_eq!(DeliveryClaim::parse(&claim.token()).unwrap(), claim);
	}

	#[test]
	fn claim_token_escapes_the_delimiter() {
		let claim = DeliveryClaim {
			provider_id: ProviderId::from("github"),
			delivery_id: "evt|with|pipes".to_owned(),
			attempts: 1,
		};
		let token = claim.token();
		assert_eq!(token.matches('|').count(), 2);
		assert_eq!(DeliveryClaim::parse(&token).unwrap(), claim);
	}

	#[test]
	fn rejects_malformed_tokens() {
		assert!(DeliveryClaim::parse("github|d1").is_err());
		assert!(DeliveryClaim::parse("github|d1|zero").is_err());
		assert!(DeliveryClaim::parse("github|d1|0").is_err());
		assert!(DeliveryClaim::parse("github|d1|1|extra").is_err());
	}

	#[test]
	fn escape_preserves_colons() {
		assert_eq!(escape_segment("orders:read"), "orders:read");
		assert_eq!(escape_segment("a b/c"), "a%20b%2Fc");
	}
}
