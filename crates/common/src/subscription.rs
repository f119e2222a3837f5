use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	errors::{codes, ServiceError},
	ids::{ConnectionId, ProviderId, SubscriptionId},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
	Active,
	Paused,
	Cancelled,
	Expired,
}

impl SubscriptionStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			SubscriptionStatus::Active => "active",
			SubscriptionStatus::Paused => "paused",
			SubscriptionStatus::Cancelled => "cancelled",
			SubscriptionStatus::Expired => "expired",
		}
	}
}

impl FromStr for SubscriptionStatus {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"active" => Ok(SubscriptionStatus::Active),
			"paused" => Ok(SubscriptionStatus::Paused),
			"cancelled" => Ok(SubscriptionStatus::Cancelled),
			"expired" => Ok(SubscriptionStatus::Expired),
			other => Err(ServiceError::validation(
				codes::INVALID_STATE_TRANSITION,
				format!("unknown subscription status {:?}", other),
			)),
		}
	}
}

/// A provider-side change notification channel. `(provider_id, channel_id)`
/// is unique among non-deleted rows and routes inbound webhooks back to the
/// owning connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Subscription {
	pub id: SubscriptionId,
	pub connection_id: ConnectionId,
	pub provider_id: ProviderId,
	pub resource_type: String,
	pub resource_id: String,
	pub channel_id: String,
	pub remote_subscription_id: Option<String>,
	pub callback_url: String,
	pub verification_token_ref: Option<String>,
	pub status: SubscriptionStatus,
	pub expires_at: Option<DateTime<Utc>>,
	/// Optimization only; never read for control flow
	pub last_notified_at: Option<DateTime<Utc>>,
	pub metadata: Map<String, Value>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
	pub connection_id: ConnectionId,
	pub provider_id: ProviderId,
	pub resource_type: String,
	pub resource_id: String,
	pub channel_id: String,
	pub remote_subscription_id: Option<String>,
	pub callback_url: String,
	pub verification_token_ref: Option<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub metadata: Map<String, Value>,
}

/// What a provider returns from a remote subscribe or renew call.
#[derive(Debug, Clone)]
pub struct RemoteSubscription {
	pub remote_subscription_id: String,
	pub channel_id: Option<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
	pub connection_id: ConnectionId,
	pub resource_type: String,
	pub resource_id: String,
	pub callback_url: String,
	pub metadata: Map<String, Value>,
}

/// Optional provider support for remote change subscriptions.
#[async_trait::async_trait]
pub trait SubscriptionOperations: Send + Sync {
	async fn subscribe(
		&self,
		request: SubscribeRequest,
	) -> Result<RemoteSubscription, ServiceError>;

	async fn renew(
		&self,
		subscription: &Subscription,
	) -> Result<RemoteSubscription, ServiceError>;

	async fn cancel(&self, subscription: &Subscription) -> Result<(), ServiceError>;
}

pub fn subscription_unsupported(provider_id: &ProviderId) -> ServiceError {
	ServiceError::config(
		codes::SUBSCRIPTION_UNSUPPORTED,
		format!("provider {} does not support subscriptions", provider_id),
	)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn status_round_trips_text_form() {
		for status in [
			SubscriptionStatus::Active,
			SubscriptionStatus::Paused,
			SubscriptionStatus::Cancelled,
			SubscriptionStatus::Expired,
		] {
			assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
		}
	}
}
