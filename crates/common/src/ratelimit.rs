use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::{provider::TransportResponse, webhook::escape_segment};

/// Reserved keys under which derived throttle state is serialized inside
/// the metadata column.
pub const META_THROTTLED_UNTIL: &str = "_throttled_until";
pub const META_ATTEMPTS: &str = "_attempts";
pub const META_LAST_STATUS: &str = "_last_status";

const CACHE_KEY_PREFIX: &str = "go-services::ratelimit_state::v1";

/// Identifies one rate-limit bucket. Provider, scope type and bucket key
/// are case-normalized; the scope id preserves case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RateLimitKey {
	provider_id: String,
	scope_type: String,
	scope_id: String,
	bucket_key: String,
}

impl RateLimitKey {
	pub fn new(
		provider_id: impl AsRef<str>,
		scope_type: impl AsRef<str>,
		scope_id: impl AsRef<str>,
		bucket_key: impl AsRef<str>,
	) -> Self {
		Self {
			provider_id: provider_id.as_ref().trim().to_ascii_lowercase(),
			scope_type: scope_type.as_ref().trim().to_ascii_lowercase(),
			scope_id: scope_id.as_ref().trim().to_owned(),
			bucket_key: bucket_key.as_ref().trim().to_ascii_lowercase(),
		}
	}

	pub fn provider_id(&self) -> &str {
		&self.provider_id
	}

	pub fn scope_type(&self) -> &str {
		&self.scope_type
	}

	pub fn scope_id(&self) -> &str {
		&self.scope_id
	}

	pub fn bucket_key(&self) -> &str {
		&self.bucket_key
	}

	/// The stable cross-deployment cache key. Segments are path-escaped;
	/// the escape preserves `:`, and `::` remains the segment boundary.
	pub fn cache_key(&self) -> String {
		format!(
			"{}::{}::{}::{}::{}",
			CACHE_KEY_PREFIX,
			escape_segment(&self.provider_id),
			escape_segment(&self.scope_type),
			escape_segment(&self.scope_id),
			escape_segment(&self.bucket_key)
		)
	}
}

impl core::fmt::Display for RateLimitKey {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.write_str(&self.cache_key())
	}
}

/// Persisted throttle state for one bucket. `throttled_until`, `attempts`
/// and `last_status` round-trip through reserved metadata keys.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitState {
	pub key: RateLimitKey,
	pub limit: Option<i64>,
	pub remaining: Option<i64>,
	pub reset_at: Option<DateTime<Utc>>,
	pub retry_after: Option<Duration>,
	pub throttled_until: Option<DateTime<Utc>>,
	pub last_status: Option<u16>,
	pub attempts: i32,
	pub metadata: Map<String, Value>,
	pub updated_at: DateTime<Utc>,
}

impl RateLimitState {
	pub fn empty(key: RateLimitKey, now: DateTime<Utc>) -> Self {
		Self {
			key,
			limit: None,
			remaining: None,
			reset_at: None,
			retry_after: None,
			throttled_until: None,
			last_status: None,
			attempts: 0,
			metadata: Map::new(),
			updated_at: now,
		}
	}

	pub fn is_throttled_at(&self, now: DateTime<Utc>) -> bool {
		self.throttled_until.map(|until| until > now).unwrap_or(false)
	}

	/// Fold the derived throttle fields into the metadata map for storage
	pub fn to_stored_metadata(&self) -> Map<String, Value> {
		let mut metadata = self.metadata.clone();
		metadata.remove(META_THROTTLED_UNTIL);
		metadata.remove(META_ATTEMPTS);
		metadata.remove(META_LAST_STATUS);

		if let Some(until) = self.throttled_until {
			metadata.insert(META_THROTTLED_UNTIL.to_owned(), Value::String(until.to_rfc3339()));
		}
		if self.attempts > 0 {
			metadata.insert(META_ATTEMPTS.to_owned(), Value::from(self.attempts));
		}
		if let Some(status) = self.last_status {
			metadata.insert(META_LAST_STATUS.to_owned(), Value::from(status));
		}
		metadata
	}

	/// Rehydrate the derived fields from stored metadata
	pub fn apply_stored_metadata(&mut self, stored: Map<String, Value>) {
		self.throttled_until = stored
			.get(META_THROTTLED_UNTIL)
			.and_then(Value::as_str)
			.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
			.map(|t| t.with_timezone(&Utc));
		self.attempts = stored.get(META_ATTEMPTS).and_then(Value::as_i64).unwrap_or(0) as i32;
		self.last_status =
			stored.get(META_LAST_STATUS).and_then(Value::as_u64).map(|s| s as u16);

		self.metadata = stored;
		self.metadata.remove(META_THROTTLED_UNTIL);
		self.metadata.remove(META_ATTEMPTS);
		self.metadata.remove(META_LAST_STATUS);
	}
}

/// Rate-limit observations derived from one provider response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitMeta {
	pub status: u16,
	pub limit: Option<i64>,
	pub remaining: Option<i64>,
	pub reset_at: Option<DateTime<Utc>>,
	pub retry_after: Option<Duration>,
}

impl RateLimitMeta {
	/// Parse the conventional rate-limit headers. Providers with exotic
	/// header schemes override `normalize_api_response`.
	pub fn from_response(response: &TransportResponse) -> Self {
		let header_i64 =
			|name: &str| response.header(name).and_then(|v| v.trim().parse::<i64>().ok());

		let reset_at = header_i64("x-ratelimit-reset")
			.and_then(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0));

		let retry_after = response
			.header("retry-after")
			.and_then(|v| v.trim().parse::<i64>().ok())
			.filter(|secs| *secs >= 0)
			.map(Duration::seconds);

		Self {
			status: response.status,
			limit: header_i64("x-ratelimit-limit"),
			remaining: header_i64("x-ratelimit-remaining"),
			reset_at,
			retry_after,
		}
	}

	pub fn is_throttling_status(&self) -> bool {
		self.status == 429 || self.status == 503
	}
}
