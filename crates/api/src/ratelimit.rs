use std::{num::NonZeroUsize, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument};

use common::{
	errors::{codes, ServiceError},
	ratelimit::{RateLimitKey, RateLimitMeta, RateLimitState},
	store::{RateLimitStateStore, StoreError},
};

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct RateLimitPolicyOptions {
	/// Applied on 429/503 when the response carried no Retry-After and the
	/// provider declared no default
	pub fallback_retry_after: Duration,
}

impl Default for RateLimitPolicyOptions {
	fn default() -> Self {
		Self { fallback_retry_after: Duration::seconds(60) }
	}
}

pub fn throttled_error(retry_after: Duration) -> ServiceError {
	ServiceError::rate_limited(
		codes::RATE_LIMIT_THROTTLED,
		format!("bucket is throttled for another {}s", retry_after.num_seconds().max(0)),
	)
	.with_metadata("retry_after_seconds".to_owned(), Value::from(retry_after.num_seconds().max(0)))
}

/// Adaptive pre-call gate and post-call update over persisted bucket state.
pub struct RateLimitPolicy {
	store: Arc<dyn RateLimitStateStore>,
	options: RateLimitPolicyOptions,
}

impl RateLimitPolicy {
	pub fn new(store: Arc<dyn RateLimitStateStore>, options: RateLimitPolicyOptions) -> Arc<Self> {
		Arc::new(Self { store, options })
	}

	pub async fn before_call(&self, key: &RateLimitKey) -> Result<(), ApiError> {
		self.before_call_at(key, Utc::now()).await
	}

	/// Returns `rate_limit_throttled` while the bucket's prohibition is in
	/// force; an unobserved bucket passes
	#[instrument(skip(self), fields(key = %key))]
	pub async fn before_call_at(
		&self,
		key: &RateLimitKey,
		now: DateTime<Utc>,
	) -> Result<(), ApiError> {
		let state = match self.store.rate_limit_state(key).await {
			Ok(state) => state,
			Err(StoreError::StateNotFound) => return Ok(()),
			Err(other) => return Err(other.into()),
		};

		if let Some(until) = state.throttled_until {
			if until > now {
				return Err(throttled_error(until - now).into());
			}
		}
		Ok(())
	}

	pub async fn after_call(
		&self,
		key: &RateLimitKey,
		meta: &RateLimitMeta,
		provider_default_retry: Option<Duration>,
	) -> Result<RateLimitState, ApiError> {
		self.after_call_at(key, meta, provider_default_retry, Utc::now()).await
	}

	/// Fold one response observation into the bucket: success clears the
	/// throttle, 429/503 arms it from the Retry-After header, the provider
	/// default, or exponential backoff on prior attempts
	#[instrument(skip(self, meta), fields(key = %key, status = meta.status))]
	pub async fn after_call_at(
		&self,
		key: &RateLimitKey,
		meta: &RateLimitMeta,
		provider_default_retry: Option<Duration>,
		now: DateTime<Utc>,
	) -> Result<RateLimitState, ApiError> {
		let mut state = match self.store.rate_limit_state(key).await {
			Ok(state) => state,
			Err(StoreError::StateNotFound) => RateLimitState::empty(key.clone(), now),
			Err(other) => return Err(other.into()),
		};

		state.limit = meta.limit.or(state.limit);
		state.remaining = meta.remaining;
		state.reset_at = meta.reset_at.or(state.reset_at);
		state.last_status = Some(meta.status);
		state.updated_at = now;

		if meta.is_throttling_status() {
			let retry_after = meta
				.retry_after
				.or(provider_default_retry)
				.unwrap_or_else(|| {
					let exponent = state.attempts.clamp(0, 20) as u32;
					self.options.fallback_retry_after * 2i32.pow(exponent)
				});

			state.retry_after = Some(retry_after);
			state.throttled_until = Some(now + retry_after);
			state.attempts += 1;
			debug!(retry_after_seconds = retry_after.num_seconds(), "Bucket throttled");
		} else if (200..300).contains(&(meta.status as i32)) {
			state.retry_after = None;
			state.throttled_until = None;
			state.attempts = 0;
		}

		self.store.upsert_rate_limit_state(state.clone()).await?;
		Ok(state)
	}
}

impl core::fmt::Debug for RateLimitPolicy {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("RateLimitPolicy").field("options", &self.options).finish_non_exhaustive()
	}
}

/// Read-through cache over a state store, invalidated on every write. Cache
/// keys are the stable contract keys, so structurally equal lookups hit
/// regardless of case or whitespace variation on ingress.
pub struct CachedRateLimitStateStore {
	inner: Arc<dyn RateLimitStateStore>,
	cache: Mutex<LruCache<String, RateLimitState>>,
}

impl CachedRateLimitStateStore {
	pub fn new(inner: Arc<dyn RateLimitStateStore>, capacity: usize) -> Arc<Self> {
		let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero cache capacity");
		Arc::new(Self { inner, cache: Mutex::new(LruCache::new(capacity)) })
	}
}

#[async_trait::async_trait]
impl RateLimitStateStore for CachedRateLimitStateStore {
	async fn rate_limit_state(&self, key: &RateLimitKey) -> Result<RateLimitState, StoreError> {
		let cache_key = key.cache_key();
		if let Some(state) = self.cache.lock().get(&cache_key).cloned() {
			return Ok(state);
		}

		// Absence is never cached; a later upsert must become visible
		let state = self.inner.rate_limit_state(key).await?;
		self.cache.lock().put(cache_key, state.clone());
		Ok(state)
	}

	async fn upsert_rate_limit_state(&self, state: RateLimitState) -> Result<(), StoreError> {
		let cache_key = state.key.cache_key();
		self.inner.upsert_rate_limit_state(state.clone()).await?;
		self.cache.lock().put(cache_key, state);
		Ok(())
	}
}

impl core::fmt::Debug for CachedRateLimitStateStore {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("CachedRateLimitStateStore").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod test {
	use std::collections::BTreeMap;

	use common::provider::TransportResponse;

	use crate::inmem::InMemStores;

	use super::*;

	fn policy() -> (Arc<RateLimitPolicy>, Arc<dyn RateLimitStateStore>) {
		let stores = InMemStores::new().stores();
		let store = stores.rate_limits.clone();
		(RateLimitPolicy::new(store.clone(), RateLimitPolicyOptions::default()), store)
	}

	fn key() -> RateLimitKey {
		RateLimitKey::new("github", "user", "u1", "core")
	}

	fn response(status: u16, retry_after: Option<&str>) -> RateLimitMeta {
		let mut headers = BTreeMap::new();
		headers.insert("X-RateLimit-Limit".to_owned(), "5000".to_owned());
		headers.insert("X-RateLimit-Remaining".to_owned(), "12".to_owned());
		if let Some(retry_after) = retry_after {
			headers.insert("Retry-After".to_owned(), retry_after.to_owned());
		}
		RateLimitMeta::from_response(&TransportResponse { status, headers, body: vec![] })
	}

	#[tokio::test]
	async fn unobserved_bucket_passes() {
		let (policy, _) = policy();
		policy.before_call(&key()).await.unwrap();
	}

	#[tokio::test]
	async fn throttle_arms_from_retry_after_and_clears_on_success() {
		let (policy, _) = policy();
		let now = Utc::now();

		let state = policy.after_call_at(&key(), &response(429, Some("17")), None, now)
			.await
			.unwrap();
		assert_eq!(state.attempts, 1);
		assert_eq!(state.throttled_until, Some(now + Duration::seconds(17)));

		let err = policy.before_call_at(&key(), now + Duration::seconds(1)).await.unwrap_err();
		assert!(err.has_code(codes::RATE_LIMIT_THROTTLED));

		// Past the prohibition instant the gate opens again
		policy.before_call_at(&key(), now + Duration::seconds(18)).await.unwrap();

		let state = policy
			.after_call_at(&key(), &response(200, None), None, now + Duration::seconds(20))
			.await
			.unwrap();
		assert_eq!(state.attempts, 0);
		assert!(state.throttled_until.is_none());
		assert_eq!(state.last_status, Some(200));
	}

	#[tokio::test]
	async fn missing_retry_after_falls_back_to_provider_then_exponential() {
		let (policy, _) = policy();
		let now = Utc::now();

		// Provider default wins when the header is absent
		let state = policy
			.after_call_at(&key(), &response(503, None), Some(Duration::seconds(90)), now)
			.await
			.unwrap();
		assert_eq!(state.throttled_until, Some(now + Duration::seconds(90)));

		// Without either, backoff doubles on prior attempts
		let state = policy
			.after_call_at(&key(), &response(429, None), None, now)
			.await
			.unwrap();
		assert_eq!(state.attempts, 2);
		assert_eq!(state.throttled_until, Some(now + Duration::seconds(120)));
	}

	#[tokio::test]
	async fn key_normalization_makes_lookups_structurally_equal() {
		let (policy, store) = policy();
		let now = Utc::now();

		policy
			.after_call_at(
				&RateLimitKey::new(" GitHub ", "USER", "u1", " Core "),
				&response(429, Some("30")),
				None,
				now,
			)
			.await
			.unwrap();

		let state = store.rate_limit_state(&key()).await.unwrap();
		assert!(state.is_throttled_at(now));
	}

	#[tokio::test]
	async fn cached_store_serves_reads_and_invalidates_on_write() {
		let stores = InMemStores::new().stores();
		let cached = CachedRateLimitStateStore::new(stores.rate_limits.clone(), 64);

		assert!(matches!(
			cached.rate_limit_state(&key()).await,
			Err(StoreError::StateNotFound)
		));

		let now = Utc::now();
		let mut state = RateLimitState::empty(key(), now);
		state.attempts = 3;
		cached.upsert_rate_limit_state(state.clone()).await.unwrap();

		// Read-through after write sees the new value
		let read = cached.rate_limit_state(&key()).await.unwrap();
		assert_eq!(read.attempts, 3);

		state.attempts = 4;
		cached.upsert_rate_limit_state(state).await.unwrap();
		assert_eq!(cached.rate_limit_state(&key()).await.unwrap().attempts, 4);
	}
}
