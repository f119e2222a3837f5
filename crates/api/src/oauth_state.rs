use std::{
	collections::HashMap,
	time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{Map, Value};
use tracing::debug;

use common::{ids::ProviderId, scope::ScopeRef};

/// OAuth state tokens are single-use and expire quickly; ten minutes is the
/// contract ceiling.
pub const MAX_STATE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct StateRecord {
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub requested_grants: Vec<String>,
	pub redirect_uri: Option<String>,
	pub metadata: Map<String, Value>,
}

struct StateEntry {
	record: StateRecord,
	issued_at: Instant,
}

/// Process-local OAuth-state service. Tokens carry 128 bits of entropy, are
/// taken exactly once, and lapse after the TTL.
pub struct OAuthStateService {
	states: Mutex<HashMap<String, StateEntry>>,
	ttl: Duration,
}

impl OAuthStateService {
	pub fn new(ttl: Duration) -> Self {
		Self { states: Mutex::new(HashMap::new()), ttl: ttl.min(MAX_STATE_TTL) }
	}

	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	pub fn issue(&self, record: StateRecord) -> String {
		let mut bytes = [0u8; 16];
		rand::thread_rng().fill_bytes(&mut bytes);
		let token = hex::encode(bytes);

		self.states
			.lock()
			.insert(token.clone(), StateEntry { record, issued_at: Instant::now() });
		token
	}

	/// Single-use take; expired or unknown tokens yield nothing
	pub fn take(&self, token: &str) -> Option<StateRecord> {
		let mut states = self.states.lock();
		let entry = states.remove(token)?;
		if entry.issued_at.elapsed() > self.ttl {
			debug!("OAuth state expired before use");
			return None;
		}
		Some(entry.record)
	}

	/// Drop lapsed entries; returns how many were removed
	pub fn purge_expired(&self) -> usize {
		let mut states = self.states.lock();
		let before = states.len();
		let ttl = self.ttl;
		states.retain(|_, entry| entry.issued_at.elapsed() <= ttl);
		before - states.len()
	}

	pub fn len(&self) -> usize {
		self.states.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.states.lock().is_empty()
	}
}

impl core::fmt::Debug for OAuthStateService {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("OAuthStateService").field("ttl", &self.ttl).finish_non_exhaustive()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn record() -> StateRecord {
		StateRecord {
			provider_id: ProviderId::from("github"),
			scope: ScopeRef::new("user", "u1").unwrap(),
			requested_grants: vec!["repo:read".to_owned()],
			redirect_uri: None,
			metadata: Map::new(),
		}
	}

	#[test]
	fn tokens_are_single_use() {
		let service = OAuthStateService::new(Duration::from_secs(600));
		let token = service.issue(record());

		assert!(service.take(&token).is_some());
		assert!(service.take(&token).is_none());
	}

	#[test]
	fn tokens_are_unique_and_long() {
		let service = OAuthStateService::new(Duration::from_secs(600));
		let a = service.issue(record());
		let b = service.issue(record());
		assert_ne!(a, b);
		// 16 bytes hex encoded
		assert_eq!(a.len(), 32);
	}

	#[test]
	fn expired_tokens_are_rejected_and_purged() {
		let service = OAuthStateService::new(Duration::from_millis(0));
		let token = service.issue(record());

		std::thread::sleep(Duration::from_millis(5));
		assert!(service.take(&token).is_none());

		let other = service.issue(record());
		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(service.purge_expired(), 1);
		assert!(service.take(&other).is_none());
		assert!(service.is_empty());
	}

	#[test]
	fn ttl_is_clamped_to_the_contract_ceiling() {
		let service = OAuthStateService::new(Duration::from_secs(3600));
		assert_eq!(service.ttl(), MAX_STATE_TTL);
	}
}
