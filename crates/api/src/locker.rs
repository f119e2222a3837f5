use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use common::{
	errors::{codes, ServiceError},
	ids::ConnectionId,
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

struct LockEntry {
	owner: u64,
	expires_at: Instant,
}

/// Keyed mutex map serializing credential refreshes per connection. The lock
/// must survive across the refresh HTTP call, so it is held by token rather
/// than by guard borrow; expiry reclaims locks from crashed holders.
pub struct ConnectionLocker {
	locks: Mutex<HashMap<ConnectionId, LockEntry>>,
	timeout: Duration,
	counter: AtomicU64,
}

impl ConnectionLocker {
	pub fn new(timeout: Duration) -> Arc<Self> {
		let timeout = if timeout.is_zero() { DEFAULT_LOCK_TIMEOUT } else { timeout };
		Arc::new(Self { locks: Mutex::new(HashMap::new()), timeout, counter: AtomicU64::new(1) })
	}

	/// Atomic acquire; losers fail immediately with `service_refresh_locked`
	pub fn try_acquire(
		self: &Arc<Self>,
		connection_id: &ConnectionId,
	) -> Result<RefreshLock, ServiceError> {
		let owner = self.counter.fetch_add(1, Ordering::Relaxed);
		let now = Instant::now();

		let mut locks = self.locks.lock();
		match locks.get(connection_id) {
			Some(entry) if entry.expires_at > now =>
				return Err(ServiceError::conflict(
					codes::REFRESH_LOCKED,
					format!("connection {} is locked for refresh", connection_id),
				)),
			Some(_) => {
				warn!(%connection_id, "Reclaiming expired refresh lock");
			},
			None => {},
		}

		locks.insert(
			connection_id.clone(),
			LockEntry { owner, expires_at: now + self.timeout },
		);

		Ok(RefreshLock { locker: Arc::clone(self), connection_id: connection_id.clone(), owner })
	}

	/// Drop lapsed locks; returns how many were removed
	pub fn purge_expired(&self) -> usize {
		let now = Instant::now();
		let mut locks = self.locks.lock();
		let before = locks.len();
		locks.retain(|_, entry| entry.expires_at > now);
		before - locks.len()
	}

	fn release(&self, connection_id: &ConnectionId, owner: u64) {
		let mut locks = self.locks.lock();
		if locks.get(connection_id).map(|entry| entry.owner) == Some(owner) {
			locks.remove(connection_id);
		} else {
			debug!(%connection_id, "Refresh lock already reclaimed; skipping release");
		}
	}
}

impl core::fmt::Debug for ConnectionLocker {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("ConnectionLocker").field("timeout", &self.timeout).finish_non_exhaustive()
	}
}

/// Held for the duration of one refresh critical section. Released on drop,
/// success or error alike; expiry covers the crashed-holder case.
#[derive(Debug)]
pub struct RefreshLock {
	locker: Arc<ConnectionLocker>,
	connection_id: ConnectionId,
	owner: u64,
}

impl Drop for RefreshLock {
	fn drop(&mut self) {
		self.locker.release(&self.connection_id, self.owner);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn second_acquire_loses() {
		let locker = ConnectionLocker::new(Duration::from_secs(30));
		let id = ConnectionId::from("conn_1");

		let _held = locker.try_acquire(&id).unwrap();
		let err = locker.try_acquire(&id).unwrap_err();
		assert!(err.is(codes::REFRESH_LOCKED));
	}

	#[test]
	fn release_on_drop_allows_reacquire() {
		let locker = ConnectionLocker::new(Duration::from_secs(30));
		let id = ConnectionId::from("conn_1");

		drop(locker.try_acquire(&id).unwrap());
		assert!(locker.try_acquire(&id).is_ok());
	}

	#[test]
	fn distinct_connections_do_not_contend() {
		let locker = ConnectionLocker::new(Duration::from_secs(30));
		let _a = locker.try_acquire(&ConnectionId::from("conn_1")).unwrap();
		let _b = locker.try_acquire(&ConnectionId::from("conn_2")).unwrap();
	}

	#[test]
	fn expired_locks_are_reclaimable() {
		let locker = ConnectionLocker::new(Duration::from_millis(1));
		let id = ConnectionId::from("conn_1");

		let first = locker.try_acquire(&id).unwrap();
		std::thread::sleep(Duration::from_millis(5));

		// The crashed holder's lock lapsed, so a new owner may claim it
		let _second = locker.try_acquire(&id).unwrap();

		// The stale guard's release must not evict the new owner
		drop(first);
		assert!(locker.try_acquire(&id).is_err());
	}

	#[test]
	fn purge_drops_lapsed_entries() {
		let locker = ConnectionLocker::new(Duration::from_millis(1));
		let lock = locker.try_acquire(&ConnectionId::from("conn_1")).unwrap();
		std::mem::forget(lock);

		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(locker.purge_expired(), 1);
	}

	#[test]
	fn zero_timeout_coerces_to_default() {
		let locker = ConnectionLocker::new(Duration::ZERO);
		assert_eq!(locker.timeout, DEFAULT_LOCK_TIMEOUT);
	}
}
