use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{
	Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard,
	RwLock as AsyncRwLock,
};

/// Read/write coordination between specific and bulk queries, per
/// (scope, type).
///
/// GETs take the read side, LIST/SEARCH the write side: a bulk cache fill is
/// never racing individual reads of the same (scope, type), while unrelated
/// GETs proceed in parallel. On top of that, identical concurrent GETs
/// collapse onto one adapter call through a per-(scope, type, query)
/// in-flight lock: the leader populates the cache, followers re-read it.
///
/// This is a cache hit-rate optimisation, not a correctness lock; adapter
/// calls must still be safe under concurrency.
#[derive(Default)]
pub struct GetFindMutex {
	locks: Mutex<HashMap<(String, String), Arc<AsyncRwLock<()>>>>,
	inflight: Mutex<HashMap<(String, String, String), Arc<AsyncMutex<()>>>>,
}

impl GetFindMutex {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn get_lock(&self, scope: &str, item_type: &str) -> OwnedRwLockReadGuard<()> {
		self.lock_for(scope, item_type).read_owned().await
	}

	pub async fn find_lock(&self, scope: &str, item_type: &str) -> OwnedRwLockWriteGuard<()> {
		self.lock_for(scope, item_type).write_owned().await
	}

	/// Serialises identical GETs so only the first of a stampede reaches the
	/// adapter.
	pub async fn inflight_lock(
		&self,
		scope: &str,
		item_type: &str,
		query: &str,
	) -> OwnedMutexGuard<()> {
		let lock = {
			let mut inflight = self.inflight.lock();

			// Drop keys nobody is waiting on any more.
			inflight.retain(|_, lock| Arc::strong_count(lock) > 1);

			Arc::clone(
				inflight
					.entry((scope.to_owned(), item_type.to_owned(), query.to_owned()))
					.or_default(),
			)
		};

		lock.lock_owned().await
	}

	fn lock_for(&self, scope: &str, item_type: &str) -> Arc<AsyncRwLock<()>> {
		let mut locks = self.locks.lock();

		Arc::clone(
			locks
				.entry((scope.to_owned(), item_type.to_owned()))
				.or_default(),
		)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::time::timeout;

	use super::*;

	#[tokio::test]
	async fn gets_are_concurrent() {
		let gfm = GetFindMutex::new();

		let first = gfm.get_lock("test", "person").await;
		let second = timeout(Duration::from_millis(50), gfm.get_lock("test", "person"))
			.await
			.expect("concurrent gets must not block each other");

		drop((first, second));
	}

	#[tokio::test]
	async fn find_excludes_get() {
		let gfm = GetFindMutex::new();

		let bulk = gfm.find_lock("test", "person").await;

		assert!(
			timeout(Duration::from_millis(50), gfm.get_lock("test", "person"))
				.await
				.is_err(),
			"a get must wait for an in-flight bulk query"
		);

		drop(bulk);

		timeout(Duration::from_millis(50), gfm.get_lock("test", "person"))
			.await
			.expect("the lock must be released");
	}

	#[tokio::test]
	async fn different_keys_do_not_interfere() {
		let gfm = GetFindMutex::new();

		let bulk = gfm.find_lock("test", "person").await;

		timeout(Duration::from_millis(50), gfm.find_lock("test2", "person"))
			.await
			.expect("a different scope must not be blocked");
		timeout(Duration::from_millis(50), gfm.get_lock("test", "dog"))
			.await
			.expect("a different type must not be blocked");

		drop(bulk);
	}

	#[tokio::test]
	async fn identical_gets_serialise_in_flight() {
		let gfm = GetFindMutex::new();

		let leader = gfm.inflight_lock("test", "person", "dylan").await;

		assert!(
			timeout(
				Duration::from_millis(50),
				gfm.inflight_lock("test", "person", "dylan")
			)
			.await
			.is_err(),
			"an identical query must wait for the leader"
		);

		timeout(
			Duration::from_millis(50),
			gfm.inflight_lock("test", "person", "manny"),
		)
		.await
		.expect("a different query must proceed");

		drop(leader);
	}
}
