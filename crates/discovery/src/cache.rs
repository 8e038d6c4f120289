use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::types::{Item, QueryError};

/// Ceiling for the purger interval when every stored TTL is long.
const MAX_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// An unordered set of tag pairs identifying one or more cache entries.
pub type Tags = BTreeMap<String, String>;

/// Builds a [`Tags`] set from literal pairs.
#[must_use]
pub fn tags<K: Into<String>, V: Into<String>, const N: usize>(pairs: [(K, V); N]) -> Tags {
	pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
	/// Nothing is stored under the queried tags.
	#[error("cache entry not found")]
	NotFound,
	/// A negative entry is stored under the queried tags; it shadows any
	/// items that would otherwise match.
	#[error(transparent)]
	Query(QueryError),
}

#[derive(Debug, Clone)]
enum CacheValue {
	Item(Box<Item>),
	Error(QueryError),
}

#[derive(Debug)]
struct Entry {
	tags: Tags,
	value: CacheValue,
	expires_at: Instant,
}

#[derive(Default)]
struct Indexed {
	entries: HashMap<u64, Entry>,
	index: HashMap<(String, String), HashSet<u64>>,
	next_id: u64,
}

impl Indexed {
	fn insert(&mut self, entry: Entry) {
		let id = self.next_id;
		self.next_id += 1;

		for (key, value) in &entry.tags {
			self.index
				.entry((key.clone(), value.clone()))
				.or_default()
				.insert(id);
		}

		self.entries.insert(id, entry);
	}

	fn remove(&mut self, id: u64) {
		if let Some(entry) = self.entries.remove(&id) {
			for (key, value) in &entry.tags {
				if let Some(ids) = self.index.get_mut(&(key.clone(), value.clone())) {
					ids.remove(&id);
					if ids.is_empty() {
						self.index.remove(&(key.clone(), value.clone()));
					}
				}
			}
		}
	}

	/// Ids of entries whose stored tags are a superset of `tags`, sorted by
	/// insertion order. An empty tag set matches everything.
	fn matching(&self, tags: &Tags) -> Vec<u64> {
		let mut candidates: Option<HashSet<u64>> = None;

		for (key, value) in tags {
			let Some(ids) = self.index.get(&(key.clone(), value.clone())) else {
				return Vec::new();
			};

			candidates = Some(match candidates {
				Some(candidates) => candidates.intersection(ids).copied().collect(),
				None => ids.clone(),
			});
		}

		let mut ids = match candidates {
			Some(candidates) => candidates.into_iter().collect::<Vec<_>>(),
			None => self.entries.keys().copied().collect(),
		};
		ids.sort_unstable();

		ids
	}
}

/// Tag-indexed store of items and negative errors with per-entry TTL.
///
/// Lookup is by tag superset: `search` returns every unexpired entry whose
/// stored tags contain all of the queried tags. Items are additionally
/// indexed under their intrinsic `type`/`scope`/`uniqueAttributeValue` tags,
/// which is what lets a bulk query's results satisfy a later specific one.
#[derive(Default)]
pub struct Cache {
	inner: RwLock<Indexed>,
	/// Smallest TTL ever stored, in milliseconds; paces the purger.
	min_ttl_millis: AtomicU64,
	purger_running: AtomicBool,
}

impl Cache {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn store_item(&self, item: Item, ttl: Duration, mut tags: Tags) {
		tags.insert("type".into(), item.item_type.clone());
		tags.insert("scope".into(), item.scope.clone());
		tags.insert(
			"uniqueAttributeValue".into(),
			item.unique_attribute_value(),
		);

		trace!("Caching item <name='{}'>", item.globally_unique_name());

		self.note_ttl(ttl);
		self.inner.write().insert(Entry {
			tags,
			value: CacheValue::Item(Box::new(item)),
			expires_at: Instant::now() + ttl,
		});
	}

	pub fn store_error(&self, error: QueryError, ttl: Duration, tags: Tags) {
		trace!("Caching error <error='{error}'>");

		self.note_ttl(ttl);
		self.inner.write().insert(Entry {
			tags,
			value: CacheValue::Error(error),
			expires_at: Instant::now() + ttl,
		});
	}

	/// Returns every unexpired entry whose stored tags are a superset of
	/// `tags`. A stored error shadows matching items.
	pub fn search(&self, tags: &Tags) -> Result<Vec<Item>, CacheError> {
		let now = Instant::now();
		let inner = self.inner.read();

		let mut items = Vec::new();

		for id in inner.matching(tags) {
			let Some(entry) = inner.entries.get(&id) else {
				continue;
			};

			if entry.expires_at <= now {
				continue;
			}

			match &entry.value {
				CacheValue::Error(error) => return Err(CacheError::Query(error.clone())),
				CacheValue::Item(item) => items.push((**item).clone()),
			}
		}

		if items.is_empty() {
			Err(CacheError::NotFound)
		} else {
			Ok(items)
		}
	}

	/// Removes every entry whose stored tags are a superset of `tags`,
	/// returning how many were dropped.
	pub fn delete(&self, tags: &Tags) -> usize {
		let mut inner = self.inner.write();

		let ids = inner.matching(tags);
		for id in &ids {
			inner.remove(*id);
		}

		ids.len()
	}

	/// Drops every entry that expired at or before `now`.
	pub fn purge(&self, now: Instant) {
		let mut inner = self.inner.write();

		let expired = inner
			.entries
			.iter()
			.filter(|(_, entry)| entry.expires_at <= now)
			.map(|(id, _)| *id)
			.collect::<Vec<_>>();

		if !expired.is_empty() {
			debug!("Purging {} expired cache entries", expired.len());
		}

		for id in expired {
			inner.remove(id);
		}
	}

	pub fn clear(&self) {
		let mut inner = self.inner.write();
		inner.entries.clear();
		inner.index.clear();
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.inner.read().entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.inner.read().entries.is_empty()
	}

	/// Spawns the background purger, which drops expired entries on an
	/// interval no longer than the smallest stored TTL and stops when the
	/// token fires. Starting an already-running purger is a no-op.
	pub fn start_purger(self: &Arc<Self>, token: &CancellationToken) {
		if self.purger_running.swap(true, Ordering::AcqRel) {
			warn!("Cache purger is already running");
			return;
		}

		let cache = Arc::clone(self);
		let token = token.clone();

		tokio::spawn(async move {
			loop {
				let interval = cache.purge_interval();

				tokio::select! {
					() = token.cancelled() => break,
					() = tokio::time::sleep(interval) => cache.purge(Instant::now()),
				}
			}

			cache.purger_running.store(false, Ordering::Release);
		});
	}

	fn purge_interval(&self) -> Duration {
		match self.min_ttl_millis.load(Ordering::Relaxed) {
			0 => MAX_PURGE_INTERVAL,
			millis => Duration::from_millis(millis).min(MAX_PURGE_INTERVAL),
		}
	}

	fn note_ttl(&self, ttl: Duration) {
		let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

		self.min_ttl_millis
			.try_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
				(current == 0 || millis < current).then_some(millis)
			})
			.ok();
	}
}

impl std::fmt::Debug for Cache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Cache")
			.field("entries", &self.len())
			.finish()
	}
}
