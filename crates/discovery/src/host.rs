use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
	adapter::Adapter,
	meta::{AdaptersAdapter, ScopeAdapter, TypeAdapter},
	types::{is_wildcard, Query},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
	#[error("adapter for type '{item_type}' already exists with scope '{scope}'")]
	AlreadyExists { item_type: String, scope: String },
}

/// The shared adapter list. Kept separate from [`AdapterHost`] so the
/// built-in meta-adapters can answer queries about it without keeping the
/// host alive.
#[derive(Default)]
pub(crate) struct Registry {
	pub(crate) adapters: RwLock<Vec<Arc<dyn Adapter>>>,
}

impl Registry {
	pub(crate) fn visible(&self) -> Vec<Arc<dyn Adapter>> {
		self.adapters
			.read()
			.iter()
			.filter(|adapter| !adapter.hidden())
			.map(Arc::clone)
			.collect()
	}
}

/// Holds every adapter in the process and resolves which of them a query
/// should run against. Safe to call concurrently.
pub struct AdapterHost {
	registry: Arc<Registry>,
}

impl AdapterHost {
	/// Creates a host with the built-in `type`, `scope` and `adapter`
	/// meta-adapters registered.
	#[must_use]
	pub fn new() -> Self {
		let host = Self {
			registry: Arc::new(Registry::default()),
		};

		host.register_builtins();

		host
	}

	fn register_builtins(&self) {
		let weak = Arc::downgrade(&self.registry);

		self.add_adapters([
			Arc::new(TypeAdapter::new(weak.clone())) as Arc<dyn Adapter>,
			Arc::new(ScopeAdapter::new(weak.clone())),
			Arc::new(AdaptersAdapter::new(weak)),
		])
		.expect("built-in adapter types never collide");
	}

	/// Registers adapters, rejecting any whose (type, scope) pair collides
	/// with an existing registration. Adapters registered before the
	/// offending one stay registered.
	pub fn add_adapters(
		&self,
		adapters: impl IntoIterator<Item = Arc<dyn Adapter>>,
	) -> Result<(), RegistrationError> {
		let mut registered = self.registry.adapters.write();

		for adapter in adapters {
			for existing in registered.iter() {
				if existing.item_type() != adapter.item_type() {
					continue;
				}

				for scope in adapter.scopes() {
					if existing.scopes().contains(&scope) {
						return Err(RegistrationError::AlreadyExists {
							item_type: adapter.item_type(),
							scope,
						});
					}
				}
			}

			registered.push(adapter);
		}

		Ok(())
	}

	#[must_use]
	pub fn adapters(&self) -> Vec<Arc<dyn Adapter>> {
		self.registry.adapters.read().iter().map(Arc::clone).collect()
	}

	/// Every adapter except hidden ones.
	#[must_use]
	pub fn visible_adapters(&self) -> Vec<Arc<dyn Adapter>> {
		self.registry.visible()
	}

	#[must_use]
	pub fn adapters_by_type(&self, item_type: &str) -> Vec<Arc<dyn Adapter>> {
		self.registry
			.adapters
			.read()
			.iter()
			.filter(|adapter| adapter.item_type() == item_type)
			.map(Arc::clone)
			.collect()
	}

	/// Removes every adapter, then re-registers the built-ins.
	pub fn clear_adapters(&self) {
		self.registry.adapters.write().clear();
		self.register_builtins();
	}

	/// Expands a possibly-wildcard query into the concrete sub-queries to
	/// run, paired with the adapter each should run against.
	///
	/// A query with a wildcard type fans out across all visible adapters; a
	/// concrete type selects adapters of that type. For each candidate, each
	/// adapter scope produces a sub-query when the adapter serves all scopes,
	/// the query scope is the wildcard, or the adapter scope contains the
	/// query scope. The sub-query carries the more specific of the two
	/// scopes. Hidden adapters never match a wildcard on either axis.
	#[must_use]
	pub fn expand_query(&self, query: &Query) -> Vec<(Query, Arc<dyn Adapter>)> {
		let candidates = if is_wildcard(&query.query_type) {
			self.visible_adapters()
		} else {
			self.adapters_by_type(&query.query_type)
		};

		let mut expanded = Vec::new();

		for adapter in candidates {
			if adapter.hidden()
				&& (is_wildcard(&query.query_type) || is_wildcard(&query.scope))
			{
				continue;
			}

			for adapter_scope in adapter.scopes() {
				if !(is_wildcard(&adapter_scope)
					|| is_wildcard(&query.scope)
					|| adapter_scope.contains(&query.scope))
				{
					continue;
				}

				let mut sub_query = query.clone();
				sub_query.query_type = adapter.item_type();
				sub_query.scope = if is_wildcard(&adapter_scope) {
					query.scope.clone()
				} else {
					adapter_scope.clone()
				};

				expanded.push((sub_query, Arc::clone(&adapter)));
			}
		}

		debug!(
			"Expanded query into {} sub-queries <type='{}', scope='{}'>",
			expanded.len(),
			query.query_type,
			query.scope
		);

		expanded
	}

	/// Starts the background purger of every caching adapter.
	pub fn start_purgers(&self, token: &CancellationToken) {
		for adapter in self.adapters() {
			if let Some(cache) = adapter.cache() {
				cache.start_purger(token);
			}
		}
	}

	/// Synchronously drops expired entries from every caching adapter.
	pub fn purge(&self, now: Instant) {
		for adapter in self.adapters() {
			if let Some(cache) = adapter.cache() {
				cache.purge(now);
			}
		}
	}

	pub fn clear_caches(&self) {
		for adapter in self.adapters() {
			if let Some(cache) = adapter.cache() {
				cache.clear();
			}
		}
	}
}

impl Default for AdapterHost {
	fn default() -> Self {
		Self::new()
	}
}
