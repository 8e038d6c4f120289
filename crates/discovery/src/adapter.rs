use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
	cache::Cache,
	types::{Item, QueryError},
};

/// Cache lifetime applied to adapters that don't define their own.
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(10 * 60);

pub type AdapterResult<T> = Result<T, QueryError>;

/// A pluggable source of items.
///
/// Adapters answer GET/LIST (and optionally SEARCH) queries for a set of
/// scopes. Expensive work must watch the provided [`CancellationToken`] and
/// return promptly when it fires; the engine converts per-query timeouts and
/// cancellations into that token.
///
/// A well-behaved adapter returns a [`QueryError`] of kind `NotFound` only
/// when it conclusively determined absence. Any other failure must surface as
/// `Other` so that negative caching can't poison later queries.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
	/// The type of items this adapter is capable of finding.
	fn item_type(&self) -> String;

	/// Descriptive name, used in logging and metadata.
	fn name(&self) -> String;

	/// The scopes this adapter can serve. The wildcard scope `*` means "any
	/// scope, but they cannot be enumerated".
	fn scopes(&self) -> Vec<String>;

	/// Returns the single item whose unique attribute value equals `query`.
	async fn get(
		&self,
		token: CancellationToken,
		scope: &str,
		query: &str,
	) -> AdapterResult<Item>;

	/// Returns every item this adapter can enumerate in `scope`. An empty
	/// list with no error is a valid answer.
	async fn list(&self, token: CancellationToken, scope: &str) -> AdapterResult<Vec<Item>>;

	/// Priority weighting used to break ties when several adapters return
	/// competing items for the same identity on a GET.
	fn weight(&self) -> u32;

	/// Adapter-defined search. Only called when [`Adapter::supports_search`]
	/// returns true.
	async fn search(
		&self,
		token: CancellationToken,
		scope: &str,
		query: &str,
	) -> AdapterResult<Vec<Item>> {
		let _ = (token, scope, query);
		Err(QueryError::no_context(format!(
			"adapter {} does not support searching",
			self.name()
		)))
	}

	/// Whether this adapter overrides [`Adapter::search`].
	fn supports_search(&self) -> bool {
		false
	}

	/// Hidden adapters serve only specific queries and never participate in
	/// wildcard fan-out; their items are marked hidden in metadata.
	fn hidden(&self) -> bool {
		false
	}

	/// Custom cache lifetime for results produced by this adapter.
	fn cache_duration(&self) -> Option<Duration> {
		None
	}

	/// An adapter-owned cache, purged and cleared through the host's
	/// lifecycle hooks.
	fn cache(&self) -> Option<Arc<Cache>> {
		None
	}
}

/// The cache lifetime for a specific adapter, falling back to
/// [`DEFAULT_CACHE_DURATION`].
#[must_use]
pub fn cache_duration_for(adapter: &dyn Adapter) -> Duration {
	adapter.cache_duration().unwrap_or(DEFAULT_CACHE_DURATION)
}
