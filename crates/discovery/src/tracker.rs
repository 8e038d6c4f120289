use std::{
	collections::{HashMap, HashSet},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use chrono::Utc;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
	adapter::{cache_duration_for, Adapter},
	bus::publish_json,
	cache::{tags, CacheError, Tags},
	engine::Engine,
	types::{ErrorKind, Item, Metadata, Method, Query, QueryError},
};

/// How one query execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
	Done,
	Cancelled,
	TimedOut,
	/// Every adapter failed before any item was produced. Carries the first
	/// collected error.
	Failed(QueryError),
}

/// The result of [`QueryTracker::execute`]: whatever items were gathered,
/// the per-adapter errors that didn't stop the query, and the overall
/// outcome.
#[derive(Debug)]
pub struct Execution {
	pub items: Vec<Item>,
	pub errors: Vec<QueryError>,
	pub outcome: Outcome,
}

impl Execution {
	#[must_use]
	pub fn is_done(&self) -> bool {
		matches!(self.outcome, Outcome::Done)
	}
}

/// Tracks one in-flight query: its recursion frontier, its cancellation
/// handle and the cycle guard across link hops.
pub struct QueryTracker {
	engine: Engine,
	query: Query,
	token: CancellationToken,
}

impl QueryTracker {
	/// The tracker's token is a child of the engine's shutdown token, so a
	/// stopping engine cancels every live tracker.
	#[must_use]
	pub fn new(engine: &Engine, query: Query) -> Self {
		Self {
			engine: engine.clone(),
			token: engine.child_token(),
			query,
		}
	}

	#[must_use]
	pub fn query(&self) -> &Query {
		&self.query
	}

	#[must_use]
	pub fn token(&self) -> &CancellationToken {
		&self.token
	}

	/// Cooperatively cancels this query. In-flight adapter calls observe the
	/// token; the frontier loop stops dispatching.
	pub fn cancel(&self) {
		self.token.cancel();
	}

	/// Runs the query to completion: expands it across adapters, executes
	/// each sub-query under the engine's global concurrency cap, follows
	/// linked item queries while link depth remains, and publishes items on
	/// the query's item subject when a bus is attached.
	pub async fn execute(&self) -> Execution {
		let exec_token = self.token.child_token();
		let timed_out = Arc::new(AtomicBool::new(false));

		if let Some(timeout) = self.query.timeout {
			let deadline = Instant::now() + timeout;
			let exec_token = exec_token.clone();
			let timed_out = Arc::clone(&timed_out);

			tokio::spawn(async move {
				tokio::select! {
					() = exec_token.cancelled() => {}
					() = tokio::time::sleep_until(deadline) => {
						timed_out.store(true, Ordering::Release);
						exec_token.cancel();
					}
				}
			});
		}

		let execution = self.run_frontier(&exec_token, &timed_out).await;

		// Stops the deadline watchdog and any straggling jobs.
		exec_token.cancel();

		execution
	}

	async fn run_frontier(
		&self,
		exec_token: &CancellationToken,
		timed_out: &AtomicBool,
	) -> Execution {
		let mut visited = HashSet::new();
		let mut frontier = vec![self.query.clone()];
		let mut items = Vec::new();
		let mut errors: Vec<QueryError> = Vec::new();
		let mut root_wave = true;

		visited.insert(self.query.visit_key());

		while !frontier.is_empty() && !exec_token.is_cancelled() {
			let mut jobs = Vec::new();

			for sub_query in frontier.drain(..) {
				let mut expanded = self.engine.inner.host.expand_query(&sub_query);

				if sub_query.method == Method::Search {
					expanded.retain(|(_, adapter)| adapter.supports_search());
				}

				if expanded.is_empty() {
					if root_wave {
						errors.push(self.stamp(
							QueryError::no_context(format!(
								"no adapters found for type {} and scope {}",
								sub_query.query_type, sub_query.scope
							))
							.with_scope(&sub_query.scope)
							.with_item_type(&sub_query.query_type),
						));
					} else {
						debug!(
							"No adapter for linked query <type='{}', scope='{}'>",
							sub_query.query_type, sub_query.scope
						);
					}

					continue;
				}

				jobs.extend(expanded);
			}

			let mut running = jobs
				.into_iter()
				.enumerate()
				.map(|(order, (sub_query, adapter))| {
					tokio::spawn(run_job(
						self.engine.clone(),
						sub_query,
						adapter,
						exec_token.clone(),
						order,
					))
				})
				.collect::<FuturesUnordered<_>>();

			let mut wave = Vec::new();

			while let Some(joined) = running.next().await {
				match joined {
					Ok(output) => wave.push(output),
					Err(e) if e.is_panic() => {
						error!("Adapter panicked during query execution: {e:#?}");
						errors.push(self.stamp(QueryError::other(format!(
							"adapter panicked: {e}"
						))));
					}
					Err(_) => {}
				}
			}

			wave.sort_unstable_by_key(|output| output.order);

			let mut produced = Vec::new();
			// For GETs, competing items for the same identity collapse to the
			// highest weight; ties go to the earliest registration.
			let mut best_get: HashMap<(String, String, String), (u32, usize)> = HashMap::new();

			for output in wave {
				if let Some(e) = output.error {
					errors.push(self.stamp(e));
				}

				for item in output.items {
					if output.query.method == Method::Get {
						let key = (
							item.item_type.clone(),
							item.scope.clone(),
							item.unique_attribute_value(),
						);

						if let Some(&(weight, index)) = best_get.get(&key) {
							if output.weight > weight {
								produced[index] = (item, output.query.clone());
								best_get.insert(key, (output.weight, index));
							}

							continue;
						}

						best_get.insert(key, (output.weight, produced.len()));
					}

					produced.push((item, output.query.clone()));
				}
			}

			for (item, sub_query) in produced {
				self.publish_item(&sub_query, &item).await;

				if sub_query.recursion_behaviour.link_depth > 0 {
					for linked in &item.linked_item_queries {
						let child = sub_query.child(linked);

						if visited.insert(child.visit_key()) {
							frontier.push(child);
						}
					}
				}

				items.push(item);
			}

			root_wave = false;
		}

		let outcome = if timed_out.load(Ordering::Acquire) {
			Outcome::TimedOut
		} else if exec_token.is_cancelled() {
			if items.is_empty() {
				Outcome::Cancelled
			} else {
				errors.push(self.stamp(QueryError::other("query cancelled")));
				Outcome::Done
			}
		} else if items.is_empty() && !errors.is_empty() {
			Outcome::Failed(errors[0].clone())
		} else {
			Outcome::Done
		};

		Execution {
			items,
			errors,
			outcome,
		}
	}

	async fn publish_item(&self, sub_query: &Query, item: &Item) {
		if sub_query.item_subject.is_empty() {
			return;
		}

		let Some(bus) = self.engine.bus() else {
			return;
		};

		if let Err(e) = publish_json(&*bus, &sub_query.item_subject, item).await {
			warn!(
				"Failed to publish item <name='{}', subject='{}'>: {e}",
				item.globally_unique_name(),
				sub_query.item_subject
			);
		}
	}

	fn stamp(&self, mut error: QueryError) -> QueryError {
		error.responder_name = self.engine.inner.config.name.clone();

		if error.scope.is_empty() {
			error.scope = self.query.scope.clone();
		}

		if error.item_type.is_empty() {
			error.item_type = self.query.query_type.clone();
		}

		error
	}
}

struct JobOutput {
	query: Query,
	order: usize,
	weight: u32,
	items: Vec<Item>,
	error: Option<QueryError>,
}

impl JobOutput {
	fn new(query: Query, order: usize, weight: u32) -> Self {
		Self {
			query,
			order,
			weight,
			items: Vec::new(),
			error: None,
		}
	}
}

/// Runs one (sub-query, adapter) pair: lock, cache consult, adapter call,
/// metadata stamp, cache fill.
async fn run_job(
	engine: Engine,
	query: Query,
	adapter: Arc<dyn Adapter>,
	token: CancellationToken,
	order: usize,
) -> JobOutput {
	let mut output = JobOutput::new(query, order, adapter.weight());
	let query = output.query.clone();

	match query.method {
		Method::Get => {
			let lookup = tags([
				("sourceName", adapter.name()),
				("type", query.query_type.clone()),
				("scope", query.scope.clone()),
				("uniqueAttributeValue", query.query.clone()),
			]);

			// GETs share the read side so bulk queries exclude them, and
			// collapse identical lookups onto one adapter call.
			let _read = tokio::select! {
				guard = engine.inner.gfm.get_lock(&query.scope, &query.query_type) => guard,
				() = token.cancelled() => return output,
			};
			let _leader = tokio::select! {
				guard = engine.inner.gfm.inflight_lock(
					&query.scope,
					&query.query_type,
					&query.query,
				) => guard,
				() = token.cancelled() => return output,
			};

			if !query.ignore_cache {
				match engine.inner.cache.search(&lookup) {
					Ok(cached) if cached.len() == 1 => {
						debug!(
							"Found item from cache <source='{}', query='{}'>",
							adapter.name(),
							query.query
						);
						output.items = cached;
						return output;
					}
					Ok(_) => {
						warn!(
							"Cache returned more than one value for a get, purging <source='{}', query='{}'>",
							adapter.name(),
							query.query
						);
						engine.inner.cache.delete(&lookup);
					}
					Err(CacheError::NotFound) => {}
					Err(CacheError::Query(e)) => {
						if e.error_type == ErrorKind::NotFound {
							debug!(
								"Was not found previously, skipping adapter <source='{}', query='{}'>",
								adapter.name(),
								query.query
							);
							output.error = Some(e);
							return output;
						}
					}
				}
			}

			let Some(_permit) = acquire_slot(&engine, &token).await else {
				return output;
			};

			let started = Instant::now();
			let result = tokio::select! {
				result = adapter.get(token.clone(), &query.scope, &query.query) => result,
				() = token.cancelled() => return output,
			};
			let duration = started.elapsed();

			match result {
				Ok(mut item) => {
					item.metadata = Some(Metadata {
						timestamp: Utc::now(),
						source_duration: duration,
						source_duration_per_item: duration,
						source_name: adapter.name(),
						hidden: adapter.hidden(),
					});

					engine.inner.cache.store_item(
						item.clone(),
						cache_duration_for(&*adapter),
						lookup,
					);

					output.items.push(item);
				}
				Err(e) => {
					if token.is_cancelled() {
						return output;
					}

					let e = stamp_source(e, &query, &adapter);

					if e.error_type == ErrorKind::NotFound {
						engine.inner.cache.store_error(
							e.clone(),
							cache_duration_for(&*adapter),
							lookup,
						);
					}

					output.error = Some(e);
				}
			}
		}

		Method::List | Method::Search => {
			let lookup = bulk_tags(&query, &adapter);

			// The write side: a bulk cache fill never races the reads it is
			// about to satisfy, and identical bulk queries collapse.
			let _guard = tokio::select! {
				guard = engine.inner.gfm.find_lock(&query.scope, &query.query_type) => guard,
				() = token.cancelled() => return output,
			};

			if !query.ignore_cache {
				match engine.inner.cache.search(&lookup) {
					Ok(cached) => {
						debug!(
							"Found {} items from cache <source='{}', method='{}'>",
							cached.len(),
							adapter.name(),
							query.method
						);
						output.items = cached;
						return output;
					}
					Err(CacheError::NotFound) => {}
					Err(CacheError::Query(e)) => {
						if e.error_type == ErrorKind::NotFound {
							debug!(
								"Found cached empty result, not executing <source='{}', method='{}'>",
								adapter.name(),
								query.method
							);
							output.error = Some(e);
							return output;
						}
					}
				}
			}

			let Some(_permit) = acquire_slot(&engine, &token).await else {
				return output;
			};

			let started = Instant::now();
			let result = tokio::select! {
				result = async {
					match query.method {
						Method::List => adapter.list(token.clone(), &query.scope).await,
						_ => adapter.search(token.clone(), &query.scope, &query.query).await,
					}
				} => result,
				() = token.cancelled() => return output,
			};
			let duration = started.elapsed();

			match result {
				Ok(found) => {
					if found.is_empty() {
						// Cache the nothing, so repeat queries are cheap.
						engine.inner.cache.store_error(
							stamp_source(
								QueryError::not_found("no items found"),
								&query,
								&adapter,
							),
							cache_duration_for(&*adapter),
							lookup,
						);

						return output;
					}

					let per_item = duration / u32::try_from(found.len()).unwrap_or(u32::MAX);

					for mut item in found {
						item.metadata = Some(Metadata {
							timestamp: Utc::now(),
							source_duration: duration,
							source_duration_per_item: per_item,
							source_name: adapter.name(),
							hidden: adapter.hidden(),
						});

						engine.inner.cache.store_item(
							item.clone(),
							cache_duration_for(&*adapter),
							lookup.clone(),
						);

						output.items.push(item);
					}
				}
				Err(e) => {
					if token.is_cancelled() {
						return output;
					}

					let e = stamp_source(e, &query, &adapter);

					if e.error_type == ErrorKind::NotFound {
						engine.inner.cache.store_error(
							e.clone(),
							cache_duration_for(&*adapter),
							lookup,
						);
					}

					output.error = Some(e);
				}
			}
		}
	}

	output
}

/// Waits for a slot on the engine's global concurrency cap.
async fn acquire_slot(
	engine: &Engine,
	token: &CancellationToken,
) -> Option<tokio::sync::OwnedSemaphorePermit> {
	tokio::select! {
		permit = Arc::clone(&engine.inner.semaphore).acquire_owned() => {
			Some(permit.expect("the execution semaphore never closes"))
		}
		() = token.cancelled() => None,
	}
}

fn bulk_tags(query: &Query, adapter: &Arc<dyn Adapter>) -> Tags {
	let mut lookup = tags([
		("method", query.method.as_str().to_owned()),
		("sourceName", adapter.name()),
		("type", query.query_type.clone()),
		("scope", query.scope.clone()),
	]);

	if query.method == Method::Search {
		lookup.insert("query".into(), query.query.clone());
	}

	lookup
}

fn stamp_source(mut error: QueryError, query: &Query, adapter: &Arc<dyn Adapter>) -> QueryError {
	error.source_name = adapter.name();

	if error.scope.is_empty() {
		error.scope = query.scope.clone();
	}

	if error.item_type.is_empty() {
		error.item_type = query.query_type.clone();
	}

	error
}
