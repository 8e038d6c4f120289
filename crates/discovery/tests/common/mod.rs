#![allow(dead_code)]

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use discovery_engine::{
	Adapter, AdapterResult, CancellationToken, Engine, EngineConfig, Item, Method, Query,
	QueryError, RecursionBehaviour,
};
use uuid::Uuid;

pub fn init_tracing() {
	use tracing_subscriber::EnvFilter;

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init()
		.ok();
}

pub fn query(method: Method, query_type: &str, scope: &str, q: &str) -> Query {
	Query {
		query_type: query_type.into(),
		scope: scope.into(),
		method,
		query: q.into(),
		recursion_behaviour: RecursionBehaviour::default(),
		ignore_cache: false,
		timeout: None,
		uuid: Uuid::new_v4(),
		item_subject: String::new(),
		response_subject: String::new(),
	}
}

pub fn person(name: &str, scope: &str) -> Item {
	Item {
		item_type: "person".into(),
		unique_attribute: "name".into(),
		attributes: BTreeMap::from([
			("name".into(), serde_json::json!(name)),
			("generation".into(), serde_json::json!(rand::random::<u32>())),
		]),
		scope: scope.into(),
		linked_item_queries: Vec::new(),
		metadata: None,
	}
}

pub fn generation(item: &Item) -> u64 {
	item.attributes["generation"]
		.as_u64()
		.expect("generation attribute is numeric")
}

pub async fn new_started_engine(name: &str, adapters: Vec<Arc<dyn Adapter>>) -> Engine {
	init_tracing();

	let engine = Engine::new(EngineConfig {
		name: name.into(),
		..EngineConfig::default()
	});

	engine.add_adapters(adapters).expect("adapters register");
	engine.start().await.expect("engine starts");

	engine
}

#[derive(Debug, Default)]
pub struct Calls {
	pub get: Vec<(String, String)>,
	pub list: Vec<String>,
	pub search: Vec<(String, String)>,
}

/// Scriptable adapter: the scope decides the behaviour. `empty` answers
/// NOTFOUND, `error` fails with OTHER, anything else produces one person
/// carrying a per-call `generation` marker.
pub struct TestAdapter {
	pub return_type: String,
	pub return_scopes: Vec<String>,
	pub return_name: String,
	pub return_weight: u32,
	pub is_hidden: AtomicBool,
	pub searchable: bool,
	pub calls: parking_lot::Mutex<Calls>,
}

impl Default for TestAdapter {
	fn default() -> Self {
		Self {
			return_type: "person".into(),
			return_scopes: vec!["test".into()],
			return_name: "test-adapter".into(),
			return_weight: 10,
			is_hidden: AtomicBool::new(false),
			searchable: true,
			calls: parking_lot::Mutex::new(Calls::default()),
		}
	}
}

impl TestAdapter {
	pub fn with_scopes(scopes: &[&str]) -> Arc<Self> {
		Arc::new(Self {
			return_scopes: scopes.iter().map(ToString::to_string).collect(),
			..Self::default()
		})
	}

	pub fn get_calls(&self) -> Vec<(String, String)> {
		self.calls.lock().get.clone()
	}

	pub fn list_calls(&self) -> Vec<String> {
		self.calls.lock().list.clone()
	}

	pub fn search_calls(&self) -> Vec<(String, String)> {
		self.calls.lock().search.clone()
	}

	pub fn clear_calls(&self) {
		*self.calls.lock() = Calls::default();
	}

	fn answer(&self, scope: &str, name: &str) -> AdapterResult<Item> {
		match scope {
			"empty" => Err(QueryError::not_found("no items found").with_scope(scope)),
			"error" => Err(QueryError::other("adapter failed").with_scope(scope)),
			_ => {
				let mut item = person(name, scope);
				item.item_type = self.return_type.clone();
				Ok(item)
			}
		}
	}
}

#[async_trait]
impl Adapter for TestAdapter {
	fn item_type(&self) -> String {
		self.return_type.clone()
	}

	fn name(&self) -> String {
		self.return_name.clone()
	}

	fn scopes(&self) -> Vec<String> {
		self.return_scopes.clone()
	}

	async fn get(
		&self,
		_token: CancellationToken,
		scope: &str,
		query: &str,
	) -> AdapterResult<Item> {
		self.calls.lock().get.push((scope.into(), query.into()));
		self.answer(scope, query)
	}

	async fn list(&self, _token: CancellationToken, scope: &str) -> AdapterResult<Vec<Item>> {
		self.calls.lock().list.push(scope.into());
		self.answer(scope, "dylan").map(|item| vec![item])
	}

	async fn search(
		&self,
		_token: CancellationToken,
		scope: &str,
		query: &str,
	) -> AdapterResult<Vec<Item>> {
		self.calls.lock().search.push((scope.into(), query.into()));
		self.answer(scope, query).map(|item| vec![item])
	}

	fn supports_search(&self) -> bool {
		self.searchable
	}

	fn weight(&self) -> u32 {
		self.return_weight
	}

	fn hidden(&self) -> bool {
		self.is_hidden.load(Ordering::Relaxed)
	}

	fn cache_duration(&self) -> Option<Duration> {
		Some(Duration::from_millis(100))
	}
}

/// Adapter whose GET takes a fixed time and optionally links onward to
/// fresh names, for timeout, cancellation and parallelism tests.
pub struct SlowAdapter {
	pub delay: Duration,
	pub links_per_item: usize,
	counter: AtomicU64,
	get_calls: AtomicUsize,
	active: AtomicUsize,
	max_active: AtomicUsize,
}

impl SlowAdapter {
	pub fn new(delay: Duration, links_per_item: usize) -> Arc<Self> {
		Arc::new(Self {
			delay,
			links_per_item,
			counter: AtomicU64::new(0),
			get_calls: AtomicUsize::new(0),
			active: AtomicUsize::new(0),
			max_active: AtomicUsize::new(0),
		})
	}

	pub fn get_call_count(&self) -> usize {
		self.get_calls.load(Ordering::SeqCst)
	}

	pub fn max_active(&self) -> usize {
		self.max_active.load(Ordering::SeqCst)
	}

	fn fresh_name(&self) -> String {
		format!("person-{}", self.counter.fetch_add(1, Ordering::SeqCst))
	}
}

#[async_trait]
impl Adapter for SlowAdapter {
	fn item_type(&self) -> String {
		"person".into()
	}

	fn name(&self) -> String {
		"slow-adapter".into()
	}

	fn scopes(&self) -> Vec<String> {
		vec!["test".into()]
	}

	async fn get(
		&self,
		token: CancellationToken,
		scope: &str,
		query: &str,
	) -> AdapterResult<Item> {
		self.get_calls.fetch_add(1, Ordering::SeqCst);

		let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_active.fetch_max(running, Ordering::SeqCst);

		let result = tokio::select! {
			() = tokio::time::sleep(self.delay) => {
				let mut item = person(query, scope);

				for _ in 0..self.links_per_item {
					item.linked_item_queries.push(query_for(&self.fresh_name(), scope));
				}

				Ok(item)
			}
			() = token.cancelled() => {
				Err(QueryError::timeout("query was cancelled").with_scope(scope))
			}
		};

		self.active.fetch_sub(1, Ordering::SeqCst);

		result
	}

	async fn list(&self, _token: CancellationToken, _scope: &str) -> AdapterResult<Vec<Item>> {
		Ok(Vec::new())
	}

	fn weight(&self) -> u32 {
		100
	}
}

fn query_for(name: &str, scope: &str) -> Query {
	Query {
		query_type: "person".into(),
		scope: scope.into(),
		method: Method::Get,
		query: name.into(),
		recursion_behaviour: RecursionBehaviour::default(),
		ignore_cache: false,
		timeout: None,
		uuid: Uuid::nil(),
		item_subject: String::new(),
		response_subject: String::new(),
	}
}
