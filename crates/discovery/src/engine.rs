use std::{
	collections::{BTreeSet, HashMap},
	sync::Arc,
};

use async_channel as chan;
use futures::{stream::FuturesUnordered, StreamExt};
use futures_concurrency::future::Race;
use parking_lot::{Mutex, RwLock};
use tokio::{
	sync::Semaphore,
	task::JoinHandle,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
	adapter::Adapter,
	bus::{Bus, BusError, BusMessage},
	cache::Cache,
	gfm::GetFindMutex,
	heartbeat::{
		HeartbeatError, HeartbeatOptions, HeartbeatRequest, ManagementClient, SourceManaged,
		NEXT_HEARTBEAT_FACTOR,
	},
	host::{AdapterHost, RegistrationError},
	responder::Responder,
	tracker::{Execution, Outcome, QueryTracker},
	types::{CancelQuery, ErrorKind, Item, Query, QueryError},
};

/// Subject carrying queries addressed to every scope.
pub const REQUEST_ALL_SUBJECT: &str = "request.all";
/// Pattern matching queries addressed to a specific scope.
pub const REQUEST_SCOPE_PATTERN: &str = "request.scope.>";
/// Pattern matching cancellations addressed to a specific scope.
pub const CANCEL_SCOPE_PATTERN: &str = "cancel.scope.>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
	Created,
	Running,
	Stopping,
	Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
	#[error("engine is already running")]
	AlreadyRunning,
	#[error("engine is not running")]
	NotRunning,
	#[error(transparent)]
	Registration(#[from] RegistrationError),
	#[error(transparent)]
	Bus(#[from] BusError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
	/// Name of this source, used as the responder name and in heartbeats.
	pub name: String,
	pub version: String,
	pub engine_type: String,
	pub uuid: Uuid,
	pub managed: SourceManaged,
	/// Global cap on concurrently executing adapter calls.
	pub max_parallel_executions: usize,
	pub heartbeat: Option<HeartbeatOptions>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			name: "discovery-engine".into(),
			version: env!("CARGO_PKG_VERSION").into(),
			engine_type: "discovery".into(),
			uuid: Uuid::new_v4(),
			managed: SourceManaged::Local,
			max_parallel_executions: std::thread::available_parallelism()
				.map_or(1, std::num::NonZeroUsize::get),
			heartbeat: None,
		}
	}
}

pub(crate) struct Inner {
	pub(crate) config: EngineConfig,
	pub(crate) host: AdapterHost,
	pub(crate) cache: Arc<Cache>,
	pub(crate) gfm: GetFindMutex,
	pub(crate) semaphore: Arc<Semaphore>,
	bus: RwLock<Option<Arc<dyn Bus>>>,
	management: RwLock<Option<Arc<dyn ManagementClient>>>,
	trackers: Mutex<HashMap<Uuid, CancellationToken>>,
	state: Mutex<EngineState>,
	shutdown: Mutex<Option<CancellationToken>>,
	loops: Mutex<Vec<JoinHandle<()>>>,
}

/// The aggregate hosting adapters and serving queries over the bus.
///
/// Cheap to clone; clones share the same underlying engine.
pub struct Engine {
	pub(crate) inner: Arc<Inner>,
}

impl Clone for Engine {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl Engine {
	#[must_use]
	pub fn new(config: EngineConfig) -> Self {
		let permits = config.max_parallel_executions.max(1);

		Self {
			inner: Arc::new(Inner {
				config,
				host: AdapterHost::new(),
				cache: Arc::new(Cache::new()),
				gfm: GetFindMutex::new(),
				semaphore: Arc::new(Semaphore::new(permits)),
				bus: RwLock::new(None),
				management: RwLock::new(None),
				trackers: Mutex::new(HashMap::new()),
				state: Mutex::new(EngineState::Created),
				shutdown: Mutex::new(None),
				loops: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Attaches the bus the engine will subscribe and publish on. Takes
	/// effect at the next [`Engine::start`].
	pub fn connect_bus(&self, bus: Arc<dyn Bus>) {
		*self.inner.bus.write() = Some(bus);
	}

	pub fn set_management_client(&self, client: Arc<dyn ManagementClient>) {
		*self.inner.management.write() = Some(client);
	}

	pub fn add_adapters(
		&self,
		adapters: impl IntoIterator<Item = Arc<dyn Adapter>>,
	) -> Result<(), RegistrationError> {
		self.inner.host.add_adapters(adapters)
	}

	#[must_use]
	pub fn host(&self) -> &AdapterHost {
		&self.inner.host
	}

	#[must_use]
	pub fn cache(&self) -> &Arc<Cache> {
		&self.inner.cache
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.inner.config.name
	}

	#[must_use]
	pub fn state(&self) -> EngineState {
		*self.inner.state.lock()
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.state() == EngineState::Running
	}

	pub(crate) fn bus(&self) -> Option<Arc<dyn Bus>> {
		self.inner.bus.read().clone()
	}

	/// A token that fires when the engine stops. Outside a run, callers get
	/// a standalone token.
	pub(crate) fn child_token(&self) -> CancellationToken {
		self.inner
			.shutdown
			.lock()
			.as_ref()
			.map_or_else(CancellationToken::new, CancellationToken::child_token)
	}

	/// Subscribes to the request and cancellation subjects, spawns the
	/// request loop, the heartbeat loop and the cache purgers, and begins
	/// accepting queries.
	pub async fn start(&self) -> Result<(), EngineError> {
		{
			let mut state = self.inner.state.lock();

			if matches!(*state, EngineState::Running | EngineState::Stopping) {
				return Err(EngineError::AlreadyRunning);
			}

			*state = EngineState::Running;
		}

		let token = CancellationToken::new();
		*self.inner.shutdown.lock() = Some(token.clone());

		self.inner.cache.start_purger(&token);
		self.inner.host.start_purgers(&token);

		let mut loops = Vec::new();

		if let Some(bus) = self.bus() {
			let subscriptions = async {
				Ok::<_, BusError>((
					bus.subscribe(REQUEST_ALL_SUBJECT).await?,
					bus.subscribe(REQUEST_SCOPE_PATTERN).await?,
					bus.subscribe(CANCEL_SCOPE_PATTERN).await?,
				))
			}
			.await;

			let (all, scoped, cancels) = match subscriptions {
				Ok(subscriptions) => subscriptions,
				Err(e) => {
					token.cancel();
					self.inner.shutdown.lock().take();
					*self.inner.state.lock() = EngineState::Stopped;

					return Err(e.into());
				}
			};

			loops.push(tokio::spawn(run_request_loop(
				self.clone(),
				token.clone(),
				all.into_receiver(),
				scoped.into_receiver(),
				cancels.into_receiver(),
			)));
		} else {
			debug!("No bus attached, engine will only serve local queries");
		}

		let heartbeats_enabled = self.inner.management.read().is_some()
			&& self
				.inner
				.config
				.heartbeat
				.as_ref()
				.is_some_and(|options| !options.frequency.is_zero());

		if heartbeats_enabled {
			loops.push(tokio::spawn(run_heartbeat_loop(self.clone(), token.clone())));
		}

		*self.inner.loops.lock() = loops;

		info!("Engine started <name='{}'>", self.inner.config.name);

		Ok(())
	}

	/// Cancels every live tracker, drains in-flight request handlers and
	/// joins the background loops before returning.
	pub async fn stop(&self) -> Result<(), EngineError> {
		{
			let mut state = self.inner.state.lock();

			if *state != EngineState::Running {
				return Err(EngineError::NotRunning);
			}

			*state = EngineState::Stopping;
		}

		if let Some(token) = self.inner.shutdown.lock().take() {
			token.cancel();
		}

		for (_, token) in self.inner.trackers.lock().drain() {
			token.cancel();
		}

		let loops = std::mem::take(&mut *self.inner.loops.lock());

		for handle in loops {
			if let Err(e) = handle.await {
				if e.is_panic() {
					error!("Engine loop panicked during shutdown: {e:#?}");
				}
			}
		}

		*self.inner.state.lock() = EngineState::Stopped;

		info!("Engine stopped <name='{}'>", self.inner.config.name);

		Ok(())
	}

	/// Cancels the in-flight query tracked under `uuid`, if any.
	pub fn cancel_query(&self, uuid: Uuid) {
		if let Some(token) = self.inner.trackers.lock().get(&uuid) {
			info!("Cancelling query <uuid='{uuid}'>");
			token.cancel();
		}
	}

	pub(crate) fn track_query(&self, uuid: Uuid, token: CancellationToken) {
		if !uuid.is_nil() {
			self.inner.trackers.lock().insert(uuid, token);
		}
	}

	pub(crate) fn untrack_query(&self, uuid: &Uuid) {
		self.inner.trackers.lock().remove(uuid);
	}

	/// Synchronously drops expired entries from the engine cache and every
	/// caching adapter.
	pub fn purge_caches(&self) {
		let now = Instant::now();
		self.inner.cache.purge(now);
		self.inner.host.purge(now);
	}

	pub fn clear_caches(&self) {
		self.inner.cache.clear();
		self.inner.host.clear_caches();
	}

	/// Executes a query through the full pipeline, forwarding items and
	/// errors to the optional channels, and returns an error describing the
	/// overall outcome when the query failed hard.
	pub async fn execute_query(
		&self,
		query: Query,
		items_tx: Option<chan::Sender<Item>>,
		errors_tx: Option<chan::Sender<QueryError>>,
	) -> Result<(), QueryError> {
		let execution = self.execute_query_sync(query).await;

		if let Some(tx) = items_tx {
			for item in &execution.items {
				if tx.send(item.clone()).await.is_err() {
					break;
				}
			}
		}

		if let Some(tx) = errors_tx {
			for e in &execution.errors {
				if tx.send(e.clone()).await.is_err() {
					break;
				}
			}
		}

		match execution.outcome {
			Outcome::Done => Ok(()),
			Outcome::Cancelled => Err(QueryError::new(ErrorKind::Other, "query cancelled")),
			Outcome::TimedOut => Err(QueryError::timeout("query deadline elapsed")),
			Outcome::Failed(e) => Err(e),
		}
	}

	/// Executes a query and collects everything it produced.
	pub async fn execute_query_sync(&self, query: Query) -> Execution {
		QueryTracker::new(self, query).execute().await
	}

	/// Reports this source's inventory and health to the management plane.
	pub async fn send_heartbeat(&self) -> Result<(), HeartbeatError> {
		let client = self
			.inner
			.management
			.read()
			.clone()
			.ok_or(HeartbeatError::NoManagementClient)?;

		let options = self.inner.config.heartbeat.clone().unwrap_or_default();

		let error = options
			.health_check
			.as_ref()
			.and_then(|check| check().err().map(|e| e.to_string()));

		let mut available_types = BTreeSet::new();
		let mut available_scopes = BTreeSet::new();

		for adapter in self.inner.host.visible_adapters() {
			available_types.insert(adapter.item_type());
			available_scopes.extend(adapter.scopes());
		}

		let request = HeartbeatRequest {
			uuid: self.inner.config.uuid,
			name: self.inner.config.name.clone(),
			engine_type: self.inner.config.engine_type.clone(),
			version: self.inner.config.version.clone(),
			available_types: available_types.into_iter().collect(),
			available_scopes: available_scopes.into_iter().collect(),
			managed: self.inner.config.managed,
			error,
			next_heartbeat_max: options.frequency.mul_f64(NEXT_HEARTBEAT_FACTOR),
		};

		client.submit_source_heartbeat(request).await.map(|_| ())
	}
}

async fn run_request_loop(
	engine: Engine,
	token: CancellationToken,
	all_rx: chan::Receiver<BusMessage>,
	scoped_rx: chan::Receiver<BusMessage>,
	cancels_rx: chan::Receiver<BusMessage>,
) {
	enum StreamMessage {
		Request(BusMessage),
		Cancel(BusMessage),
		HandlerDone,
		Shutdown,
	}

	let mut handlers = FuturesUnordered::<JoinHandle<()>>::new();

	loop {
		let message = (
			async {
				all_rx
					.recv()
					.await
					.map_or(StreamMessage::Shutdown, StreamMessage::Request)
			},
			async {
				scoped_rx
					.recv()
					.await
					.map_or(StreamMessage::Shutdown, StreamMessage::Request)
			},
			async {
				cancels_rx
					.recv()
					.await
					.map_or(StreamMessage::Shutdown, StreamMessage::Cancel)
			},
			async {
				match handlers.next().await {
					Some(joined) => {
						if let Err(e) = joined {
							if e.is_panic() {
								error!("Query handler panicked: {e:#?}");
							}
						}

						StreamMessage::HandlerDone
					}
					// Nothing in flight; wait for another branch to win.
					None => std::future::pending().await,
				}
			},
			async {
				token.cancelled().await;
				StreamMessage::Shutdown
			},
		)
			.race()
			.await;

		match message {
			StreamMessage::Request(message) => {
				match serde_json::from_slice::<Query>(&message.payload) {
					Ok(query) => {
						handlers.push(tokio::spawn(handle_query(engine.clone(), query)));
					}
					Err(e) => {
						warn!(
							"Discarding undecodable query <subject='{}'>: {e}",
							message.subject
						);
					}
				}
			}

			StreamMessage::Cancel(message) => {
				match serde_json::from_slice::<CancelQuery>(&message.payload) {
					Ok(cancel) => engine.cancel_query(cancel.uuid),
					Err(e) => {
						warn!(
							"Discarding undecodable cancellation <subject='{}'>: {e}",
							message.subject
						);
					}
				}
			}

			StreamMessage::HandlerDone => {}

			StreamMessage::Shutdown => break,
		}
	}

	// In-flight trackers are children of the shutdown token, so handlers
	// finish promptly; wait for their terminal responses to go out.
	while let Some(joined) = handlers.next().await {
		if let Err(e) = joined {
			if e.is_panic() {
				error!("Query handler panicked during shutdown: {e:#?}");
			}
		}
	}
}

async fn handle_query(engine: Engine, query: Query) {
	// Not ours to answer.
	if engine.inner.host.expand_query(&query).is_empty() {
		return;
	}

	info!(
		"Received query <type='{}', method='{}', query='{}', link_depth={}, scope='{}'>",
		query.query_type,
		query.method,
		query.query,
		query.recursion_behaviour.link_depth,
		query.scope
	);

	let responder = Responder::start(
		engine.bus(),
		query.response_subject.clone(),
		engine.inner.config.name.clone(),
		query.uuid,
	)
	.await;

	let tracker = QueryTracker::new(&engine, query.clone());
	engine.track_query(query.uuid, tracker.token().clone());

	let execution = tracker.execute().await;

	engine.untrack_query(&query.uuid);

	match &execution.outcome {
		Outcome::Done => {
			responder.done().await;

			info!(
				"Query complete <type='{}', method='{}', query='{}', scope='{}', items={}>",
				query.query_type,
				query.method,
				query.query,
				query.scope,
				execution.items.len()
			);
		}

		Outcome::Cancelled => {
			responder.cancelled().await;

			info!(
				"Query cancelled <type='{}', query='{}', scope='{}'>",
				query.query_type, query.query, query.scope
			);
		}

		Outcome::TimedOut => {
			responder
				.error(
					QueryError::timeout("query deadline elapsed")
						.with_scope(&query.scope)
						.with_item_type(&query.query_type),
				)
				.await;

			info!(
				"Query timed out <type='{}', query='{}', scope='{}'>",
				query.query_type, query.query, query.scope
			);
		}

		Outcome::Failed(e) => {
			let e = e.clone();

			if e.error_type == ErrorKind::Other {
				error!("Query ended with unknown error: {e}");
			} else {
				info!("Query ended with error: {e}");
			}

			responder.error(e).await;
		}
	}
}

async fn run_heartbeat_loop(engine: Engine, token: CancellationToken) {
	let frequency = engine
		.inner
		.config
		.heartbeat
		.as_ref()
		.map_or(crate::heartbeat::DEFAULT_HEARTBEAT_FREQUENCY, |options| {
			options.frequency
		});

	let mut ticker = interval_at(Instant::now() + frequency, frequency);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			() = token.cancelled() => break,
			_ = ticker.tick() => {
				if let Err(e) = engine.send_heartbeat().await {
					error!("Failed to send heartbeat: {e}");
				}
			}
		}
	}
}
