//!
//! # Discovery Engine
//!
//! A pluggable framework that hosts multiple *adapters* (sources of entity
//! information) and serves queries over them: wildcard expansion across types
//! and scopes, parallel adapter fan-out under a global concurrency cap,
//! recursive link-following with depth limits and cycle avoidance,
//! positive/negative caching with per-adapter TTLs, collapsing of concurrent
//! identical work, per-query cancellation and timeouts, and at-most-once
//! response lifecycles over a pub/sub bus.
//!
//! Bring your own adapters and, optionally, a bus: queries can also be run
//! in-process through [`Engine::execute_query_sync`].
//!
//! ## Basic example
//!
//! ```
//! use std::{collections::BTreeMap, sync::Arc};
//!
//! use async_trait::async_trait;
//! use discovery_engine::{
//!     Adapter, AdapterResult, CancellationToken, Engine, EngineConfig, Item, Method, Query,
//!     RecursionBehaviour,
//! };
//!
//! struct PeopleAdapter;
//!
//! #[async_trait]
//! impl Adapter for PeopleAdapter {
//!     fn item_type(&self) -> String {
//!         "person".into()
//!     }
//!
//!     fn name(&self) -> String {
//!         "people".into()
//!     }
//!
//!     fn scopes(&self) -> Vec<String> {
//!         vec!["test".into()]
//!     }
//!
//!     fn weight(&self) -> u32 {
//!         10
//!     }
//!
//!     async fn get(
//!         &self,
//!         _token: CancellationToken,
//!         scope: &str,
//!         query: &str,
//!     ) -> AdapterResult<Item> {
//!         Ok(Item {
//!             item_type: "person".into(),
//!             unique_attribute: "name".into(),
//!             attributes: BTreeMap::from([("name".into(), serde_json::json!(query))]),
//!             scope: scope.into(),
//!             linked_item_queries: Vec::new(),
//!             metadata: None,
//!         })
//!     }
//!
//!     async fn list(&self, _token: CancellationToken, _scope: &str) -> AdapterResult<Vec<Item>> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::new(EngineConfig::default());
//!     engine
//!         .add_adapters([Arc::new(PeopleAdapter) as Arc<dyn Adapter>])
//!         .expect("no colliding adapters");
//!
//!     let execution = engine
//!         .execute_query_sync(Query {
//!             query_type: "person".into(),
//!             scope: "test".into(),
//!             method: Method::Get,
//!             query: "Dylan".into(),
//!             recursion_behaviour: RecursionBehaviour::default(),
//!             ignore_cache: false,
//!             timeout: None,
//!             uuid: uuid::Uuid::new_v4(),
//!             item_subject: String::new(),
//!             response_subject: String::new(),
//!         })
//!         .await;
//!
//!     assert!(execution.is_done());
//!     assert_eq!(execution.items.len(), 1);
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod adapter;
mod bus;
mod cache;
mod engine;
mod gfm;
mod heartbeat;
mod host;
mod meta;
mod responder;
mod tracker;
mod types;

pub use adapter::{cache_duration_for, Adapter, AdapterResult, DEFAULT_CACHE_DURATION};
pub use bus::{
	publish_json, subject_matches, Bus, BusError, BusMessage, MemoryBus, Subscription,
};
pub use cache::{tags, Cache, CacheError, Tags};
pub use engine::{
	Engine, EngineConfig, EngineError, EngineState, CANCEL_SCOPE_PATTERN, REQUEST_ALL_SUBJECT,
	REQUEST_SCOPE_PATTERN,
};
pub use gfm::GetFindMutex;
pub use heartbeat::{
	HealthCheck, HeartbeatError, HeartbeatOptions, HeartbeatRequest, HeartbeatResponse,
	ManagementClient, SourceManaged, DEFAULT_HEARTBEAT_FREQUENCY,
};
pub use host::{AdapterHost, RegistrationError};
pub use responder::{Responder, DEFAULT_RESPONSE_INTERVAL};
pub use tracker::{Execution, Outcome, QueryTracker};
pub use types::{
	is_wildcard, CancelQuery, ErrorKind, Item, Metadata, Method, Query, QueryError,
	RecursionBehaviour, Response, ResponderState, WILDCARD,
};

pub use tokio_util::sync::CancellationToken;
