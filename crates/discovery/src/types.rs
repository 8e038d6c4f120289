use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The special scope/type value meaning "match anything".
pub const WILDCARD: &str = "*";

#[must_use]
pub fn is_wildcard(value: &str) -> bool {
	value == WILDCARD
}

/// How a query interrogates an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
	Get,
	List,
	Search,
}

impl Method {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Get => "get",
			Self::List => "list",
			Self::Search => "search",
		}
	}
}

impl std::fmt::Display for Method {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursionBehaviour {
	/// Remaining hops permitted when following linked item queries.
	pub link_depth: u32,
}

/// A request for items, either received over the bus or constructed locally.
///
/// `item_subject` and `response_subject` are opaque bus addresses; the engine
/// publishes discovered items and responder lifecycle messages there when a
/// bus is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
	#[serde(rename = "type")]
	pub query_type: String,
	pub scope: String,
	pub method: Method,
	#[serde(default)]
	pub query: String,
	#[serde(default)]
	pub recursion_behaviour: RecursionBehaviour,
	#[serde(default)]
	pub ignore_cache: bool,
	#[serde(default)]
	pub timeout: Option<Duration>,
	#[serde(default)]
	pub uuid: Uuid,
	#[serde(default)]
	pub item_subject: String,
	#[serde(default)]
	pub response_subject: String,
}

impl Query {
	/// Key used by the tracker's cycle guard.
	#[must_use]
	pub fn visit_key(&self) -> (String, String, Method, String) {
		(
			self.query_type.clone(),
			self.scope.clone(),
			self.method,
			self.query.clone(),
		)
	}

	/// Derives a sub-query from a linked item query, inheriting the subjects,
	/// cache policy, timeout and UUID of the parent with one less link hop.
	#[must_use]
	pub fn child(&self, linked: &Query) -> Self {
		Self {
			query_type: linked.query_type.clone(),
			scope: linked.scope.clone(),
			method: linked.method,
			query: linked.query.clone(),
			recursion_behaviour: RecursionBehaviour {
				link_depth: self.recursion_behaviour.link_depth.saturating_sub(1),
			},
			ignore_cache: self.ignore_cache,
			timeout: self.timeout,
			uuid: self.uuid,
			item_subject: self.item_subject.clone(),
			response_subject: self.response_subject.clone(),
		}
	}
}

/// Core-stamped details about where an item came from. Adapters never set
/// this; the tracker overwrites it after every adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
	pub timestamp: DateTime<Utc>,
	pub source_duration: Duration,
	pub source_duration_per_item: Duration,
	pub source_name: String,
	#[serde(default)]
	pub hidden: bool,
}

/// A discovered entity. The attribute schema is adapter-defined; the core
/// only relies on the identity attribute and the linked queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
	#[serde(rename = "type")]
	pub item_type: String,
	pub unique_attribute: String,
	pub attributes: BTreeMap<String, serde_json::Value>,
	pub scope: String,
	#[serde(default)]
	pub linked_item_queries: Vec<Query>,
	#[serde(default)]
	pub metadata: Option<Metadata>,
}

impl Item {
	/// The value of the identity attribute, stringified. Empty when the
	/// attribute is missing.
	#[must_use]
	pub fn unique_attribute_value(&self) -> String {
		match self.attributes.get(&self.unique_attribute) {
			Some(serde_json::Value::String(s)) => s.clone(),
			Some(value) => value.to_string(),
			None => String::new(),
		}
	}

	/// A name that is unique across scopes and types, used for logging.
	#[must_use]
	pub fn globally_unique_name(&self) -> String {
		format!(
			"{}.{}.{}",
			self.scope,
			self.item_type,
			self.unique_attribute_value()
		)
	}
}

/// Surface classification of a query failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
	/// No adapter can serve the query.
	NoContext,
	/// An adapter conclusively determined absence.
	NotFound,
	/// The tracker's deadline elapsed.
	Timeout,
	/// Anything else. Never cached.
	Other,
}

impl std::fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Self::NoContext => "NOCONTEXT",
			Self::NotFound => "NOTFOUND",
			Self::Timeout => "TIMEOUT",
			Self::Other => "OTHER",
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error(
	"{error_type} <scope='{scope}', type='{item_type}', source='{source_name}'>: {error_string}"
)]
pub struct QueryError {
	pub error_type: ErrorKind,
	pub error_string: String,
	#[serde(default)]
	pub scope: String,
	#[serde(default)]
	pub item_type: String,
	#[serde(default)]
	pub source_name: String,
	#[serde(default)]
	pub responder_name: String,
}

impl QueryError {
	#[must_use]
	pub fn new(error_type: ErrorKind, error_string: impl Into<String>) -> Self {
		Self {
			error_type,
			error_string: error_string.into(),
			scope: String::new(),
			item_type: String::new(),
			source_name: String::new(),
			responder_name: String::new(),
		}
	}

	#[must_use]
	pub fn not_found(error_string: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotFound, error_string)
	}

	#[must_use]
	pub fn no_context(error_string: impl Into<String>) -> Self {
		Self::new(ErrorKind::NoContext, error_string)
	}

	#[must_use]
	pub fn timeout(error_string: impl Into<String>) -> Self {
		Self::new(ErrorKind::Timeout, error_string)
	}

	#[must_use]
	pub fn other(error_string: impl Into<String>) -> Self {
		Self::new(ErrorKind::Other, error_string)
	}

	#[must_use]
	pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
		self.scope = scope.into();
		self
	}

	#[must_use]
	pub fn with_item_type(mut self, item_type: impl Into<String>) -> Self {
		self.item_type = item_type.into();
		self
	}

	#[must_use]
	pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
		self.source_name = source_name.into();
		self
	}
}

/// Responder lifecycle states, as published on the response subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponderState {
	Working,
	Done,
	Error,
	Cancelled,
}

/// A responder lifecycle message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub responder: String,
	pub state: ResponderState,
	#[serde(default)]
	pub error: Option<QueryError>,
	/// For WORKING messages: how long until the next keepalive at the latest.
	#[serde(default)]
	pub next_update: Option<Duration>,
	#[serde(default)]
	pub uuid: Uuid,
}

/// Payload of the cancellation subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelQuery {
	pub uuid: Uuid,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn person(name: &str) -> Item {
		Item {
			item_type: "person".into(),
			unique_attribute: "name".into(),
			attributes: BTreeMap::from([("name".into(), serde_json::json!(name))]),
			scope: "test".into(),
			linked_item_queries: Vec::new(),
			metadata: None,
		}
	}

	#[test]
	fn unique_attribute_value_stringifies() {
		let mut item = person("Dylan");
		assert_eq!(item.unique_attribute_value(), "Dylan");

		item.attributes
			.insert("name".into(), serde_json::json!(42));
		assert_eq!(item.unique_attribute_value(), "42");

		item.attributes.remove("name");
		assert_eq!(item.unique_attribute_value(), "");
	}

	#[test]
	fn child_query_inherits_and_decrements() {
		let parent = Query {
			query_type: "person".into(),
			scope: "test".into(),
			method: Method::Get,
			query: "Dylan".into(),
			recursion_behaviour: RecursionBehaviour { link_depth: 3 },
			ignore_cache: true,
			timeout: Some(Duration::from_secs(5)),
			uuid: Uuid::new_v4(),
			item_subject: "items".into(),
			response_subject: "responses".into(),
		};

		let linked = Query {
			query_type: "dog".into(),
			scope: "test2".into(),
			method: Method::Get,
			query: "Manny".into(),
			recursion_behaviour: RecursionBehaviour::default(),
			ignore_cache: false,
			timeout: None,
			uuid: Uuid::nil(),
			item_subject: String::new(),
			response_subject: String::new(),
		};

		let child = parent.child(&linked);

		assert_eq!(child.query_type, "dog");
		assert_eq!(child.scope, "test2");
		assert_eq!(child.query, "Manny");
		assert_eq!(child.recursion_behaviour.link_depth, 2);
		assert!(child.ignore_cache);
		assert_eq!(child.timeout, parent.timeout);
		assert_eq!(child.uuid, parent.uuid);
		assert_eq!(child.item_subject, "items");
		assert_eq!(child.response_subject, "responses");
	}

	#[test]
	fn query_round_trips_through_json() {
		let query = Query {
			query_type: "person".into(),
			scope: "test".into(),
			method: Method::Search,
			query: "Dylan".into(),
			recursion_behaviour: RecursionBehaviour { link_depth: 2 },
			ignore_cache: false,
			timeout: Some(Duration::from_millis(250)),
			uuid: Uuid::new_v4(),
			item_subject: "items.abc".into(),
			response_subject: "responses.abc".into(),
		};

		let bytes = serde_json::to_vec(&query).expect("serialises");
		let parsed: Query = serde_json::from_slice(&bytes).expect("deserialises");

		assert_eq!(parsed.query_type, query.query_type);
		assert_eq!(parsed.method, Method::Search);
		assert_eq!(parsed.timeout, query.timeout);
		assert_eq!(parsed.uuid, query.uuid);
	}
}
