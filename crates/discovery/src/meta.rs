use std::{
	collections::{BTreeMap, BTreeSet},
	sync::{Arc, Weak},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
	adapter::{Adapter, AdapterResult},
	host::Registry,
	types::{Item, QueryError},
};

/// Scope the built-in meta-adapters answer in.
const GLOBAL_SCOPE: &str = "global";

const META_WEIGHT: u32 = 100;

fn host_gone() -> QueryError {
	QueryError::other("adapter host has been dropped")
}

fn meta_item(item_type: &str, name: &str) -> Item {
	Item {
		item_type: item_type.into(),
		unique_attribute: "name".into(),
		attributes: BTreeMap::from([("name".into(), serde_json::json!(name))]),
		scope: GLOBAL_SCOPE.into(),
		linked_item_queries: Vec::new(),
		metadata: None,
	}
}

/// Answers queries for the item types served by this host.
pub(crate) struct TypeAdapter {
	registry: Weak<Registry>,
}

impl TypeAdapter {
	pub(crate) fn new(registry: Weak<Registry>) -> Self {
		Self { registry }
	}
}

#[async_trait]
impl Adapter for TypeAdapter {
	fn item_type(&self) -> String {
		"type".into()
	}

	fn name(&self) -> String {
		"builtin-types".into()
	}

	fn scopes(&self) -> Vec<String> {
		vec![GLOBAL_SCOPE.into()]
	}

	async fn get(
		&self,
		_token: CancellationToken,
		_scope: &str,
		query: &str,
	) -> AdapterResult<Item> {
		let registry = self.registry.upgrade().ok_or_else(host_gone)?;

		let known = registry
			.adapters
			.read()
			.iter()
			.any(|adapter| adapter.item_type() == query);

		if known {
			Ok(meta_item("type", query))
		} else {
			Err(QueryError::not_found(format!("unknown type {query}")))
		}
	}

	async fn list(&self, _token: CancellationToken, _scope: &str) -> AdapterResult<Vec<Item>> {
		let registry = self.registry.upgrade().ok_or_else(host_gone)?;

		let types = registry
			.visible()
			.iter()
			.map(|adapter| adapter.item_type())
			.collect::<BTreeSet<_>>();

		Ok(types
			.into_iter()
			.map(|item_type| meta_item("type", &item_type))
			.collect())
	}

	fn weight(&self) -> u32 {
		META_WEIGHT
	}
}

/// Answers queries for the scopes served by this host.
pub(crate) struct ScopeAdapter {
	registry: Weak<Registry>,
}

impl ScopeAdapter {
	pub(crate) fn new(registry: Weak<Registry>) -> Self {
		Self { registry }
	}
}

#[async_trait]
impl Adapter for ScopeAdapter {
	fn item_type(&self) -> String {
		"scope".into()
	}

	fn name(&self) -> String {
		"builtin-scopes".into()
	}

	fn scopes(&self) -> Vec<String> {
		vec![GLOBAL_SCOPE.into()]
	}

	async fn get(
		&self,
		_token: CancellationToken,
		_scope: &str,
		query: &str,
	) -> AdapterResult<Item> {
		let registry = self.registry.upgrade().ok_or_else(host_gone)?;

		let known = registry
			.adapters
			.read()
			.iter()
			.any(|adapter| adapter.scopes().iter().any(|scope| scope == query));

		if known {
			Ok(meta_item("scope", query))
		} else {
			Err(QueryError::not_found(format!("unknown scope {query}")))
		}
	}

	async fn list(&self, _token: CancellationToken, _scope: &str) -> AdapterResult<Vec<Item>> {
		let registry = self.registry.upgrade().ok_or_else(host_gone)?;

		let scopes = registry
			.visible()
			.iter()
			.flat_map(|adapter| adapter.scopes())
			.collect::<BTreeSet<_>>();

		Ok(scopes
			.into_iter()
			.map(|scope| meta_item("scope", &scope))
			.collect())
	}

	fn weight(&self) -> u32 {
		META_WEIGHT
	}
}

/// Answers queries for the adapters registered with this host.
pub(crate) struct AdaptersAdapter {
	registry: Weak<Registry>,
}

impl AdaptersAdapter {
	pub(crate) fn new(registry: Weak<Registry>) -> Self {
		Self { registry }
	}

	fn describe(adapter: &Arc<dyn Adapter>) -> Item {
		let mut item = meta_item("adapter", &adapter.name());

		item.attributes
			.insert("type".into(), serde_json::json!(adapter.item_type()));
		item.attributes
			.insert("scopes".into(), serde_json::json!(adapter.scopes()));
		item.attributes
			.insert("weight".into(), serde_json::json!(adapter.weight()));

		item
	}
}

#[async_trait]
impl Adapter for AdaptersAdapter {
	fn item_type(&self) -> String {
		"adapter".into()
	}

	fn name(&self) -> String {
		"builtin-adapters".into()
	}

	fn scopes(&self) -> Vec<String> {
		vec![GLOBAL_SCOPE.into()]
	}

	async fn get(
		&self,
		_token: CancellationToken,
		_scope: &str,
		query: &str,
	) -> AdapterResult<Item> {
		let registry = self.registry.upgrade().ok_or_else(host_gone)?;

		let found = registry
			.adapters
			.read()
			.iter()
			.find(|adapter| adapter.name() == query)
			.map(Self::describe);

		found.ok_or_else(|| QueryError::not_found(format!("unknown adapter {query}")))
	}

	async fn list(&self, _token: CancellationToken, _scope: &str) -> AdapterResult<Vec<Item>> {
		let registry = self.registry.upgrade().ok_or_else(host_gone)?;

		Ok(registry.visible().iter().map(Self::describe).collect())
	}

	fn weight(&self) -> u32 {
		META_WEIGHT
	}
}
