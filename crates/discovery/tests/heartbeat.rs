mod common;

use std::{sync::Arc, time::Duration};

use async_channel as chan;
use async_trait::async_trait;
use discovery_engine::{
	Adapter, Engine, EngineConfig, HealthCheck, HeartbeatError, HeartbeatOptions,
	HeartbeatRequest, HeartbeatResponse, ManagementClient, SourceManaged,
};
use tokio::time::Instant;
use uuid::Uuid;

use common::{init_tracing, TestAdapter};

struct ChannelManagementClient {
	requests: chan::Sender<HeartbeatRequest>,
}

#[async_trait]
impl ManagementClient for ChannelManagementClient {
	async fn submit_source_heartbeat(
		&self,
		request: HeartbeatRequest,
	) -> Result<HeartbeatResponse, HeartbeatError> {
		self.requests
			.send(request)
			.await
			.map_err(|e| HeartbeatError::Submission(e.to_string()))?;

		Ok(HeartbeatResponse::default())
	}
}

fn engine_with_client(
	name: &str,
	uuid: Uuid,
	heartbeat: HeartbeatOptions,
) -> (Engine, chan::Receiver<HeartbeatRequest>) {
	init_tracing();

	let (requests_tx, requests_rx) = chan::unbounded();

	let engine = Engine::new(EngineConfig {
		name: name.into(),
		version: "v0.0.0-test".into(),
		engine_type: "aws".into(),
		uuid,
		managed: SourceManaged::Local,
		heartbeat: Some(heartbeat),
		..EngineConfig::default()
	});

	engine.set_management_client(Arc::new(ChannelManagementClient {
		requests: requests_tx,
	}));

	engine
		.add_adapters([
			Arc::new(TestAdapter {
				return_type: "test-type".into(),
				return_scopes: vec!["test".into()],
				return_name: "adapter-one".into(),
				..TestAdapter::default()
			}) as Arc<dyn Adapter>,
			Arc::new(TestAdapter {
				return_type: "test-type2".into(),
				return_scopes: vec!["test".into()],
				return_name: "adapter-two".into(),
				..TestAdapter::default()
			}),
			Arc::new(TestAdapter {
				return_type: "test-type3".into(),
				return_scopes: vec!["test2".into()],
				return_name: "adapter-three".into(),
				..TestAdapter::default()
			}),
		])
		.expect("adapters register");

	(engine, requests_rx)
}

#[tokio::test]
async fn heartbeats_report_inventory_when_healthy() {
	let uuid = Uuid::new_v4();
	let check: HealthCheck = Arc::new(|| Ok(()));

	let (engine, requests) = engine_with_client(
		"heartbeat-healthy",
		uuid,
		HeartbeatOptions {
			health_check: Some(check),
			..HeartbeatOptions::default()
		},
	);

	engine.send_heartbeat().await.expect("heartbeat submits");

	let request = requests.recv().await.expect("one request was sent");

	assert_eq!(request.uuid, uuid);
	assert_eq!(request.name, "heartbeat-healthy");
	assert_eq!(request.version, "v0.0.0-test");
	assert_eq!(request.engine_type, "aws");
	assert_eq!(request.managed, SourceManaged::Local);
	assert_eq!(request.error, None);

	for expected in ["test-type", "test-type2", "test-type3"] {
		assert!(
			request.available_types.iter().any(|t| t == expected),
			"missing type {expected}: {:?}",
			request.available_types
		);
	}

	for expected in ["test", "test2"] {
		assert!(
			request.available_scopes.iter().any(|s| s == expected),
			"missing scope {expected}: {:?}",
			request.available_scopes
		);
	}

	assert_eq!(
		request.next_heartbeat_max,
		HeartbeatOptions::default().frequency.mul_f64(2.5)
	);
}

#[tokio::test]
async fn heartbeats_carry_healthcheck_failures_in_band() {
	let check: HealthCheck = Arc::new(|| Err("subsystem on fire".into()));

	let (engine, requests) = engine_with_client(
		"heartbeat-unhealthy",
		Uuid::new_v4(),
		HeartbeatOptions {
			health_check: Some(check),
			..HeartbeatOptions::default()
		},
	);

	engine.send_heartbeat().await.expect("heartbeat submits");

	let request = requests.recv().await.expect("one request was sent");
	assert_eq!(request.error.as_deref(), Some("subsystem on fire"));
}

#[tokio::test]
async fn heartbeats_without_a_healthcheck_report_healthy() {
	let (engine, requests) = engine_with_client(
		"heartbeat-no-check",
		Uuid::new_v4(),
		HeartbeatOptions::default(),
	);

	engine.send_heartbeat().await.expect("heartbeat submits");

	let request = requests.recv().await.expect("one request was sent");
	assert_eq!(request.error, None);
}

#[tokio::test]
async fn heartbeats_require_a_management_client() {
	init_tracing();

	let engine = Engine::new(EngineConfig::default());

	assert!(matches!(
		engine.send_heartbeat().await,
		Err(HeartbeatError::NoManagementClient)
	));
}

#[tokio::test]
async fn heartbeats_tick_at_the_configured_frequency() {
	let (engine, requests) = engine_with_client(
		"heartbeat-cadence",
		Uuid::new_v4(),
		HeartbeatOptions {
			frequency: Duration::from_millis(250),
			health_check: None,
		},
	);

	engine.start().await.expect("engine starts");

	let started = Instant::now();

	requests.recv().await.expect("first heartbeat");
	requests.recv().await.expect("second heartbeat");

	let elapsed = started.elapsed();

	assert!(
		elapsed >= Duration::from_millis(500),
		"two heartbeats arrived too quickly: {elapsed:?}"
	);
	assert!(
		elapsed <= Duration::from_millis(750),
		"two heartbeats took too long: {elapsed:?}"
	);

	engine.stop().await.expect("stops");
}
