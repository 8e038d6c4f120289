use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(5 * 60);

/// Multiplier applied to the heartbeat frequency to give the management
/// plane some leeway before declaring this source dead.
pub(crate) const NEXT_HEARTBEAT_FACTOR: f64 = 2.5;

/// Returns `Ok` when the source considers itself healthy. Failures are
/// reported to the management plane in-band, not as transport errors.
pub type HealthCheck =
	Arc<dyn Fn() -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

#[derive(Clone)]
pub struct HeartbeatOptions {
	pub frequency: Duration,
	pub health_check: Option<HealthCheck>,
}

impl Default for HeartbeatOptions {
	fn default() -> Self {
		Self {
			frequency: DEFAULT_HEARTBEAT_FREQUENCY,
			health_check: None,
		}
	}
}

impl fmt::Debug for HeartbeatOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HeartbeatOptions")
			.field("frequency", &self.frequency)
			.field("health_check", &self.health_check.is_some())
			.finish()
	}
}

/// Whether this source runs under the management plane's control or is
/// operated locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceManaged {
	Local,
	Managed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
	pub uuid: Uuid,
	pub name: String,
	#[serde(rename = "type")]
	pub engine_type: String,
	pub version: String,
	pub available_types: Vec<String>,
	pub available_scopes: Vec<String>,
	pub managed: SourceManaged,
	#[serde(default)]
	pub error: Option<String>,
	/// If the next heartbeat doesn't arrive within this duration, the server
	/// may declare the source dead.
	pub next_heartbeat_max: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
	#[error("no management client configured")]
	NoManagementClient,
	#[error("failed to submit heartbeat: {0}")]
	Submission(String),
}

/// The management plane boundary: a single unary call reporting this
/// source's inventory and health.
#[async_trait]
pub trait ManagementClient: Send + Sync + 'static {
	async fn submit_source_heartbeat(
		&self,
		request: HeartbeatRequest,
	) -> Result<HeartbeatResponse, HeartbeatError>;
}
