use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::{
	bus::{publish_json, Bus},
	types::{QueryError, Response, ResponderState},
};

/// How often a responder reassures the requester that work is ongoing.
pub const DEFAULT_RESPONSE_INTERVAL: Duration = Duration::from_secs(5);

/// Emits the WORKING / DONE / ERROR / CANCELLED lifecycle for one query on
/// its response subject.
///
/// On construction it publishes an initial WORKING message and starts a
/// keepalive ticker; exactly one terminal message is ever published, and
/// state calls after the first terminal are no-ops. With no bus or an empty
/// subject the responder degrades to a no-op.
pub struct Responder {
	bus: Option<Arc<dyn Bus>>,
	subject: String,
	name: String,
	uuid: Uuid,
	interval: Duration,
	terminated: Arc<AtomicBool>,
	keepalive: CancellationToken,
}

impl Responder {
	pub async fn start(
		bus: Option<Arc<dyn Bus>>,
		subject: impl Into<String>,
		name: impl Into<String>,
		uuid: Uuid,
	) -> Self {
		Self::start_with_interval(bus, subject, name, uuid, DEFAULT_RESPONSE_INTERVAL).await
	}

	pub async fn start_with_interval(
		bus: Option<Arc<dyn Bus>>,
		subject: impl Into<String>,
		name: impl Into<String>,
		uuid: Uuid,
		interval: Duration,
	) -> Self {
		let responder = Self {
			bus,
			subject: subject.into(),
			name: name.into(),
			uuid,
			interval,
			terminated: Arc::new(AtomicBool::new(false)),
			keepalive: CancellationToken::new(),
		};

		responder.send(ResponderState::Working, None).await;
		responder.spawn_keepalive();

		responder
	}

	fn spawn_keepalive(&self) {
		let Some(bus) = self.bus.clone() else {
			return;
		};

		if self.subject.is_empty() {
			return;
		}

		let subject = self.subject.clone();
		let name = self.name.clone();
		let uuid = self.uuid;
		let interval = self.interval;
		let terminated = Arc::clone(&self.terminated);
		let token = self.keepalive.clone();

		tokio::spawn(async move {
			let mut ticker = interval_at(Instant::now() + interval, interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					() = token.cancelled() => break,
					_ = ticker.tick() => {}
				}

				if terminated.load(Ordering::Acquire) {
					break;
				}

				let response = Response {
					responder: name.clone(),
					state: ResponderState::Working,
					error: None,
					next_update: Some(interval),
					uuid,
				};

				if let Err(e) = publish_json(&*bus, &subject, &response).await {
					warn!("Failed to publish keepalive <subject='{subject}'>: {e}");
				}
			}
		});
	}

	async fn send(&self, state: ResponderState, error: Option<QueryError>) {
		let Some(bus) = self.bus.as_deref() else {
			return;
		};

		if self.subject.is_empty() {
			return;
		}

		let response = Response {
			responder: self.name.clone(),
			state,
			error,
			next_update: (state == ResponderState::Working).then_some(self.interval),
			uuid: self.uuid,
		};

		if let Err(e) = publish_json(bus, &self.subject, &response).await {
			warn!(
				"Failed to publish response <subject='{}', state={state:?}>: {e}",
				self.subject
			);
		}
	}

	async fn finish(&self, state: ResponderState, error: Option<QueryError>) {
		// The terminal message is emitted exactly once.
		if self.terminated.swap(true, Ordering::AcqRel) {
			return;
		}

		self.keepalive.cancel();
		self.send(state, error).await;
	}

	pub async fn done(&self) {
		self.finish(ResponderState::Done, None).await;
	}

	pub async fn error(&self, error: QueryError) {
		self.finish(ResponderState::Error, Some(error)).await;
	}

	pub async fn cancelled(&self) {
		self.finish(ResponderState::Cancelled, None).await;
	}
}

impl Drop for Responder {
	fn drop(&mut self) {
		self.keepalive.cancel();
	}
}
