use async_channel as chan;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

/// A raw message as delivered to a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
	pub subject: String,
	pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
	#[error("failed to serialise payload: {0}")]
	Serialise(#[from] serde_json::Error),
	#[error("bus connection closed")]
	Closed,
	#[error("invalid subject pattern <pattern='{0}'>")]
	InvalidPattern(String),
}

/// The publish/subscribe contract the engine runs against.
///
/// Subject patterns use `.`-separated tokens where `*` matches exactly one
/// token and a trailing `>` matches one or more. Broker transport and
/// authentication live behind implementations of this trait.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
	async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

	async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;
}

/// A stream of messages matching one subject pattern.
#[derive(Debug)]
pub struct Subscription {
	receiver: chan::Receiver<BusMessage>,
}

impl Subscription {
	#[must_use]
	pub fn new(receiver: chan::Receiver<BusMessage>) -> Self {
		Self { receiver }
	}

	/// Receives the next message; `None` once the bus side is gone.
	pub async fn recv(&self) -> Option<BusMessage> {
		self.receiver.recv().await.ok()
	}

	#[must_use]
	pub fn into_receiver(self) -> chan::Receiver<BusMessage> {
		self.receiver
	}
}

/// Serialises `value` as JSON and publishes it.
pub async fn publish_json<T: Serialize + Sync + ?Sized>(
	bus: &dyn Bus,
	subject: &str,
	value: &T,
) -> Result<(), BusError> {
	let payload = serde_json::to_vec(value)?;
	bus.publish(subject, payload).await
}

/// Whether `subject` matches `pattern` under NATS-style token rules.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
	let mut pattern_tokens = pattern.split('.');
	let mut subject_tokens = subject.split('.');

	loop {
		match (pattern_tokens.next(), subject_tokens.next()) {
			(Some(">"), Some(_)) => return true,
			(Some("*"), Some(_)) => {}
			(Some(p), Some(s)) if p == s => {}
			(None, None) => return true,
			_ => return false,
		}
	}
}

fn validate_pattern(pattern: &str) -> Result<(), BusError> {
	let tokens = pattern.split('.').collect::<Vec<_>>();

	let valid = !pattern.is_empty()
		&& tokens.iter().all(|token| !token.is_empty())
		&& tokens
			.iter()
			.enumerate()
			.all(|(i, token)| *token != ">" || i == tokens.len() - 1);

	if valid {
		Ok(())
	} else {
		Err(BusError::InvalidPattern(pattern.to_owned()))
	}
}

struct MemorySubscriber {
	pattern: String,
	tx: chan::Sender<BusMessage>,
}

/// In-process [`Bus`] used by tests and embedders that don't need a broker.
#[derive(Default)]
pub struct MemoryBus {
	subscribers: RwLock<Vec<MemorySubscriber>>,
}

impl MemoryBus {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Bus for MemoryBus {
	async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
		trace!("Publishing <subject='{subject}', bytes={}>", payload.len());

		let message = BusMessage {
			subject: subject.to_owned(),
			payload,
		};

		self.subscribers.write().retain(|subscriber| {
			if !subject_matches(&subscriber.pattern, subject) {
				return true;
			}

			// Unbounded sends only fail when the receiver is gone, in which
			// case the subscriber is pruned.
			subscriber.tx.try_send(message.clone()).is_ok()
		});

		Ok(())
	}

	async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
		validate_pattern(pattern)?;

		let (tx, rx) = chan::unbounded();

		self.subscribers.write().push(MemorySubscriber {
			pattern: pattern.to_owned(),
			tx,
		});

		Ok(Subscription::new(rx))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn subject_matching() {
		assert!(subject_matches("request.all", "request.all"));
		assert!(subject_matches("request.scope.*", "request.scope.test"));
		assert!(subject_matches("request.scope.>", "request.scope.test"));
		assert!(subject_matches(
			"request.scope.>",
			"request.scope.test.nested"
		));
		assert!(subject_matches(">", "anything.at.all"));

		assert!(!subject_matches("request.all", "request.scope.test"));
		assert!(!subject_matches("request.scope.*", "request.scope"));
		assert!(!subject_matches("request.scope.*", "request.scope.a.b"));
		assert!(!subject_matches("request.scope.>", "request.scope"));
	}

	#[tokio::test]
	async fn fan_out_to_matching_subscribers() {
		let bus = MemoryBus::new();

		let all = bus.subscribe("request.>").await.expect("valid pattern");
		let scoped = bus
			.subscribe("request.scope.test")
			.await
			.expect("valid pattern");
		let other = bus
			.subscribe("request.scope.prod")
			.await
			.expect("valid pattern");

		bus.publish("request.scope.test", b"hello".to_vec())
			.await
			.expect("publish succeeds");

		assert_eq!(all.recv().await.expect("delivered").payload, b"hello");
		assert_eq!(scoped.recv().await.expect("delivered").payload, b"hello");
		assert!(other.receiver.is_empty());
	}

	#[tokio::test]
	async fn dropped_subscribers_are_pruned() {
		let bus = MemoryBus::new();

		let subscription = bus.subscribe("request.all").await.expect("valid pattern");
		drop(subscription);

		bus.publish("request.all", Vec::new())
			.await
			.expect("publish succeeds");

		assert!(bus.subscribers.read().is_empty());
	}

	#[tokio::test]
	async fn rejects_invalid_patterns() {
		let bus = MemoryBus::new();

		assert!(matches!(
			bus.subscribe("request.>.scope").await,
			Err(BusError::InvalidPattern(_))
		));
		assert!(matches!(
			bus.subscribe("request..all").await,
			Err(BusError::InvalidPattern(_))
		));
		assert!(matches!(
			bus.subscribe("").await,
			Err(BusError::InvalidPattern(_))
		));
	}
}
