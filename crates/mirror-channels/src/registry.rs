//! Per-owner table of topic registrations.
//!
//! Every registration owns one pump task that drains its bus receiver in
//! order and hands decoded messages to the handler. Dropping or closing the
//! registry aborts the pumps, which also drops their receivers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use transport_bus::{Bus, BusMessage};

use crate::error::{ChannelError, ChannelResult};
use crate::protocol::{decode, encode, topic_for, MessagePattern, Operation, ProtocolMessage};

pub type Handler = Arc<dyn Fn(ProtocolMessage) + Send + Sync>;

enum Registration {
    Shared(HashMap<String, JoinHandle<()>>),
    Exclusive(JoinHandle<()>),
}

impl Registration {
    fn abort(self) {
        match self {
            Registration::Shared(handles) => handles.into_values().for_each(|h| h.abort()),
            Registration::Exclusive(handle) => handle.abort(),
        }
    }

    fn handler_count(&self) -> usize {
        match self {
            Registration::Shared(handles) => handles.len(),
            Registration::Exclusive(_) => 1,
        }
    }
}

pub struct ProtocolRegistry {
    bus: Arc<dyn Bus>,
    owner: String,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl ProtocolRegistry {
    pub fn new(bus: Arc<dyn Bus>, owner: impl Into<String>) -> Self {
        Self {
            bus,
            owner: owner.into(),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Encodes and publishes `message`, returning how many subscribers saw it.
    pub fn publish(
        &self,
        operation: Operation,
        scope: Option<&str>,
        message: &ProtocolMessage,
    ) -> ChannelResult<usize> {
        let topic = topic_for(operation, scope);
        let delivered = self.bus.publish(&topic, encode(message)?)?;
        trace!(
            target = "mirror.registry",
            owner = %self.owner,
            topic = %topic,
            kind = message.kind(),
            delivered,
            "published"
        );
        Ok(delivered)
    }

    /// Adds `handler` under `key`. Registering the same key twice keeps the
    /// first handler and returns `false`.
    pub fn subscribe<F>(
        &self,
        operation: Operation,
        scope: Option<&str>,
        key: &str,
        handler: F,
    ) -> ChannelResult<bool>
    where
        F: Fn(ProtocolMessage) + Send + Sync + 'static,
    {
        if !matches!(
            operation.pattern(),
            MessagePattern::Publish | MessagePattern::Subscribe
        ) {
            return Err(ChannelError::misuse(format!(
                "{operation:?} is consumed exclusively and cannot be subscribed to"
            )));
        }
        let topic = topic_for(operation, scope);
        let mut guard = self.registrations.lock();
        let registration = guard
            .entry(topic.clone())
            .or_insert_with(|| Registration::Shared(HashMap::new()));
        let Registration::Shared(handles) = registration else {
            return Err(ChannelError::misuse(format!(
                "topic {topic} already has an exclusive consumer"
            )));
        };
        if handles.contains_key(key) {
            return Ok(false);
        }
        let rx = self.bus.subscribe(&topic);
        let handle = spawn_pump(self.owner.clone(), topic.clone(), rx, Arc::new(handler));
        handles.insert(key.to_string(), handle);
        debug!(target = "mirror.registry", owner = %self.owner, topic = %topic, key, "subscribed");
        Ok(true)
    }

    /// Installs `handler` as the only consumer of the topic, replacing any
    /// previous one.
    pub fn pull<F>(&self, operation: Operation, scope: Option<&str>, handler: F) -> ChannelResult<()>
    where
        F: Fn(ProtocolMessage) + Send + Sync + 'static,
    {
        if !matches!(operation.pattern(), MessagePattern::Push | MessagePattern::Pull) {
            return Err(ChannelError::misuse(format!(
                "{operation:?} is a shared topic and cannot be pulled"
            )));
        }
        let topic = topic_for(operation, scope);
        let rx = self.bus.subscribe(&topic);
        let handle = spawn_pump(self.owner.clone(), topic.clone(), rx, Arc::new(handler));
        let previous = self
            .registrations
            .lock()
            .insert(topic.clone(), Registration::Exclusive(handle));
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!(target = "mirror.registry", owner = %self.owner, topic = %topic, "pulling");
        Ok(())
    }

    /// Removes one keyed subscription. Unknown keys are ignored.
    pub fn unsubscribe(&self, operation: Operation, scope: Option<&str>, key: &str) -> bool {
        let topic = topic_for(operation, scope);
        let mut guard = self.registrations.lock();
        let Some(Registration::Shared(handles)) = guard.get_mut(&topic) else {
            return false;
        };
        let Some(handle) = handles.remove(key) else {
            return false;
        };
        handle.abort();
        if handles.is_empty() {
            guard.remove(&topic);
        }
        true
    }

    /// Removes every handler on the topic. Unknown topics are ignored.
    pub fn unsubscribe_topic(&self, operation: Operation, scope: Option<&str>) -> bool {
        let topic = topic_for(operation, scope);
        let removed = self.registrations.lock().remove(&topic);
        match removed {
            Some(registration) => {
                registration.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, operation: Operation, scope: Option<&str>) -> bool {
        self.registrations
            .lock()
            .contains_key(&topic_for(operation, scope))
    }

    pub fn handler_count(&self, operation: Operation, scope: Option<&str>) -> usize {
        self.registrations
            .lock()
            .get(&topic_for(operation, scope))
            .map(Registration::handler_count)
            .unwrap_or(0)
    }

    pub fn close(&self) {
        let drained: Vec<Registration> = self
            .registrations
            .lock()
            .drain()
            .map(|(_, registration)| registration)
            .collect();
        if drained.is_empty() {
            return;
        }
        debug!(
            target = "mirror.registry",
            owner = %self.owner,
            topics = drained.len(),
            "closing registrations"
        );
        drained.into_iter().for_each(Registration::abort);
    }
}

impl Drop for ProtocolRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_pump(
    owner: String,
    topic: String,
    mut rx: broadcast::Receiver<BusMessage>,
    handler: Handler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => match decode(&frame.payload) {
                    Ok(message) => handler(message),
                    Err(err) => {
                        error!(
                            target = "mirror.registry",
                            owner = %owner,
                            topic = %topic,
                            error = %err,
                            "dropping message"
                        );
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        target = "mirror.registry",
                        owner = %owner,
                        topic = %topic,
                        skipped,
                        "registration lagged; messages lost"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use transport_bus::LocalBus;

    use super::*;
    use crate::protocol::{LinkRequest, ProtocolMessage};

    fn counter_handler(counter: &Arc<AtomicUsize>) -> impl Fn(ProtocolMessage) + Send + Sync {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn duplicate_subscription_delivers_once() {
        let bus = Arc::new(LocalBus::new());
        let registry = ProtocolRegistry::new(bus.clone(), "test");
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(registry
            .subscribe(Operation::Connect, None, "back", counter_handler(&hits))
            .unwrap());
        assert!(!registry
            .subscribe(Operation::Connect, None, "back", counter_handler(&hits))
            .unwrap());
        assert_eq!(bus.subscriber_count("2"), 1);

        let other = ProtocolRegistry::new(bus.clone(), "peer");
        other
            .publish(Operation::Connect, None, &ProtocolMessage::Link(LinkRequest::default()))
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.unsubscribe(Operation::Connect, None, "back"));
        assert!(!registry.unsubscribe(Operation::Connect, None, "back"));
        assert!(!registry.is_registered(Operation::Connect, None));
        settle().await;
        assert_eq!(bus.subscriber_count("2"), 0);
        other
            .publish(Operation::Connect, None, &ProtocolMessage::Link(LinkRequest::default()))
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pull_replaces_previous_consumer() {
        let bus = Arc::new(LocalBus::new());
        let registry = ProtocolRegistry::new(bus.clone(), "test");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry
            .pull(Operation::SendQueued, Some("0"), counter_handler(&first))
            .unwrap();
        registry
            .pull(Operation::SendQueued, Some("0"), counter_handler(&second))
            .unwrap();
        assert_eq!(registry.handler_count(Operation::SendQueued, Some("0")), 1);

        registry
            .publish(Operation::SendQueued, Some("0"), &ProtocolMessage::Link(LinkRequest::default()))
            .unwrap();
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_topics_unsubscribe_quietly() {
        let registry = ProtocolRegistry::new(Arc::new(LocalBus::new()), "test");
        assert!(!registry.unsubscribe_topic(Operation::Link, Some("nobody-0")));
        assert!(!registry.unsubscribe(Operation::Connect, None, "missing"));
    }

    #[tokio::test]
    async fn patterns_are_enforced() {
        let registry = ProtocolRegistry::new(Arc::new(LocalBus::new()), "test");
        let err = registry
            .subscribe(Operation::SendQueued, Some("0"), "k", |_| {})
            .unwrap_err();
        assert!(err.is_misuse());
        let err = registry.pull(Operation::Connect, None, |_| {}).unwrap_err();
        assert!(err.is_misuse());
    }

    #[tokio::test]
    async fn undecodable_frames_are_skipped() {
        let bus = Arc::new(LocalBus::new());
        let registry = ProtocolRegistry::new(bus.clone(), "test");
        let hits = Arc::new(AtomicUsize::new(0));
        registry
            .pull(Operation::SendFront, Some("a-0"), counter_handler(&hits))
            .unwrap();

        bus.publish("12-a-0", bytes::Bytes::from_static(b"not json"))
            .unwrap();
        registry
            .publish(Operation::SendFront, Some("a-0"), &ProtocolMessage::Link(LinkRequest::default()))
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
