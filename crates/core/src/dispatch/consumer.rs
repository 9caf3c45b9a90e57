use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex_lite::Regex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bus::{Ack, BusError, BusMessage, MessageBus};
use crate::config::{ConsumerConfig, ConsumerFilterConfig};
use crate::job::{CatalogEvent, CatalogEventMessage};
use crate::metrics::MESSAGES_CONSUMED;

use super::error_repo::ErrorReportHandle;
use super::DispatchError;

/// Processes one decoded upstream message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: &CatalogEventMessage) -> Result<(), DispatchError>;
}

/// Accepts events by product family, then by object storage key.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    product_family: Option<String>,
    key_pattern: Option<Regex>,
}

impl MessageFilter {
    pub fn new(config: &ConsumerFilterConfig) -> Result<Self, DispatchError> {
        let key_pattern = config
            .match_regex
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| DispatchError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;
        Ok(Self {
            product_family: config.product_family.clone(),
            key_pattern,
        })
    }

    pub fn accepts(&self, event: &CatalogEvent) -> bool {
        if let Some(ref family) = self.product_family {
            if &event.product_family != family {
                return false;
            }
        }
        match self.key_pattern {
            Some(ref pattern) => pattern.is_match(&event.key_object_storage),
            None => true,
        }
    }
}

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Empty,
    Handled,
    /// Rejected by the filter and acknowledged.
    Filtered,
    /// Not a catalog event.
    Invalid,
    /// The handler failed; reported and acknowledged negatively.
    Failed,
}

impl ConsumeOutcome {
    fn label(&self) -> &'static str {
        match self {
            ConsumeOutcome::Empty => "empty",
            ConsumeOutcome::Handled => "ok",
            ConsumeOutcome::Filtered => "filtered",
            ConsumeOutcome::Invalid => "invalid",
            ConsumeOutcome::Failed => "error",
        }
    }
}

/// Poll loop over one bus category.
pub struct EventConsumer {
    config: ConsumerConfig,
    bus: Arc<dyn MessageBus>,
    filter: MessageFilter,
    handler: Arc<dyn EventHandler>,
    errors: ErrorReportHandle,

    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventConsumer {
    pub fn new(
        config: ConsumerConfig,
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn EventHandler>,
        errors: ErrorReportHandle,
    ) -> Result<Self, DispatchError> {
        let filter = MessageFilter::new(&config.filter)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            bus,
            filter,
            handler,
            errors,
            running: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
        })
    }

    pub fn category(&self) -> &str {
        &self.config.category
    }

    /// Ask the loop to exit after its current message.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Poll until stopped. Bus errors are logged and the loop goes on.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        info!(category = self.category(), "Consumer started");

        let initial_delay = Duration::from_millis(self.config.initial_delay_ms);
        if !initial_delay.is_zero() {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
        }

        let interval = Duration::from_millis(self.config.polling_interval_ms);
        while self.running.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Ok(outcome) => debug!(category = self.category(), "Poll: {:?}", outcome),
                Err(e) => warn!(category = self.category(), "Bus error while consuming: {}", e),
            }
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(category = self.category(), "Consumer stopped");
    }

    /// Fetch, filter, handle and acknowledge at most one message.
    pub async fn poll_once(&self) -> Result<ConsumeOutcome, BusError> {
        let Some(message) = self.bus.poll(self.category()).await? else {
            return Ok(ConsumeOutcome::Empty);
        };
        let outcome = self.process(&message).await?;
        MESSAGES_CONSUMED
            .with_label_values(&[self.category(), outcome.label()])
            .inc();
        Ok(outcome)
    }

    async fn process(&self, message: &BusMessage) -> Result<ConsumeOutcome, BusError> {
        let event: CatalogEvent = match serde_json::from_value(message.body.clone()) {
            Ok(event) => event,
            Err(e) => {
                let error = DispatchError::InvalidEvent(e.to_string()).to_string();
                warn!(category = self.category(), "Message {}: {}", message.id, error);
                self.errors
                    .report(self.category(), &error, message.body.clone());
                self.bus
                    .ack(self.category(), &Ack::error(message.id, error))
                    .await?;
                return Ok(ConsumeOutcome::Invalid);
            }
        };

        if !self.filter.accepts(&event) {
            debug!(
                category = self.category(),
                "Message {} ({}) filtered out",
                message.id,
                event.product_name
            );
            self.bus.ack(self.category(), &Ack::ok(message.id)).await?;
            return Ok(ConsumeOutcome::Filtered);
        }

        let event_message = CatalogEventMessage {
            id: message.id,
            input_key: message.input_key.clone(),
            body: event,
        };
        match self.handler.handle(&event_message).await {
            Ok(()) => {
                self.bus.ack(self.category(), &Ack::ok(message.id)).await?;
                Ok(ConsumeOutcome::Handled)
            }
            Err(e) => {
                let error = e.to_string();
                error!(
                    category = self.category(),
                    "Failed to handle message {} ({}): {}",
                    message.id,
                    event_message.body.product_name,
                    error
                );
                self.errors
                    .report(self.category(), &error, message.body.clone());
                self.bus
                    .ack(self.category(), &Ack::error(message.id, error))
                    .await?;
                Ok(ConsumeOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AckOutcome;
    use crate::dispatch::create_error_repository;
    use crate::testing::{fixtures, MockMessageBus};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, message: &CatalogEventMessage) -> Result<(), DispatchError> {
            self.seen.lock().await.push(message.id);
            if self.fail {
                return Err(DispatchError::NoRoute(message.body.product_type.clone()));
            }
            Ok(())
        }
    }

    fn config(filter: ConsumerFilterConfig) -> ConsumerConfig {
        ConsumerConfig {
            category: "catalog-event".to_string(),
            polling_interval_ms: 5,
            initial_delay_ms: 0,
            filter,
        }
    }

    fn consumer(
        bus: &MockMessageBus,
        handler: Arc<RecordingHandler>,
        filter: ConsumerFilterConfig,
    ) -> (EventConsumer, crate::dispatch::ErrorReportWriter) {
        let (errors, writer) = create_error_repository(Arc::new(bus.clone()), "errors", "pod-1", 8);
        let consumer = EventConsumer::new(config(filter), Arc::new(bus.clone()), handler, errors)
            .unwrap();
        (consumer, writer)
    }

    fn event_body(name: &str) -> serde_json::Value {
        serde_json::to_value(fixtures::segment_event(name, "dt-1")).unwrap()
    }

    #[tokio::test]
    async fn test_handled_message_is_acked() {
        let bus = MockMessageBus::new();
        let handler = Arc::new(RecordingHandler::default());
        let (consumer, _writer) = consumer(&bus, handler.clone(), Default::default());
        let id = bus.push("catalog-event", event_body("S1A_IW_RAW__0S_0001")).await;

        assert_eq!(consumer.poll_once().await.unwrap(), ConsumeOutcome::Handled);
        assert_eq!(consumer.poll_once().await.unwrap(), ConsumeOutcome::Empty);

        assert_eq!(*handler.seen.lock().await, vec![id]);
        let acks = bus.acks().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].1.outcome, AckOutcome::Ok);
    }

    #[tokio::test]
    async fn test_filtered_message_is_acked_not_handled() {
        let bus = MockMessageBus::new();
        let handler = Arc::new(RecordingHandler::default());
        let filter = ConsumerFilterConfig {
            product_family: Some("L0_SEGMENT".to_string()),
            match_regex: Some("^S1B_.*$".to_string()),
        };
        let (consumer, _writer) = consumer(&bus, handler.clone(), filter);
        bus.push("catalog-event", event_body("S1A_IW_RAW__0S_0001")).await;

        assert_eq!(consumer.poll_once().await.unwrap(), ConsumeOutcome::Filtered);
        assert!(handler.seen.lock().await.is_empty());
        assert_eq!(bus.acks().await[0].1.outcome, AckOutcome::Ok);
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let bus = MockMessageBus::new();
        let handler = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });
        let (consumer, writer) = consumer(&bus, handler, Default::default());
        bus.push("catalog-event", event_body("S1A_IW_RAW__0S_0001")).await;

        assert_eq!(consumer.poll_once().await.unwrap(), ConsumeOutcome::Failed);
        let acks = bus.acks().await;
        assert_eq!(acks[0].1.outcome, AckOutcome::Error);
        assert!(acks[0].1.error.as_deref().unwrap().contains("IW_RAW__0S"));

        drop(consumer);
        writer.run().await;
        assert_eq!(bus.published("errors").await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_body_is_rejected() {
        let bus = MockMessageBus::new();
        let handler = Arc::new(RecordingHandler::default());
        let (consumer, _writer) = consumer(&bus, handler.clone(), Default::default());
        bus.push("catalog-event", serde_json::json!({"unexpected": true})).await;

        assert_eq!(consumer.poll_once().await.unwrap(), ConsumeOutcome::Invalid);
        assert!(handler.seen.lock().await.is_empty());
        assert_eq!(bus.acks().await[0].1.outcome, AckOutcome::Error);
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let bus = MockMessageBus::new();
        let handler = Arc::new(RecordingHandler::default());
        let (consumer, _writer) = consumer(&bus, handler.clone(), Default::default());
        let consumer = Arc::new(consumer);
        bus.push("catalog-event", event_body("S1A_IW_RAW__0S_0001")).await;
        bus.push("catalog-event", event_body("S1A_IW_RAW__0S_0002")).await;

        let task = tokio::spawn({
            let consumer = Arc::clone(&consumer);
            async move { consumer.run().await }
        });
        for _ in 0..100 {
            if bus.pending("catalog-event").await == 0 && handler.seen.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        consumer.stop();
        task.await.unwrap();

        assert_eq!(handler.seen.lock().await.len(), 2);
    }

    #[test]
    fn test_invalid_filter_pattern() {
        let filter = ConsumerFilterConfig {
            product_family: None,
            match_regex: Some("(".to_string()),
        };
        assert!(matches!(
            MessageFilter::new(&filter),
            Err(DispatchError::InvalidPattern { .. })
        ));
    }
}
