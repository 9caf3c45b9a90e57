use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bus::MessageBus;

/// Failure of an upstream message, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub hostname: String,
    pub creation_date: DateTime<Utc>,
    /// Category the message was consumed from.
    pub category: String,
    pub error: String,
    pub message: serde_json::Value,
}

/// Handle for reporting failed messages
///
/// This is cheaply cloneable. Reports go through a bounded channel to the
/// [`ErrorReportWriter`]; a full or closed channel drops the report with a log.
#[derive(Clone)]
pub struct ErrorReportHandle {
    tx: mpsc::Sender<ErrorReport>,
    hostname: String,
}

impl ErrorReportHandle {
    pub fn new(tx: mpsc::Sender<ErrorReport>, hostname: impl Into<String>) -> Self {
        Self {
            tx,
            hostname: hostname.into(),
        }
    }

    /// Queue a report without waiting. Returns false when it was dropped.
    pub fn report(&self, category: &str, error: &str, message: serde_json::Value) -> bool {
        let report = ErrorReport {
            hostname: self.hostname.clone(),
            creation_date: Utc::now(),
            category: category.to_string(),
            error: error.to_string(),
            message,
        };
        match self.tx.try_send(report) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to queue error report: {}", e);
                false
            }
        }
    }
}

/// Background task publishing error reports to the bus
pub struct ErrorReportWriter {
    rx: mpsc::Receiver<ErrorReport>,
    bus: Arc<dyn MessageBus>,
    category: String,
}

impl ErrorReportWriter {
    pub fn new(
        rx: mpsc::Receiver<ErrorReport>,
        bus: Arc<dyn MessageBus>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            rx,
            bus,
            category: category.into(),
        }
    }

    /// Publish reports until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!("Error report writer started");

        while let Some(report) = self.rx.recv().await {
            let body = match serde_json::to_value(&report) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("Failed to encode error report: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.bus.publish(&self.category, &body).await {
                tracing::error!(
                    "Failed to publish error report for {}: {}",
                    report.category,
                    e
                );
            }
        }

        tracing::info!("Error report writer shutting down");
    }
}

/// Create the error repository pair
///
/// Spawn the writer with `tokio::spawn(writer.run())` and clone the handle into
/// every consumer.
pub fn create_error_repository(
    bus: Arc<dyn MessageBus>,
    category: impl Into<String>,
    hostname: impl Into<String>,
    buffer_size: usize,
) -> (ErrorReportHandle, ErrorReportWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let handle = ErrorReportHandle::new(tx, hostname);
    let writer = ErrorReportWriter::new(rx, bus, category);
    (handle, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMessageBus;

    #[tokio::test]
    async fn test_writer_publishes_reports() {
        let bus = MockMessageBus::new();
        let (handle, writer) = create_error_repository(Arc::new(bus.clone()), "errors", "pod-1", 8);

        assert!(handle.report(
            "catalog-event",
            "no task table routed for product type X",
            serde_json::json!({"product_name": "X"}),
        ));
        drop(handle);
        writer.run().await;

        let published = bus.published("errors").await;
        assert_eq!(published.len(), 1);
        let report: ErrorReport = serde_json::from_value(published[0].clone()).unwrap();
        assert_eq!(report.hostname, "pod-1");
        assert_eq!(report.category, "catalog-event");
        assert_eq!(report.message["product_name"], "X");
    }

    #[test]
    fn test_full_channel_drops_report() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ErrorReportHandle::new(tx, "pod-1");

        assert!(handle.report("c", "first", serde_json::Value::Null));
        assert!(!handle.report("c", "second", serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_writer() {
        let bus = MockMessageBus::new();
        bus.set_fail_publish(true).await;
        let (handle, writer) = create_error_repository(Arc::new(bus.clone()), "errors", "pod-1", 8);

        handle.report("c", "one", serde_json::Value::Null);
        handle.report("c", "two", serde_json::Value::Null);
        drop(handle);
        writer.run().await;

        assert!(bus.published("errors").await.is_empty());
    }
}
