use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spindle_core::app::MessageContext;
use spindle_core::domain::{MessageEvent, header_keys};
use spindle_core::impls::InMemoryBackend;
use spindle_core::queue::Backoff;
use spindle_core::{
    ConsumerConfig, HandlerError, HandlerRegistry, MessageHandler, QueueBuilder, QueueOptions,
    RetryPolicy, SchedulerConfig, SendOptions,
};

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Fails the first `n` deliveries to show requeue with backoff.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl MessageHandler for HelloHandler {
    async fn handle(&self, message: &MessageContext<'_>) -> Result<(), HandlerError> {
        let payload: HelloPayload = message.json()?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::failed(format!(
                "intentional failure (left={left}, attempt={})",
                message.error_count() + 1
            )));
        }

        info!(id = %message.id(), "Hello, {}!", payload.name);
        Ok(())
    }
}

struct TickJob;

#[async_trait]
impl MessageHandler for TickJob {
    async fn handle(&self, message: &MessageContext<'_>) -> Result<(), HandlerError> {
        let slot = message
            .headers()
            .get_str(header_keys::JOB_SCHEDULED_TIME)
            .unwrap_or("?");
        info!(%slot, "scheduled job ran");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // (A) queue on in-memory storage, with the standard middleware
    let backend = InMemoryBackend::new();
    let queue = QueueBuilder::new(Arc::new(backend.adapter("demo")))
        .options(QueueOptions::standard())
        .standard_layers()
        .build()
        .await?;

    // (B) handlers routed by message type / job name
    let mut registry = HandlerRegistry::new();
    registry.register("hello", Arc::new(HelloHandler::new(2)))?;
    registry.register("tick", Arc::new(TickJob))?;

    let retry = RetryPolicy::new(
        5,
        Backoff::Linear {
            step: Duration::from_millis(200),
        },
    );
    let config = ConsumerConfig::default()
        .with_workers(2)
        .with_lease(Duration::from_secs(3))
        .with_retry(retry);
    let pool = queue.start_workers(Arc::new(registry), config)?;

    // (C) a recurring job every two seconds
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut scheduler = queue.scheduler(SchedulerConfig::default());
    scheduler.schedule("tick", "second(*%2)", Vec::new())?;
    let scheduler = scheduler.spawn(stop_rx);

    // (D) send one message and wait for its completion event
    let producer = queue.producer();
    let mut events = producer.subscribe();
    let sent = producer
        .send_json(
            &serde_json::json!({ "name": "spindle" }),
            SendOptions::new().message_type("hello"),
        )
        .await?;
    info!(id = %sent.id, correlation = %sent.correlation_id, "message sent");

    let wait = tokio::time::timeout(Duration::from_secs(10), async {
        while let Ok(event) = events.recv().await {
            match event {
                MessageEvent::Completed { id, .. } if id == sent.id => return true,
                MessageEvent::Poisoned { id, .. } if id == sent.id => return false,
                _ => {}
            }
        }
        false
    })
    .await;
    match wait {
        Ok(true) => info!("message completed"),
        Ok(false) => warn!("message ended in error"),
        Err(_) => warn!("timed out waiting for completion"),
    }

    // (E) let the scheduler fire a few times, then stop everything
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    let _ = stop_tx.send(true);
    let _ = scheduler.await;
    let report = pool.shutdown().await;
    info!(?report, "workers stopped");
    info!(counts = ?queue.inspector().counts().await?, "final counts");
    queue.dispose();
    Ok(())
}
