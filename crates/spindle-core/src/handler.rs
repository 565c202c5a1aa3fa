use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::app::worker_loop::MessageContext;
use crate::domain::header_keys;

/// Outcome of a handler that did not succeed. Either way the message is
/// rolled back and handed to the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    /// Explicit rollback, optionally asking for a specific redelivery delay.
    #[error("rollback requested")]
    Rollback { delay: Option<Duration> },
}

impl HandlerError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        HandlerError::Failed(reason.to_string())
    }

    pub fn rollback() -> Self {
        HandlerError::Rollback { delay: None }
    }

    pub fn rollback_after(delay: Duration) -> Self {
        HandlerError::Rollback { delay: Some(delay) }
    }
}

/// User processing logic.
///
/// The handler sees the message only through `MessageContext` and cannot keep
/// it past its own return.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &MessageContext<'_>) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a handler is already registered for '{0}'")]
    DuplicateHandler(String),
}

/// Routes messages to handlers by message type.
///
/// Built during initialization, read-only while workers run. The route key is
/// the `spindle.message.type` header, else the `spindle.job.name` header of
/// scheduled job messages; unmatched messages go to the fallback handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        route: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RegistryError> {
        let route = route.into();
        if self.handlers.contains_key(&route) {
            return Err(RegistryError::DuplicateHandler(route));
        }
        self.handlers.insert(route, handler);
        Ok(())
    }

    /// Handler for messages without a registered route.
    pub fn fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, route: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(route)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn route<'m>(message: &'m MessageContext<'_>) -> Option<&'m str> {
        message
            .headers()
            .get_str(header_keys::MESSAGE_TYPE)
            .or_else(|| message.headers().get_str(header_keys::JOB_NAME))
    }
}

#[async_trait]
impl MessageHandler for HandlerRegistry {
    async fn handle(&self, message: &MessageContext<'_>) -> Result<(), HandlerError> {
        let route = Self::route(message);
        let handler = route
            .and_then(|r| self.handlers.get(r))
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                HandlerError::Failed(format!(
                    "no handler registered for {}",
                    route.unwrap_or("<untyped message>")
                ))
            })?;
        handler.handle(message).await
    }
}
