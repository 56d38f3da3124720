//! In-process handler table

use super::{DispatchError, Dispatcher};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Handler invoked with the event name and its raw JSON body
pub type EventHandler = Arc<dyn Fn(&str, &[u8]) -> Result<(), DispatchError> + Send + Sync>;

/// Routes events to handlers registered by event name
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<DashMap<String, EventHandler>>,
    fallback: Option<EventHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event name, replacing any previous one
    pub fn on<F>(self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &[u8]) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        self.handlers.insert(event.into(), Arc::new(handler));
        self
    }

    /// Handler for events with no registered handler
    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[u8]) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl Dispatcher for HandlerTable {
    async fn dispatch(&self, event: &str, data: &[u8]) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(event)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.fallback.clone());

        match handler {
            Some(handler) => handler(event, data),
            None => {
                trace!(event, "No handler registered, dropping event");
                Ok(())
            }
        }
    }
}
