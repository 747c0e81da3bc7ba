//! Per-client callback registry.
//!
//! One slot per [`Event`]. Registering again replaces the slot, and events
//! without a handler are dropped. Handlers run on the read-loop thread, in
//! decode order, one at a time; a handler that fails or panics is logged and
//! counted, and dispatch carries on with the next record.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{trace, warn};

use crate::errors::Result;
use crate::types::{Event, Record, Value};

/// Caller-supplied callback.
///
/// Implemented for every `Fn(Value) -> anyhow::Result<()>` closure. Handlers
/// are invoked on the read-loop thread and should return quickly.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, value: Value) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, value: Value) -> anyhow::Result<()> {
        self(value)
    }
}

/// What happened to one dispatched value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// No handler registered for the event.
    Dropped,
    /// The handler returned an error or panicked.
    Failed,
}

#[derive(Default)]
pub struct HandlerRegistry {
    slots: RwLock<HashMap<Event, Arc<dyn Handler>>>,
    failures: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `event`, replacing any previous one.
    ///
    /// Takes effect from the next dispatch, including on a running session.
    pub fn register<H: Handler>(&self, event: Event, handler: H) {
        self.write().insert(event, Arc::new(handler));
    }

    /// Like [`register`](Self::register) with an event name such as `"blinkStrength"`.
    pub fn register_named<H: Handler>(&self, name: &str, handler: H) -> Result<()> {
        let event = name.parse::<Event>()?;
        self.register(event, handler);
        Ok(())
    }

    /// Remove the handler for `event`. Returns whether one was installed.
    pub fn unregister(&self, event: Event) -> bool {
        self.write().remove(&event).is_some()
    }

    pub fn is_registered(&self, event: Event) -> bool {
        self.read().contains_key(&event)
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Number of handler invocations that failed or panicked so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver a decoded record to the handler for its event.
    pub fn dispatch(&self, record: &Record) -> Dispatch {
        match self.handler(record.event) {
            Some(handler) => self.invoke(record.event, handler, record.value.clone()),
            None => {
                trace!("no handler for {} (code {:#04X})", record.event, record.code);
                Dispatch::Dropped
            }
        }
    }

    /// Deliver `value` to the handler for `event`.
    pub fn emit(&self, event: Event, value: Value) -> Dispatch {
        match self.handler(event) {
            Some(handler) => self.invoke(event, handler, value),
            None => Dispatch::Dropped,
        }
    }

    fn handler(&self, event: Event) -> Option<Arc<dyn Handler>> {
        self.read().get(&event).cloned()
    }

    // The slot lock is released before the handler runs, so a handler may
    // itself register or unregister.
    fn invoke(&self, event: Event, handler: Arc<dyn Handler>, value: Value) -> Dispatch {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(value))) {
            Ok(Ok(())) => Dispatch::Delivered,
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("{} handler failed: {:#}", event, e);
                Dispatch::Failed
            }
            Err(payload) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("{} handler panicked: {}", event, panic_message(payload.as_ref()));
                Dispatch::Failed
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Event, Arc<dyn Handler>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Event, Arc<dyn Handler>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
