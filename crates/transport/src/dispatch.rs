//! Delivery of complete inbound frames to registered handlers.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::framing::{Frame, FrameType};

pub type Handler = Arc<dyn Fn(&Frame) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    /// Sees every frame, ahead of type-specific handlers.
    Wildcard,
    Type(FrameType),
}

#[derive(Default, Clone)]
pub struct Dispatcher {
    wildcard: Vec<Handler>,
    by_type: HashMap<FrameType, Vec<Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: HandlerKey, handler: Handler) {
        match key {
            HandlerKey::Wildcard => self.wildcard.push(handler),
            HandlerKey::Type(frame_type) => {
                self.by_type.entry(frame_type).or_default().push(handler)
            }
        }
    }

    /// Handlers that would run for `frame_type`, in invocation order.
    pub fn handlers_for(&self, frame_type: FrameType) -> Vec<Handler> {
        let typed = self.by_type.get(&frame_type).map(Vec::as_slice).unwrap_or_default();
        self.wildcard.iter().chain(typed).cloned().collect()
    }

    /// Runs every matching handler; returns how many failed.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        run_handlers(&self.handlers_for(frame.frame_type), frame)
    }
}

/// Invokes `handlers` in order. A failing or panicking handler is logged and
/// does not stop the rest.
pub fn run_handlers(handlers: &[Handler], frame: &Frame) -> usize {
    let mut failures = 0;
    for (position, handler) in handlers.iter().enumerate() {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(frame))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                log::error!(
                    "Handler #{} failed on {:?} frame from {}: {:#}",
                    position,
                    frame.frame_type,
                    frame.source,
                    e
                );
            }
            Err(_) => {
                failures += 1;
                log::error!(
                    "Handler #{} panicked on {:?} frame from {}",
                    position,
                    frame.frame_type,
                    frame.source
                );
            }
        }
    }
    failures
}
