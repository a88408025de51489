//! Engine telemetry.

mod emitter;

pub use emitter::{EngineEvent, EventEmitter, EventSink, TracingSink};
