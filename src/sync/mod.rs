//! Queue-to-record synchronization: merge planning and the flush engine.

pub mod flush;
pub mod merge;
