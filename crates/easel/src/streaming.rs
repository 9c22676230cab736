//! Incremental output handling shared by every provider.
//!
//! Each backend's raw fragments are reduced by a [`StreamNormalizer`] to
//! canonical [`StreamEvent`]s, which a [`TurnBuilder`] folds into one
//! assistant turn while forwarding visible text to the caller's sink.
pub mod accumulator;
pub mod event;
pub mod normalizer;
pub mod sink;
pub mod transport;
pub mod turn;

pub use accumulator::{CompletedCall, ToolCallAccumulator};
pub use event::{StopReason, StreamEvent};
pub use normalizer::{BlockState, BlockTracker, StreamNormalizer};
pub use sink::{ChannelSink, SinkEvent, StreamSink, StreamingContext};
pub use turn::{Turn, TurnBuilder};
