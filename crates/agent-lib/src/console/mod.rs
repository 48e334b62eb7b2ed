//! Per-workload console streaming: log fan-out with replay, and command
//! injection back into the container.

mod manager;
mod stream;

pub use manager::StreamManager;
pub use stream::{
    ConsoleStream, StreamState, SubscriberId, REPLAY_BUFFER_LINES, SUBSCRIBER_QUEUE_DEPTH,
};
