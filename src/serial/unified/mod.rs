pub mod reader;
pub mod types;

pub use reader::{ListenerBuilder, ListenerHandle};
pub use types::{
    CommandResponse, CommandSpec, LinkObserver, ListenerMetrics, ResponseMatcher, SerialCommand,
};
