pub mod caretaker;
pub mod config;
pub mod dispatch;
pub mod handler;
pub mod memory;
pub mod pool;
pub mod throttle;
pub mod throughput;

pub use caretaker::Caretaker;
pub use config::PoolConfig;
pub use dispatch::{Decision, route};
pub use handler::{ActionHandler, HandlerRegistry, PassThroughHandler};
pub use pool::ConsumerPool;
