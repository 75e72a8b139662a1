pub mod action;
pub mod errors;
pub mod service;

pub use action::{Action, ActionChain, ChainError};
pub use service::{QueueIdentity, Service};
