//! Coordinator protocol: a [`server`] exposing a `FailoverBroker` over HTTP and
//! the [`client`] backend that lets other nodes use it as their second tier.

pub mod client;
pub mod server;
pub mod types;

pub use client::{CoordinatorConnection, CoordinatorProxyFactory};
pub use server::{router, run_server};
