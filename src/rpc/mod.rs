#[macro_use]
mod macros;
pub mod bulk;
pub mod capsule;
pub mod client;
pub mod config;
pub mod context;
pub mod counters;
mod dispatcher;
pub mod loopback;
pub mod peer;
pub mod rpc_common;
pub mod server;
pub mod service;
pub mod timer;
pub mod transport;
pub mod workitem;
