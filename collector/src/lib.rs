pub mod alert;
pub mod config;
pub mod errors;
pub mod firmware;
pub mod limits;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod rest;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;
pub mod validate;

pub use errors::{Error, Result};
