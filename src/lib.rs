pub mod record;
pub mod sink;
pub mod queue;
pub mod metrics;
pub mod shipper;
pub mod layer;

mod writer;

#[cfg(feature = "http")]
pub mod http;

pub mod env;
pub mod init;
pub mod memory;
