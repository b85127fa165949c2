//! Concrete providers behind the catalog, device and fetch seams.

use std::time::Duration;

pub mod deezer;
pub mod filesystem;
pub mod http_fetcher;

/// Builds the blocking HTTP agent shared by the network backends.
pub fn http_agent(connect_timeout: Duration, read_timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(connect_timeout)
        .timeout_read(read_timeout)
        .timeout_write(read_timeout)
        .build()
}
