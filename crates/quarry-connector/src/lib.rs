//! Connector abstraction for upstream fetchers.
//!
//! Connectors are stateless with respect to the queue. Failures travel
//! in-band (a non-2xx status or a populated `error_message`), never as an
//! `Err` across the runner boundary, so the runner's claim/complete
//! bookkeeping can't be broken by a connector.

pub mod http;
pub mod rate;
pub mod test_connector;
pub mod types;

pub use http::HttpConnector;
pub use rate::RateClock;
pub use test_connector::{create_test_work_items, TestConnector, SYNTHETIC_RESOURCE_COUNT};
pub use types::{Connector, ConnectorRequest, ConnectorResponse};
