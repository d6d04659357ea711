//! Deploy Client
//!
//! Client side of the deploy service: an HTTP client for its endpoints and a
//! poller that watches a deployment until it settles.

pub mod poller;
pub mod service_client;

pub use poller::{PollOutcome, Poller, PollerConfig, StatusSource};
pub use service_client::ServiceClient;
