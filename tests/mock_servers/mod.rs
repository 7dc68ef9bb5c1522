//! Mock servers for hub integration testing
//!
//! These mock servers simulate a real home-automation hub (WebSocket API and
//! OAuth token endpoint), allowing full transport tests without a hub on the
//! network.

pub mod hub;

pub use hub::MockHubServer;
