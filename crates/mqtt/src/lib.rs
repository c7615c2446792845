//! # parkgate-mqtt: broker client for the gateway pipeline
//!
//! A thin reliability layer over `rumqttc` providing the connection
//! discipline the gateway and subscriber need:
//!
//! - **Bounded connect retries**: `connect(retry_attempts, retry_delay)`
//!   makes an observable number of attempts, each waiting for CONNACK under
//!   a configured timeout, and reports success as a plain `bool`.
//! - **Automatic re-subscription**: every topic filter registered with
//!   [`BrokerClient::subscribe`] is re-issued to the broker on each
//!   successful (re)connection, so subscriptions survive broker restarts
//!   and network blips.
//! - **Callback dispatch off the wire**: inbound publishes are matched
//!   against registered filters (MQTT `+`/`#` wildcards) and handed to the
//!   registered handlers; handler errors are logged on the event-loop task
//!   and never propagate.
//! - **State monitoring**: connection lifecycle transitions
//!   (`Connecting -> Connected -> Disconnected -> Reconnecting`) are
//!   published on a watch channel.
//! - **Exponential backoff** between reconnect attempts once a connection
//!   has been established.
//!
//! Delivery is at-most-once from the caller's point of view: `publish`
//! reports whether the local hand-off succeeded, nothing more. Broker-side
//! QoS (0/1/2) only governs broker-to-subscriber delivery.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod state;

pub use client::ClientBuilder;
pub use config::Config;
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{BrokerClient, HandlerError, MessageHandler};
pub use state::{ClientStats, ConnectionState};

/// Result type for MQTT operations.
pub type Result<T> = std::result::Result<T, TransferError>;
