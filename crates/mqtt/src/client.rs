//! Construction of the underlying rumqttc client and event loop.
//!
//! `ClientBuilder` turns a validated [`Config`](super::Config) into an
//! `AsyncClient` (for sending commands) and an `EventLoop` (polled by the
//! connection kernel). The two must be used together: the client is
//! thread-safe and cloneable, the event loop belongs to exactly one task.

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use validator::Validate;

use super::{config::Config, error::TransferError};

/// Builder producing a rumqttc client/event-loop pair.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
}

impl ClientBuilder {
    /// Minimal builder for tests and ad-hoc tools.
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap: 10,
        }
    }

    /// Builds from a configuration struct, validating it first so that a
    /// programmatically constructed config fails here rather than at the
    /// first poll.
    ///
    /// An empty `client_id` is replaced with a fresh UUID; MQTT allows an
    /// empty id but brokers then assign one, which breaks session
    /// persistence across reconnects.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };

        let mut opts = MqttOptions::new(client_id, config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            opts.set_credentials(username.clone(), password.clone());
        }

        Ok(Self {
            opts,
            cap: config.request_channel_capacity,
        })
    }

    /// Creates the client and its event loop. Consumes the builder.
    pub fn build(self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.opts, self.cap)
    }
}
