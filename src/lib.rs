//! parkgate — access-control edge gateway over MQTT
//!
//! This crate implements the messaging pipeline of a site access-control
//! system: a gateway process that periodically collects detection events
//! from field sensors, buffers and publishes them onto an MQTT broker with
//! reconnect and retry discipline, emits periodic heartbeat/status and
//! threshold-triggered capacity alerts, and a companion subscriber that
//! decodes the published stream into a bounded in-memory view.
//!
//! Delivery is at-most-once by design: no persistent queue, no redelivery,
//! no replay. Broker-level QoS governs broker-to-subscriber reliability
//! only.
//!
//! ## Modules
//!
//! * `config` — Configuration structures, TOML loading, validation, and
//!   defaults (validated via the `validator` crate).
//!
//! * `core` — Core runtime components:
//!   - Message codec (wire envelopes, monotonic message ids)
//!   - Sensor boundary (capability trait + simulated implementations)
//!   - Publishing gateway (collect/publish/heartbeat/alert loop)
//!   - Subscriber (bounded cache, category callbacks, queries)
//!
//! * `logger` — Centralized logging initialization using `tracing`, with
//!   console output in multiple formats and optional journald integration.
//!
//! The broker client itself (connect retries, re-subscription, callback
//! dispatch) lives in the `parkgate-mqtt` workspace crate.

pub mod config;
pub mod core;
pub mod logger;
