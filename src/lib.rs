//! skylink: a simulated thermostat that talks to an IoT hub
//!
//! The agent publishes temperature and humidity readings through the
//! `skylink_client` SDK, keeps publishing across reconnects, and lets the
//! cloud change its reporting interval.
//!
//! ## Modules
//!
//! * `config`: TOML configuration with `validator` checks. The `[device]`
//!   section is the SDK's own `ClientConfig`.
//!
//! * `core`: runtime pieces:
//!   - readiness tracking driven by the client's connection status
//!   - the telemetry loop and its sensor simulator
//!   - direct method and desired property handling
//!
//! * `logger`: `tracing` subscriber setup with console output (compact,
//!   pretty, JSON) and optional systemd journald.
//!
//! ## Features
//!
//! * `skylink-mqtt`: MQTT transport from `skylink_client` (default: enabled).
//!   Without it the agent builds but has no transport to connect with.

pub mod config;
pub mod core;
pub mod logger;
