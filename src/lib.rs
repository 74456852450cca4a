//! warren: a queue consumer daemon built on `warren-amqp`.
//!
//! The daemon keeps one queue consumed for as long as it runs, riding out
//! broker restarts and network faults through the client's recovery loops.
//! Failing messages are retried once and then dead-lettered.
//!
//! ## Modules
//!
//! * `config`: TOML configuration with `[logger]` and `[broker]` tables,
//!   validated with the `validator` crate.
//!
//! * `core`: the delivery handler and OS signal handling.
//!
//! * `logger`: global `tracing` subscriber with console output (compact,
//!   pretty, JSON) and optional systemd journald output.
//!
//! ## Features
//!
//! * `amqp`: RabbitMQ transport through `lapin` (default: enabled).
//!
//! * `memory`: the in-process broker. A build with `memory` but without
//!   `amqp` runs against it, which is only useful for local smoke tests.

pub mod config;
pub mod core;
pub mod logger;
