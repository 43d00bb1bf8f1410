#![deny(missing_docs)]

//! This crate exposes a single physical serial port as many virtual serial ports.
//!
//! Each virtual port is a pseudo terminal, linked at `<prefix><id>` (e.g. `/dev/gps0`).
//! Consumers open these as if each was its own device.
//! Every byte read from the physical port is written to every virtual port, in order.
//!
//! How many virtual ports to create comes from a `key=value` settings file.
//! The run goes through provisioning, then replicates until either a termination
//! signal arrives or the physical port goes away.

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

/// Resolves the endpoint count from the settings file.
pub mod settings;

/// Endpoint ids and their paths.
pub mod endpoint;

/// Clearing leftovers before endpoints are brought up.
pub mod provision;

/// The physical serial source.
pub mod source;

/// Replicates the source to every endpoint.
pub mod broadcast;

/// Pseudo terminal backed virtual serial ports.
pub mod virtual_port;

/// Runs the whole thing and tears it down.
pub mod supervisor;
