#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jkbms_lib
//!
//! This crate provides a client side session engine for JK-BMS (Battery Management System)
//! devices reachable over Bluetooth Low Energy.
//! It reassembles the chunked notification stream into frames, decodes settings, telemetry
//! and device-info frames, encodes register write commands and drives every configured
//! device through discovery, connection, initialisation and liveness supervision.
//!
//! ## Features
//!
//! The engine itself is transport agnostic; a backend implements [`transport::Transport`].
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `jkbms` command-line tool.
//!
//! ### Transport Features
//! - `btleplug`: Enables a transport over the host Bluetooth stack using the `btleplug` crate.
//!
//! ### Utility Features
//! - `bin-dependencies`: Enables all features required by the `jkbms` binary executable (currently `btleplug`).

/// Contains error types for the library.
mod error;
/// Defines the wire protocol: command encoder and frame decoders.
pub mod protocol;
/// Reassembly of notification chunks into frames.
pub mod reassembly;

pub mod clock;
pub mod config;
pub mod manager;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::Error;

/// Transport backed by the host Bluetooth stack.
#[cfg_attr(docsrs, doc(cfg(feature = "btleplug")))]
#[cfg(feature = "btleplug")]
pub mod bluetooth;
