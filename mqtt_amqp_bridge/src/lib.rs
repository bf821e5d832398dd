#![warn(missing_docs)]

//! Per-connection MQTT 3.1/3.1.1 protocol processor bridging MQTT clients to an AMQP 0-9-1 broker

pub use crate::config::{BridgeConfig, BridgeConfigBuilder, BridgeConfigBuilderError};

pub mod auth;
mod config;
pub mod control_packet;
pub mod error;
pub mod interface;
pub mod interface_mocks;
pub mod session;
pub mod topic;

#[macro_use]
extern crate derive_builder;

//----------------------------------------------------------------------

/// Include the README doc on a struct when running doctests to validate that the code in the
/// README can compile to verify that it has not rotted.
/// Note that any code that requires network or environment setup will not be able to run,
/// and thus should be annotated by "no_run" in the README.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;
