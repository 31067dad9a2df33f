//! High-level application primitives.
//!
//! This crate provides the primitives needed to bootstrap a relay process before it starts running: initializing
//! logging and loading layered configuration.
#![deny(missing_docs)]

pub mod config;
pub mod logging;

/// Anything that can be returned from the bootstrap process.
pub type GenericError = anyhow::Error;
