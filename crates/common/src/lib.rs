//! Shared types for the ephemeral-environment harness.

#![warn(clippy::pedantic)]

/// Module for the harness error taxonomy
pub mod error;

/// Module for the shared data model (identities, parameters, workers)
pub mod types;

/// Module for harness configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
