//! Clients for the system under test.

pub mod web_client;

pub use web_client::{WebClient, WorkerApi};
