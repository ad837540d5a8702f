//! Product ledger client.
//!
//! Identity lifecycle against a Fabric certificate authority (admin
//! enrollment, user registration), a durable identity wallet, and ledger
//! gateway sessions that submit or evaluate contract transactions.
//!
//! Layering, leaf first: [`wallet`] → [`ca`] → [`gateway`] → [`orchestrator`].

pub mod ca;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod logger;
pub mod orchestrator;
pub mod profile;
pub mod sandbox;
pub mod wallet;

pub use error::AppError;
