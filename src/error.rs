//! Application-wide error types.
//!
//! Each subsystem owns its error enum (`WalletError`, `EnrollmentError`,
//! `GatewayError`, …). `AppError` is what flows reach the binaries with.

use thiserror::Error;

use crate::ca::EnrollmentError;
use crate::gateway::GatewayError;
use crate::identity::CredentialError;
use crate::wallet::WalletError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
