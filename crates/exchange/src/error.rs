//! Exchange-layer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Subscribe or order names an instrument the registry does not know.
    /// The message wording is part of the downstream contract.
    #[error("Ativo desconhecido: {0}")]
    UnknownAsset(String),

    /// An order request failed validation before transmission.
    #[error("invalid order: {0}")]
    BadOrder(String),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
