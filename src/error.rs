use alloy::primitives::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShadowError>;

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("abi error: {0}")]
    Abi(#[from] AbiError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transaction execution failed: {0}")]
    Execution(String),
    #[error("deployment did not yield a contract address")]
    DeploymentFailed,
    #[error("no code at {address} for on-chain target")]
    MissingCode { address: Address },
}

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("no ABI found for {address} (looked for `{path}` and the `abi.json` fallback)")]
    MissingAbi { address: String, path: String },
    #[error("no ABI entry for address {0} in abi.json")]
    MissingEntry(String),
    #[error("malformed ABI data: {0}")]
    Malformed(String),
    #[error("failed to read ABI store: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
