use thiserror::Error;

/// Optimizer errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("listing error: {0}")]
    Listing(#[from] opt8_ir::ListingError),
    #[error("CHIP-8 error: {0}")]
    Chip8(#[from] opt8_chip8::Chip8Error),
    #[error("CFG error: {0}")]
    Cfg(#[from] opt8_cfg::CfgError),
    #[error("configuration error: {0}")]
    Config(#[from] opt8_passes::ConfigError),
    #[error("{0}")]
    Invariant(#[from] opt8_ir::InvalidInvariant),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid register `{0}`")]
    InvalidRegister(String),
}

pub type Result<T> = std::result::Result<T, Error>;
