//! CHIP-8 decoding errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Chip8Error {
    #[error("malformed input: illegal opcode {opcode:#06x} at {address:#x}")]
    MalformedInput { address: u64, opcode: u16 },
    #[error("truncated opcode at {address:#x}")]
    TruncatedOpcode { address: u64 },
    #[error("program of {size} bytes does not fit in {max} bytes of memory")]
    ProgramTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Chip8Error>;
