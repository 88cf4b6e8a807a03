//! CHIP-8 front end for the opt8 optimizer.
//!
//! Decodes big-endian CHIP-8 programs into the shared instruction model so
//! they can be optimized like any other listing.

mod decode;
mod error;

pub use decode::*;
pub use error::*;
