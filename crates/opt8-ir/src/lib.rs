//! Instruction model and symbolic values for the opt8 optimizer.
//!
//! This crate holds the instruction set agnostic vocabulary shared by every
//! other crate: widths, registers, memory references, decoded instructions,
//! symbolic expressions and the run-wide invariant set.

mod expr;
mod function;
mod instr;
mod invariant;
mod listing;
mod location;
mod value;
mod width;

pub use expr::*;
pub use function::*;
pub use instr::*;
pub use invariant::*;
pub use listing::*;
pub use location::*;
pub use value::*;
pub use width::*;
