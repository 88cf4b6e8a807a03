//! Symbolic and concrete interpretation for the opt8 optimizer.
//!
//! [`SymbolicInterpreter`] summarises a straight-line region as a final
//! [`SymbolicState`], an exit and the externally visible events along the
//! way. [`ConcreteMachine`] runs the same semantics on concrete values.

mod alias;
mod concrete;
mod interp;
mod state;

pub use alias::*;
pub use concrete::*;
pub use interp::*;
pub use state::*;
