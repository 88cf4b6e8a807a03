//! Control flow graph construction and dataflow for the opt8 optimizer.
//!
//! Decoded instructions are partitioned into basic blocks by leader
//! analysis, linked into a [`Cfg`] and analysed with a generic worklist
//! driver.

mod block;
mod dataflow;
mod error;
mod extract;
mod graph;
mod value;

pub use block::*;
pub use dataflow::*;
pub use error::*;
pub use extract::*;
pub use graph::*;
pub use value::*;
