//! Verified optimization passes for the opt8 optimizer.
//!
//! Every pass analyses an immutable [`opt8_cfg::Cfg`], proposes rewrites
//! and commits only those the equivalence checker proves. The
//! [`PassManager`] chains passes as configured by a [`PipelineConfig`].

mod config;
mod const_prop;
mod dce;
mod dse;
mod error;
mod liveness;
mod manager;
mod pass;
mod peephole;
mod superopt;

pub use config::*;
pub use const_prop::*;
pub use dce::*;
pub use dse::*;
pub use error::*;
pub use liveness::*;
pub use manager::*;
pub use pass::*;
pub use peephole::*;
pub use superopt::*;
