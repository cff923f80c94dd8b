//! The machine-level back end of a small compiler: turns one type-checked,
//! name-resolved SIR compilation unit into, per function, a control-flow
//! graph of target-machine instructions over virtual registers with a
//! solved register allocation.
//!
//! Pipeline: [`cfgbuild`] → [`select`] (target-specific, see [`isa`]) →
//! [`liveness`] → [`interference`] → [`regalloc`] → [`resolve`]. See
//! [`pipeline::Backend`] for the driver that runs all of it, and
//! `DESIGN.md` for how each module maps onto its sources.

#![deny(unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod cfg;
pub mod cfgbuild;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod interference;
pub mod isa;
pub mod liveness;
pub mod mi;
pub mod pipeline;
pub mod regalloc;
pub mod resolve;
pub mod select;
pub mod sir;
pub mod verify;
pub mod vreg;

pub use crate::error::{CodegenError, CodegenResult};
pub use crate::pipeline::{Backend, Options};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
