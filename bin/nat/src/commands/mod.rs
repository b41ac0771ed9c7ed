//! CLI command implementations.

pub mod eval;
pub mod fs;
