//! CLI command implementations

pub mod replay;
pub mod status;
pub mod valve;
