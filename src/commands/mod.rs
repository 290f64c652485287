//! Command module for usage analysis
//!
//! Each CLI subcommand is implemented as a separate module with its own
//! options struct and `run` entry point.

pub mod daily;
pub mod export;
pub mod monthly;
pub mod watch;