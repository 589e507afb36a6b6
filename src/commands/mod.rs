//! Command-line interface definitions and drivers for the bloomtree CLI.

pub mod args;
pub mod build;
pub mod query;

pub use args::{BuildArgs, Cli, Commands, QueryArgs};
pub use build::run_build;
pub use query::run_query;
