//! Command-line interface for route-dispatch.
//!
//! Provides one command per process role: the HTTP front end, the solver
//! workers, the cache writers and an all-in-one standalone mode.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
