//! Maintenance CLI
//!
//! Provides command-line access to one data directory:
//! - init: create the data directory and the root collection
//! - mkcol / ls / rmcol: collection maintenance
//! - put-binary: store a file as a binary resource
//! - reindex: rebuild the indexes of a collection tree
//! - stats: pool, store and counter statistics

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{execute, init, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
