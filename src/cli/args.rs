//! CLI argument definitions using clap
//!
//! Commands:
//! - xmlstore init
//! - xmlstore mkcol <path>
//! - xmlstore ls <path>
//! - xmlstore rmcol <path>
//! - xmlstore put-binary <collection> <name> <file>
//! - xmlstore reindex <path>
//! - xmlstore stats

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Maintenance tool for an xmlstore data directory
#[derive(Parser, Debug)]
#[command(name = "xmlstore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./xmlstore.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create the data directory and the root collection
    Init,

    /// Create a collection and any missing ancestors
    Mkcol { path: String },

    /// List a collection
    Ls {
        #[arg(default_value = "/db")]
        path: String,
    },

    /// Remove a collection with everything below it
    Rmcol { path: String },

    /// Store a file as a binary resource
    PutBinary {
        collection: String,
        name: String,
        file: PathBuf,

        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },

    /// Rebuild the indexes of a collection tree
    Reindex {
        path: String,

        /// store, repair or remove
        #[arg(long, default_value = "repair")]
        mode: String,
    },

    /// Print pool, store and counter statistics
    Stats,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_put_binary() {
        let cli = Cli::parse_from([
            "xmlstore",
            "--config",
            "/etc/xmlstore.json",
            "put-binary",
            "/db/files",
            "logo.png",
            "./logo.png",
            "--mime",
            "image/png",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/xmlstore.json"));
        assert_eq!(
            cli.command,
            Command::PutBinary {
                collection: "/db/files".into(),
                name: "logo.png".into(),
                file: PathBuf::from("./logo.png"),
                mime: "image/png".into(),
            }
        );
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["xmlstore", "reindex", "/db/a"]);
        assert_eq!(cli.config, PathBuf::from("./xmlstore.json"));
        assert_eq!(
            cli.command,
            Command::Reindex {
                path: "/db/a".into(),
                mode: "repair".into()
            }
        );
    }
}
