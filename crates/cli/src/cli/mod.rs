pub mod call;
pub mod config;
pub mod servers;
pub mod tools;
pub mod watch;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use tm_domain::config::Config;

/// toolmesh: drive a set of MCP tool servers from the command line.
#[derive(Debug, Parser)]
#[command(name = "toolmesh", version, about)]
pub struct Cli {
    /// Path to the config file.
    #[arg(long, global = true, env = "TOOLMESH_CONFIG", default_value = "toolmesh.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to every server and print its status.
    Servers,
    /// Print the merged tool catalog.
    Tools {
        /// Output the catalog as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Invoke a tool and print its result.
    Call {
        /// Tool name.
        tool: String,
        /// Arguments as a JSON object (defaults to `{}`).
        args: Option<String>,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Run the health monitor until Ctrl-C.
    Watch,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any issues.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration at `path`. A missing file yields the defaults.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}
