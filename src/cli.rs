// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines subcommands and the shared connection options.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sshot")]
#[command(about = "Run one-shot commands and push files over SSH")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print only remote output and errors
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Emit JSON lines instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command and print its output once it finishes
    Run {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Command to run on the remote host
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run a command, printing each output line as it arrives
    Stream {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Command to run on the remote host
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Upload a single file
    Upload {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Local file to send
        source: PathBuf,

        /// Destination path on the remote host
        destination: String,
    },

    /// Show the connection parameters a target resolves to
    Resolve {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Target in the form [user@]host; host may be an alias from ~/.ssh/config
    pub target: String,

    /// Port to connect to (overrides ~/.ssh/config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Private key file (overrides ~/.ssh/config)
    #[arg(short, long)]
    pub identity: Option<PathBuf>,

    /// Read the password from this environment variable
    #[arg(long, value_name = "VAR")]
    pub password_env: Option<String>,

    /// Accept any host key without verification (insecure)
    #[arg(long, conflicts_with_all = ["fingerprint", "known_hosts", "trust_first_connection"])]
    pub insecure: bool,

    /// Accept only a host key with this SHA256 fingerprint
    #[arg(long, value_name = "SHA256:...", conflicts_with_all = ["known_hosts", "trust_first_connection"])]
    pub fingerprint: Option<String>,

    /// known_hosts file to verify against (default: ~/.ssh/known_hosts)
    #[arg(long, value_name = "PATH")]
    pub known_hosts: Option<PathBuf>,

    /// Accept and remember host keys not yet in known_hosts
    #[arg(long)]
    pub trust_first_connection: bool,
}
