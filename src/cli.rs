use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};


#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    Relay(RelayArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    #[arg(
        short = 't',
        long = "target",
        help = "Target to relay to, as host:port."
    )]
    pub target: String,

    #[arg(
        long = "no-proxy",
        help = "Connect directly even if the configuration sets up a SOCKS proxy."
    )]
    pub no_proxy: bool,

    #[arg(
        long = "session-timeout-seconds",
        help = "Overall deadline for the relay session. Unlimited if unspecified."
    )]
    pub session_timeout_seconds: Option<u64>,
}


#[derive(Parser, Debug, Clone)]
pub struct CliArgs {
    #[arg(
        long = "config-file-path",
        global = true,
        help = "File path of the configuration file. If unspecified, \
                this defaults to ./data/configuration.toml (relative to the current directory)."
    )]
    pub config_file_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}
