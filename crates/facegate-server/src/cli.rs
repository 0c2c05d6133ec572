use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "facegate",
    about = "Face enrollment and verification over HTTP",
    version
)]
pub struct Cli {
    /// Configuration file (defaults to /etc/facegate/config.toml, then /usr/local/etc/facegate/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g. 0.0.0.0:8000)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Directory holding one sub-directory per enrolled identity
    #[arg(long, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Maximum distance accepted as a match
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
