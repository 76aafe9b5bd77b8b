use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "swr-cache-proxy",
    about = "Reverse proxy cache with stale-while-revalidate semantics"
)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./swr-cache-proxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on for client requests.
    #[arg(long, conflicts_with = "port")]
    pub listen: Option<SocketAddr>,

    /// Port to listen on, on all interfaces.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Origin base URL, e.g. http://localhost:3001
    pub origin: Option<String>,
}

impl Cli {
    pub fn listen_override(&self) -> Option<SocketAddr> {
        self.listen
            .or_else(|| self.port.map(|port| SocketAddr::from(([0, 0, 0, 0], port))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
