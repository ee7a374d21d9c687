use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tls-sidecar")]
#[command(version, about = "Mutual TLS sidecar with short-lived, automatically rotated certificates", long_about = None)]
#[command(author = "TLS Sidecar Team")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the mTLS echo server
    Serve {
        #[arg(long, help = "Common name to request (default: dumbserver)")]
        common_name: Option<String>,
    },

    /// Forward plain HTTP requests to the target over mTLS
    Proxy {
        #[arg(long, help = "Common name to request (default: outproxy)")]
        common_name: Option<String>,
    },

    /// Issue, revoke and tidy one certificate to check authority access
    Check {
        #[arg(long, help = "Common name to request (default: dumbserver)")]
        common_name: Option<String>,
    },
}
