use clap::{Parser, Subcommand};
use cvrelay_core::bootstrap::ConfigArgs;

#[derive(Parser)]
#[command(
    name = "cvrelay",
    version,
    about = "Authenticating, auditing relay for an async image/video generation upstream"
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the relay server.
    Serve {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Manage tenant API keys.
    Key {
        #[command(subcommand)]
        command: KeyCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum KeyCommand {
    /// Create a key; prints the secret exactly once.
    Create {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        description: Option<String>,
        /// RFC3339 expiry instant.
        #[arg(long)]
        expires_at: Option<String>,
    },
    /// List keys with derived status.
    List {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Revoke a key immediately.
    Revoke {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        id: i64,
    },
    /// Replace a key, optionally keeping the old one alive for a grace
    /// window.
    Rotate {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        id: i64,
        #[arg(long)]
        description: Option<String>,
        /// RFC3339 expiry instant for the new key.
        #[arg(long)]
        expires_at: Option<String>,
        /// How long the old key keeps working, e.g. `10m`. Zero revokes it
        /// immediately.
        #[arg(long, default_value = "0s")]
        grace_period: String,
    },
}
