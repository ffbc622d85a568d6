//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Offline-first mail client: sync, browse and edit the local message cache.
#[derive(Debug, Parser)]
#[command(name = "sorapc", version, about)]
pub struct Cli {
    /// Settings file (defaults to the platform config dir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// What to do.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure the account and store its access token in the keyring.
    Login {
        /// Account identifier.
        #[arg(long)]
        id: String,
        /// Account email address.
        #[arg(long)]
        email: String,
        /// Mail endpoint base URL.
        #[arg(long)]
        mail_url: String,
        /// Document store base URL.
        #[arg(long)]
        cloud_url: String,
        /// Access token.
        #[arg(long, env = "SORAPC_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Stop syncing, drop the cache and forget the stored token.
    Logout,
    /// Run one sync.
    Sync,
    /// Sync in the background until interrupted.
    Watch,
    /// Show a page of messages, newest first.
    List {
        /// Messages to skip.
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Page size (defaults to the configured page size).
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Mark a message as read.
    Read {
        /// Message id.
        id: String,
    },
    /// Mark a message as unread.
    Unread {
        /// Message id.
        id: String,
    },
    /// Delete a message.
    Delete {
        /// Message id.
        id: String,
    },
    /// Configure the outgoing mail server and store its password in the keyring.
    Smtp {
        /// Server host name.
        #[arg(long)]
        host: String,
        /// Server port.
        #[arg(long, default_value_t = 587)]
        port: u16,
        /// Login user name.
        #[arg(long)]
        username: String,
        /// Sender address.
        #[arg(long)]
        from: String,
        /// Use implicit TLS instead of STARTTLS.
        #[arg(long)]
        tls: bool,
        /// Login password.
        #[arg(long, env = "SORAPC_SMTP_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Queue a mail and try to deliver it right away.
    Send {
        /// Recipient address.
        #[arg(long)]
        to: String,
        /// Subject line.
        #[arg(long)]
        subject: String,
        /// Body text.
        #[arg(long)]
        body: String,
        /// Treat the body as HTML.
        #[arg(long)]
        html: bool,
        /// Files to attach.
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// Load an image through the asset caches and print its size.
    Image {
        /// Image URI.
        uri: String,
    },
}
