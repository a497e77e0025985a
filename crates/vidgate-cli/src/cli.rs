//! CLI argument definitions for vidgate.
//!
//! Each job command builds one request, runs it through a gateway built from
//! the environment and prints a JSON envelope `{job, quota, queues}`.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `search` | Search videos, channels and playlists |
//! | `videos` | Look up video details by id |
//! | `channels` | Look up channel details by id |
//! | `playlist` | Fetch one page of a playlist |
//! | `stats` | Fetch video statistics by id |
//! | `quota` | Show the daily quota ledger |
//! | `history` | List recently finished jobs |
//!
//! # Examples
//!
//! ```bash
//! vidgate search "rust async" --max-results 10 --order date --pretty
//! vidgate videos dQw4w9WgXcQ 9bZkp7q19f0 --priority 2
//! vidgate history --limit 5
//! ```

use clap::{Args, Parser, Subcommand};

/// Quota-governed client for a video-platform data API.
#[derive(Debug, Parser)]
#[command(name = "vidgate", author, version, about = "Quota-governed video API client")]
pub struct Cli {
    /// Job priority, 1 (critical) to 4 (low).
    #[arg(
        long,
        global = true,
        default_value_t = 3,
        value_parser = clap::value_parser!(u8).range(1..=4)
    )]
    pub priority: u8,

    /// Owner whose credentials the job runs under.
    #[arg(long, global = true)]
    pub owner: Option<String>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Keep quota and job history in memory only.
    #[arg(long, global = true, default_value_t = false)]
    pub no_store: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search videos, channels and playlists.
    Search(SearchArgs),
    /// Look up video details.
    Videos(IdsArgs),
    /// Look up channel details.
    Channels(IdsArgs),
    /// Fetch one page of a playlist.
    Playlist(PlaylistArgs),
    /// Fetch video statistics.
    Stats(IdsArgs),
    /// Show the daily quota ledger and queue counts.
    Quota,
    /// List recently finished jobs.
    History(HistoryArgs),
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    pub query: String,

    #[arg(long)]
    pub max_results: Option<u32>,

    /// relevance, date, viewCount, rating or title.
    #[arg(long)]
    pub order: Option<String>,

    #[arg(long)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct IdsArgs {
    #[arg(required = true, num_args = 1..)]
    pub ids: Vec<String>,
}

#[derive(Debug, Args)]
pub struct PlaylistArgs {
    pub playlist_id: String,

    #[arg(long)]
    pub page_token: Option<String>,

    #[arg(long)]
    pub max_results: Option<u32>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}
