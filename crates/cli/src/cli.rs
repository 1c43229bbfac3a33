use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "casefeed")]
#[command(about = "Incremental sync and shape cache over exported case feeds")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Replica database path (overrides CASEFEED_DB_PATH)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay NDJSON exports through a sync session into the replica
    Replay(ReplayArgs),

    /// Show per-collection record counts held by the replica
    Stats,
}

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// Notices export, one JSON record per line (synced progressively)
    #[arg(long)]
    pub notices: PathBuf,

    /// Cases export, one JSON record per line (synced on demand)
    #[arg(long)]
    pub cases: PathBuf,

    /// Free-text search to run once the cases baseline is ready
    #[arg(short, long)]
    pub search: Option<String>,

    /// Restrict the search to one offence result / notice type
    #[arg(long = "type")]
    pub record_type: Option<String>,

    /// Restrict the search to one agency
    #[arg(long)]
    pub agency: Option<String>,

    /// Earliest date to search (YYYY-MM-DD)
    #[arg(long)]
    pub date_from: Option<String>,

    /// Latest date to search (YYYY-MM-DD)
    #[arg(long)]
    pub date_to: Option<String>,

    /// Seconds to wait for each sync phase before reporting anyway
    #[arg(long, default_value_t = 30)]
    pub wait_secs: u64,
}

impl ReplayArgs {
    pub fn has_search(&self) -> bool {
        [&self.search, &self.record_type, &self.agency, &self.date_from, &self.date_to]
            .iter()
            .any(|v| v.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replay_with_search() {
        let cli = Cli::try_parse_from([
            "casefeed", "replay", "--notices", "n.ndjson", "--cases", "c.ndjson", "-s", "acme", "--type", "fine",
            "--db", "/tmp/replica.sqlite",
        ])
        .unwrap();

        assert_eq!(cli.db, Some(PathBuf::from("/tmp/replica.sqlite")));
        let Commands::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.search.as_deref(), Some("acme"));
        assert_eq!(args.record_type.as_deref(), Some("fine"));
        assert_eq!(args.wait_secs, 30);
        assert!(args.has_search());
    }

    #[test]
    fn test_replay_requires_both_exports() {
        assert!(Cli::try_parse_from(["casefeed", "replay", "--notices", "n.ndjson"]).is_err());
    }

    #[test]
    fn test_parse_stats() {
        let cli = Cli::try_parse_from(["casefeed", "stats"]).unwrap();
        assert!(matches!(cli.command, Commands::Stats));
        assert!(cli.db.is_none());
    }
}
