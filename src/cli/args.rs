//! Command line arguments, parsed with clap.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use log::LevelFilter;

/// Tessera - a segment-based inverted index engine
#[derive(Parser, Debug, Clone)]
#[command(name = "tessera")]
#[command(about = "Build, inspect and verify segment-based inverted indexes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct TesseraArgs {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human", global = true)]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl TesseraArgs {
    /// 0 = quiet, 1 = normal, 2 = verbose, 3+ = debug.
    pub fn verbosity(&self) -> u8 {
        if self.quiet { 0 } else { self.verbose + 1 }
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.verbosity() {
            0 => LevelFilter::Error,
            1 => LevelFilter::Warn,
            2 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Add JSON-lines documents to an index, creating it if needed
    Index(IndexArgs),

    /// Show the segments and document counts of the latest commit
    Stats(StatsArgs),

    /// Verify checksums and walk every segment of the latest commit
    Check(CheckArgs),

    /// Force merge an index
    Merge(MergeArgs),

    /// Look up a term and print the stored fields of matching documents
    Search(SearchArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct IndexArgs {
    /// Index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// JSON-lines file with one document per line, `-` for stdin
    #[arg(value_name = "DOCUMENTS")]
    pub documents: PathBuf,

    /// String fields indexed as single keywords instead of analyzed text
    #[arg(short, long, value_delimiter = ',')]
    pub keyword_fields: Vec<String>,

    /// Replace documents whose value of this keyword field matches
    #[arg(long, value_name = "FIELD")]
    pub id_field: Option<String>,

    /// Writer settings as JSON
    #[arg(short, long, value_name = "SETTINGS_FILE")]
    pub config: Option<PathBuf>,

    /// Replace any existing index
    #[arg(long)]
    pub create: bool,

    /// Indexing threads
    #[arg(short, long, default_value = "1")]
    pub threads: usize,

    /// Commit user data as key=value
    #[arg(long = "user-data", value_name = "KEY=VALUE")]
    pub user_data: Vec<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct StatsArgs {
    /// Index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// Include segment diagnostics
    #[arg(short, long)]
    pub diagnostics: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    /// Index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// Threads checking segments, rayon's default when unset
    #[arg(short, long)]
    pub threads: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
pub struct MergeArgs {
    /// Index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// Merge down to at most this many segments
    #[arg(short, long, default_value = "1")]
    pub max_segments: usize,

    /// Only merge away deleted documents
    #[arg(long, conflicts_with = "max_segments")]
    pub only_deletes: bool,

    /// Writer settings as JSON
    #[arg(short, long, value_name = "SETTINGS_FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct SearchArgs {
    /// Index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// Field to look in
    #[arg(value_name = "FIELD")]
    pub field: String,

    /// Exact term, matched after analysis at index time
    #[arg(value_name = "TERM")]
    pub term: String,

    /// Maximum number of documents to print
    #[arg(short, long, default_value = "10")]
    pub limit: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    Human,
    /// JSON
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index_command() {
        let args = TesseraArgs::try_parse_from([
            "tessera",
            "-vv",
            "index",
            "/tmp/idx",
            "docs.jsonl",
            "--keyword-fields",
            "id,tag",
            "--threads",
            "4",
        ])
        .unwrap();
        assert_eq!(args.verbosity(), 3);
        assert_eq!(args.log_level(), LevelFilter::Debug);
        match args.command {
            Command::Index(index) => {
                assert_eq!(index.keyword_fields, vec!["id", "tag"]);
                assert_eq!(index.threads, 4);
                assert!(!index.create);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_format_flag() {
        let args =
            TesseraArgs::try_parse_from(["tessera", "check", "/tmp/idx", "--format", "json", "-q"])
                .unwrap();
        assert_eq!(args.output_format, OutputFormat::Json);
        assert_eq!(args.log_level(), LevelFilter::Error);
    }

    #[test]
    fn test_merge_flags_conflict() {
        assert!(
            TesseraArgs::try_parse_from([
                "tessera",
                "merge",
                "/tmp/idx",
                "--max-segments",
                "2",
                "--only-deletes"
            ])
            .is_err()
        );
    }
}
