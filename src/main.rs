use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use snapvault::config;
use snapvault::ui;

/// A deduplicating, content-addressed backup tool.
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The repository to operate on.
    #[arg(short, long)]
    repository: Utf8PathBuf,

    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Lay out an empty repository (blob store + catalog).
    Init(ui::init::Args),
    /// Back up a directory tree into the repository.
    Backup(ui::backup::Args),
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let config = config::load()?;

    match args.subcommand {
        Subcommand::Init(a) => ui::init::run(&args.repository, a),
        Subcommand::Backup(a) => {
            let result = ui::backup::run(&args.repository, &config, a);
            if config.debug {
                snapvault::counters::log_counts();
            }
            result
        }
    }
}

/// Sets up `tracing-subscriber` to spit messages to stderr, matching the
/// verbosity levels the rest of the workspace's CLIs use.
fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(true)
        .init();
}
