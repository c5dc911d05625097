use anyhow::{anyhow, Context, Result};
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "ferry",
    about = "`ferry` reconciles a source tree against a destination tree, where either \
    side may be a local filesystem or an object store.

Remotes are written as `<backend>:<path>` (e.g. `mem:bucket/dir`); a plain path is the \
local filesystem."
)]
struct Args {
    /// Number of checker workers
    #[structopt(long, default_value = "8")]
    checkers: usize,

    /// Number of transfer workers
    #[structopt(long, default_value = "4")]
    transfers: usize,

    /// Number of low level retries for a single transfer
    #[structopt(long, default_value = "10")]
    low_level_retries: u32,

    /// Override the modification time comparison window, e.g. "1s", "500ms"
    #[structopt(long)]
    modify_window: Option<String>,

    /// Don't list the destination, look destination objects up one by one
    #[structopt(long)]
    no_traverse: bool,

    /// Use the flat list-then-match traversal instead of directory-at-a-time
    #[structopt(long)]
    flat: bool,

    /// Skip files that already exist in the destination
    #[structopt(long)]
    ignore_existing: bool,

    /// Transfer unconditionally, ignoring size, time and hash
    #[structopt(long)]
    ignore_times: bool,

    /// Skip files that are newer in the destination
    #[structopt(long)]
    update_older: bool,

    /// Compare by size only, ignoring time and hash
    #[structopt(long)]
    size_only: bool,

    /// Recognize moved files by size and hash and rename them server-side
    #[structopt(long)]
    track_renames: bool,

    /// When sync deletes files: off/before/during/after/only
    #[structopt(long, default_value = "after")]
    delete_mode: engine::DeleteMode,

    /// Move overwritten or deleted destination files into this remote
    #[structopt(long)]
    backup_dir: Option<String>,

    /// Suffix appended to file names placed in --backup-dir
    #[structopt(long, default_value = "")]
    suffix: String,

    /// Do everything except the write operations
    #[structopt(short = "n", long)]
    dry_run: bool,

    /// Limit recursion depth in the source
    #[structopt(long)]
    max_depth: Option<u32>,

    /// Let destination deletion recurse past --max-depth
    #[structopt(long)]
    delete_excluded: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[structopt(short = "q", long)]
    quiet: bool,

    /// Print transfer statistics at the end
    #[structopt(long)]
    summary: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug, Clone)]
enum Command {
    /// Copy the source to the destination, never deleting
    Copy { source: String, destination: String },
    /// Make the destination identical to the source, deleting extras
    Sync { source: String, destination: String },
    /// Move the contents of the source to the destination
    Move { source: String, destination: String },
    /// Compare the source and destination by size and hash
    Check { source: String, destination: String },
    /// Recursively delete everything in the remote
    Purge { remote: String },
    /// List the objects in the remote
    Ls { remote: String },
}

/// Parse durations like "1s", "500ms", "2m", "1.5s" or a bare number of
/// seconds.
fn parse_duration(s: &str) -> Result<std::time::Duration> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid duration {:?}", s))?;
    let secs = match unit {
        "ns" => value / 1e9,
        "us" => value / 1e6,
        "ms" => value / 1e3,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(anyhow!("unknown duration unit {:?}", other)),
    };
    if secs < 0.0 {
        return Err(anyhow!("duration must not be negative"));
    }
    Ok(std::time::Duration::from_secs_f64(secs))
}

fn sync_options(args: &Args) -> Result<engine::SyncOptions> {
    Ok(engine::SyncOptions {
        checkers: args.checkers,
        transfers: args.transfers,
        low_level_retries: args.low_level_retries,
        modify_window: args
            .modify_window
            .as_deref()
            .map(parse_duration)
            .transpose()?,
        no_traverse: args.no_traverse,
        flat: args.flat,
        ignore_existing: args.ignore_existing,
        ignore_times: args.ignore_times,
        update_older: args.update_older,
        size_only: args.size_only,
        track_renames: args.track_renames,
        delete_mode: args.delete_mode,
        backup_dir: args.backup_dir.clone(),
        suffix: args.suffix.clone(),
        dry_run: args.dry_run,
        max_depth: args.max_depth,
        delete_excluded: args.delete_excluded,
    })
}

async fn remote(spec: &str) -> Result<std::sync::Arc<dyn backend::Remote>> {
    backend::new_remote(spec)
        .await
        .map_err(anyhow::Error::new)
        .with_context(|| format!("failed to create remote {:?}", spec))
}

async fn run(args: Args, stats: std::sync::Arc<engine::Stats>) -> Result<()> {
    let opts = sync_options(&args)?;
    match &args.command {
        Command::Copy {
            source,
            destination,
        } => {
            let (fsrc, fdst) = (remote(source).await?, remote(destination).await?);
            engine::copy_dir(&fdst, &fsrc, &opts, &stats).await
        }
        Command::Sync {
            source,
            destination,
        } => {
            let (fsrc, fdst) = (remote(source).await?, remote(destination).await?);
            engine::sync(&fdst, &fsrc, &opts, &stats).await
        }
        Command::Move {
            source,
            destination,
        } => {
            let (fsrc, fdst) = (remote(source).await?, remote(destination).await?);
            engine::move_dir(&fdst, &fsrc, &opts, &stats).await
        }
        Command::Check {
            source,
            destination,
        } => {
            let (fsrc, fdst) = (remote(source).await?, remote(destination).await?);
            let summary = engine::operations::check(&fdst, &fsrc, &opts, &stats).await?;
            println!("{}", summary);
            if summary.clean() {
                Ok(())
            } else {
                Err(anyhow!("source and destination differ"))
            }
        }
        Command::Purge { remote: spec } => {
            let target = remote(spec).await?;
            engine::operations::purge(&target, "", &opts, &stats).await
        }
        Command::Ls { remote: spec } => {
            let target = remote(spec).await?;
            let max_depth = opts.max_depth.unwrap_or(engine::walk::MAX_DEPTH);
            let files =
                engine::walk::read_files_map(target, "", max_depth).await?;
            let mut paths: Vec<_> = files.keys().cloned().collect();
            paths.sort();
            for path in paths {
                println!("{:>12} {}", files[&path].size(), path);
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "off"
    } else {
        match verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::from_args();
    init_tracing(args.verbose, args.quiet);
    let summary = args.summary;
    let quiet = args.quiet;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");
    let stats = engine::Stats::new();
    let result = runtime.block_on(run(args, stats.clone()));
    if summary {
        eprintln!("{}", stats);
    }
    if let Err(err) = result {
        if !quiet {
            tracing::error!("{:#}", err);
        }
        std::process::exit(1);
    }
}
