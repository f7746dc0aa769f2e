//! chunksync - chunk-based incremental file synchronizer

use anyhow::Context;
use chunksync::cli::{Cli, Commands, HashArgs, PatchArgs, ShowArgs, VerifyArgs};
use chunksync::delta::{FileDeltaSink, StreamDeltaSink};
use chunksync::progress::Progress;
use chunksync::session::{CompareOutcome, FileSession, HashOutcome};
use chunksync::store::HashStore;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit code for fatal errors, distinct from the outcome codes 0 and 1
const EXIT_FAILURE: i32 = 2;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{:#}", err);
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Hash(args) => run_hash(args),
        Commands::Verify(args) => run_verify(args),
        Commands::Patch(args) => run_patch(args),
        Commands::Show(args) => run_show(args),
    }
}

fn run_hash(args: HashArgs) -> anyhow::Result<i32> {
    let config = args.to_config()?;
    let session = FileSession::open(&config, &args.common.file, args.common.store.clone())?;

    let reporter = spawn_reporter(session.progress(), args.common.progress);
    let stats = session.hash(!args.force_refresh, config.strategy);
    reporter.stop();
    let stats = stats?;

    let outcome = session.hash_outcome();
    session.on_exit_flush()?;

    tracing::info!(
        state = %session.load_state(),
        hashed = stats.chunks_hashed,
        skipped = stats.chunks_skipped,
        chunks = session.indexed_chunks(),
        store = ?session.store_path(),
        chunk_size = config.chunk_size,
        outcome = ?outcome,
        "hashing finished"
    );

    // Callers branch on whether the index changed
    Ok(match outcome {
        HashOutcome::Updated => 1,
        HashOutcome::Unchanged => 0,
    })
}

fn run_verify(args: VerifyArgs) -> anyhow::Result<i32> {
    let config = args.to_config()?;
    let session = FileSession::open(&config, &args.common.file, args.common.store.clone())?;

    let reporter = spawn_reporter(session.progress(), args.common.progress);
    let stats = match &args.delta {
        Some(path) if path == Path::new("-") => {
            let mut sink = StreamDeltaSink::new(std::io::stdout().lock(), session.patch_header()?);
            session.verify(&args.against, Some(&mut sink))
        }
        Some(path) => {
            let mut sink: FileDeltaSink =
                FileDeltaSink::create(path.clone(), session.patch_header()?)?;
            session.verify(&args.against, Some(&mut sink))
        }
        None => session.verify(&args.against, None),
    };
    reporter.stop();
    let stats = stats?;

    session.on_exit_flush()?;

    tracing::info!(
        matched = stats.matched,
        mismatched = stats.mismatched,
        limit_reached = stats.limit_reached,
        "verification finished"
    );

    // A produced delta is the useful result, so differences exit 0
    Ok(match stats.outcome() {
        CompareOutcome::DifferencesFound => 0,
        CompareOutcome::NoDifferences => 1,
    })
}

fn run_patch(args: PatchArgs) -> anyhow::Result<i32> {
    let config = args.common.to_config()?;
    let session = FileSession::open(&config, &args.common.file, args.common.store.clone())?;

    let stats = if args.delta == Path::new("-") {
        session.apply(std::io::stdin().lock())?
    } else {
        let file = std::fs::File::open(&args.delta)
            .with_context(|| format!("opening delta file {}", args.delta.display()))?;
        session.apply(std::io::BufReader::new(file))?
    };

    session.on_exit_flush()?;

    tracing::info!(
        written = stats.written,
        skipped = stats.skipped,
        bytes = stats.bytes_written,
        "patching finished"
    );
    Ok(0)
}

fn run_show(args: ShowArgs) -> anyhow::Result<i32> {
    let store = HashStore::at(args.store);
    let dump = store.dump()?;
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(0)
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("chunksync=info"),
        1 => EnvFilter::new("chunksync=debug"),
        2 => EnvFilter::new("chunksync=trace"),
        _ => EnvFilter::new("trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Background thread rendering the core's progress counters
struct Reporter {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Reporter {
    fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_reporter(progress: Arc<Progress>, enabled: bool) -> Reporter {
    let stop = Arc::new(AtomicBool::new(false));
    if !enabled {
        return Reporter {
            stop,
            handle: None,
        };
    }

    let stop_flag = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );

        while !stop_flag.load(Ordering::Relaxed) {
            let snap = progress.snapshot();
            bar.set_length(snap.total_chunks);
            bar.set_position(snap.chunks_done);
            if snap.rate_avg > 0.0 {
                bar.set_message(format!(
                    "{}/s",
                    human_bytes::human_bytes(snap.rate_avg)
                ));
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        bar.finish_and_clear();
    });

    Reporter {
        stop,
        handle: Some(handle),
    }
}
