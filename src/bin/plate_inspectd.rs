//! plate_inspectd - inspection lane daemon
//!
//! Reads detector frames as JSON lines (file or stdin), aggregates them into
//! plate records and persists them:
//! 1. Local SQLite ledger (system of record)
//! 2. Per-lot JSON export under the save root
//! 3. Optional remote mirror (background, best effort)
//!
//! Stops on end of input or Ctrl-C, flushing the open lot first. A new lot is
//! started automatically when the calendar date changes.

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use plate_inspector::{
    FeedPoll, FrameAdapter, FrameFeed, InspectionEvent, Inspector, InspectorConfig, JsonlSource,
    MirrorWorker, PlateStatus, RestMirror, SqliteLedgerStore,
};

const STOP_POLL: Duration = Duration::from_millis(100);
const FRAME_BUFFER: usize = 64;

#[derive(Parser, Debug)]
#[command(
    name = "plate_inspectd",
    version,
    about = "Aggregate detector frames into committed plate records"
)]
struct Args {
    /// Config file (TOML or JSON)
    #[arg(long, env = "PLATE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Detector feed as JSON lines; stdin when omitted
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Do not print presentation events to stdout
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = InspectorConfig::load_from(args.config.as_deref())?;
    let ledger = SqliteLedgerStore::open(&cfg.db_path)?;
    let remote = cfg.remote.as_ref().map(|settings| {
        log::info!("remote mirror enabled: {}", settings.base_url);
        MirrorWorker::spawn(
            Box::new(RestMirror::new(settings)),
            settings.max_attempts,
            settings.queue_capacity,
        )
        .with_drain_timeout(settings.drain_timeout)
    });

    let mut inspector = Inspector::open(&cfg, Box::new(ledger), remote, Local::now())?;
    let printer = if args.quiet {
        None
    } else {
        let (event_tx, event_rx) = mpsc::channel();
        inspector = inspector.with_events(event_tx);
        Some(std::thread::spawn(move || print_events(event_rx)))
    };

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("set Ctrl-C handler")?;

    let adapter = FrameAdapter::new(cfg.detector);
    log::info!(
        "plate_inspectd running. ledger={}, save_root={}, gate={}/{}",
        cfg.db_path,
        cfg.save_root.display(),
        cfg.gate.present_frames,
        cfg.gate.absent_frames
    );
    // Read on a separate thread so Ctrl-C is seen while the input is idle.
    let feed = match args.input.clone() {
        Some(path) => FrameFeed::spawn(
            move || JsonlSource::from_path(&path, adapter),
            FRAME_BUFFER,
        ),
        None => FrameFeed::spawn(
            move || Ok(JsonlSource::new(std::io::stdin().lock(), adapter)),
            FRAME_BUFFER,
        ),
    };
    let result = run(&feed, &mut inspector, &stop_rx);

    let pending = inspector.pending();
    let shutdown = inspector.shutdown(Local::now());
    if let Some(printer) = printer {
        let _ = printer.join();
    }
    result?;
    shutdown.with_context(|| format!("shutdown with {} unsaved record(s)", pending))?;
    log::info!("plate_inspectd stopped");
    Ok(())
}

fn run(feed: &FrameFeed, inspector: &mut Inspector, stop_rx: &Receiver<()>) -> Result<()> {
    let mut ticks = 0u64;
    loop {
        if stop_rx.try_recv().is_ok() {
            log::info!("shutdown signal received");
            break;
        }
        let frame = match feed.poll(STOP_POLL)? {
            FeedPoll::Frame(frame) => frame,
            FeedPoll::Idle => {
                if inspector.pending() > 0 {
                    if let Err(err) = inspector.retry_pending(Local::now()) {
                        log::debug!("ledger retry failed: {:#}", err);
                    }
                }
                continue;
            }
            FeedPoll::Closed => break,
        };
        if frame.captured_at.date_naive() != inspector.lot().date() {
            if let Err(err) = inspector.stop(frame.captured_at) {
                log::error!("lot rollover failed: {:#}", err);
            }
        }
        if let Err(err) = inspector.process_frame(&frame) {
            log::error!(
                "tick {}: {:#} ({} pending)",
                frame.tick_id,
                err,
                inspector.pending()
            );
        }
        ticks += 1;
    }
    log::info!("processed {} ticks", ticks);
    Ok(())
}

fn print_events(rx: Receiver<InspectionEvent>) {
    let stdout = std::io::stdout();
    for event in rx {
        let line = match event {
            InspectionEvent::LotStarted { lot_id } => format!("lot {} started", lot_id),
            InspectionEvent::PlateArrived { sequence_no, .. } => {
                format!("#{:<4} arrived", sequence_no)
            }
            InspectionEvent::Status {
                sequence_no,
                status,
            } => match status {
                PlateStatus::Pending => format!("#{:<4} inspecting", sequence_no),
                PlateStatus::Pass => format!("#{:<4} PASS", sequence_no),
                PlateStatus::Defect { count } => {
                    format!("#{:<4} DEFECT ({} found)", sequence_no, count)
                }
            },
            InspectionEvent::Committed { record, supersedes } => format!(
                "#{:<4} {} {} {} {}",
                record.sequence_no(),
                if supersedes { "updated" } else { "saved" },
                record.lot_id(),
                record.shape().as_str(),
                record.defects_text()
            ),
            InspectionEvent::Stats(stats) => format!(
                "lot {}: total={} pass={} defect={}",
                stats.lot_id, stats.total, stats.passed, stats.defective
            ),
            InspectionEvent::PlateDeparted {
                sequence_no,
                reason,
            } => format!("#{:<4} left ({:?})", sequence_no, reason),
            InspectionEvent::LotFinished { lot_id, stats } => format!(
                "lot {} finished: total={} pass={} defect={}",
                lot_id, stats.total, stats.passed, stats.defective
            ),
        };
        let mut out = stdout.lock();
        if writeln!(out, "{}", line).is_err() {
            break;
        }
    }
}
