//! Outer shell around [`PlateAggregator`].
//!
//! Interprets [`Effect`]s against the ledger, the export mirror, the remote
//! worker and an optional presentation channel, and owns the lot lifecycle.
//!
//! Ledger writes are synchronous. A failed write leaves the record in a
//! pending queue which is retried, in order, on every later call; the error
//! is returned to the caller but the aggregation state is unaffected.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::aggregator::{DepartureReason, Effect, PlateAggregator};
use crate::config::InspectorConfig;
use crate::export::ExportMirror;
use crate::frame::Frame;
use crate::ledger::{LedgerRow, LedgerStore, NOTE_UPDATED};
use crate::record::{Lot, PlateRecord, PlateStatus, SessionStats};
use crate::remote::{self, MirrorJob, MirrorWorker};

#[derive(Clone, Debug, PartialEq)]
pub enum InspectionEvent {
    LotStarted {
        lot_id: String,
    },
    PlateArrived {
        sequence_no: u32,
        tick_id: u64,
    },
    Status {
        sequence_no: u32,
        status: PlateStatus,
    },
    /// Record durably appended to the ledger.
    Committed {
        record: PlateRecord,
        supersedes: bool,
    },
    Stats(SessionStats),
    PlateDeparted {
        sequence_no: u32,
        reason: DepartureReason,
    },
    LotFinished {
        lot_id: String,
        stats: SessionStats,
    },
}

#[derive(Clone, Debug)]
struct PendingCommit {
    record: PlateRecord,
    supersedes: bool,
}

pub struct Inspector {
    aggregator: PlateAggregator,
    ledger: Box<dyn LedgerStore>,
    save_root: PathBuf,
    export: Option<ExportMirror>,
    remote: Option<MirrorWorker>,
    pending: VecDeque<PendingCommit>,
    events: Option<Sender<InspectionEvent>>,
}

impl Inspector {
    /// Starts the first lot for `now`, continuing numbering from the ledger.
    pub fn open(
        cfg: &InspectorConfig,
        ledger: Box<dyn LedgerStore>,
        remote: Option<MirrorWorker>,
        now: DateTime<Local>,
    ) -> Result<Self> {
        let lot = Lot::start(ledger.as_ref(), now).context("start lot")?;
        let aggregator = PlateAggregator::new(cfg.gate, cfg.identity, lot);
        let mut inspector = Self {
            aggregator,
            ledger,
            save_root: cfg.save_root.clone(),
            export: None,
            remote,
            pending: VecDeque::new(),
            events: None,
        };
        inspector.begin_lot();
        Ok(inspector)
    }

    /// Forwards every event to `tx` as well as returning it.
    pub fn with_events(mut self, tx: Sender<InspectionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn lot(&self) -> &Lot {
        self.aggregator.lot()
    }

    pub fn stats(&self) -> &SessionStats {
        self.aggregator.stats()
    }

    pub fn aggregator(&self) -> &PlateAggregator {
        &self.aggregator
    }

    pub fn ledger(&self) -> &dyn LedgerStore {
        self.ledger.as_ref()
    }

    /// Records waiting for a successful ledger write.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn export_path(&self) -> Option<PathBuf> {
        self.export.as_ref().map(|e| e.path().to_path_buf())
    }

    /// Runs one tick. The frame is always aggregated; `Err` means at least one
    /// record is still waiting for the ledger.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Vec<InspectionEvent>> {
        let effects = self.aggregator.process_frame(frame);
        let mut events = Vec::new();
        self.apply(effects, &mut events);
        self.flush_pending(frame.captured_at, &mut events)?;
        Ok(events)
    }

    /// Retries pending ledger writes without feeding a frame.
    pub fn retry_pending(&mut self, now: DateTime<Local>) -> Result<Vec<InspectionEvent>> {
        let mut events = Vec::new();
        self.flush_pending(now, &mut events)?;
        Ok(events)
    }

    /// Closes the current lot and opens the next one.
    pub fn stop(&mut self, now: DateTime<Local>) -> Result<Vec<InspectionEvent>> {
        let mut events = self.finish_lot(now)?;
        let next = self
            .aggregator
            .lot()
            .next(self.ledger.as_ref(), now)
            .context("roll to next lot")?;
        let effects = self.aggregator.start_lot(next);
        self.apply(effects, &mut events);
        self.begin_lot();
        self.emit(
            &mut events,
            InspectionEvent::LotStarted {
                lot_id: self.lot().lot_id().to_string(),
            },
        );
        Ok(events)
    }

    /// Flushes the open session and pending writes, and finalises the lot's
    /// export and remote metadata.
    pub fn finish_lot(&mut self, now: DateTime<Local>) -> Result<Vec<InspectionEvent>> {
        let mut events = Vec::new();
        let effects = self.aggregator.close(now);
        self.apply(effects, &mut events);
        self.flush_pending(now, &mut events)?;

        self.write_export(now);
        let lot = self.aggregator.lot().clone();
        let stats = self.aggregator.stats().clone();
        self.submit_remote(MirrorJob::Put {
            path: remote::meta_path(&lot.session_key()),
            body: remote::lot_payload(&lot, &stats, Some(now)),
        });
        log::info!(
            "lot {} finished: {} plates ({} passed, {} defective)",
            lot.lot_id(),
            stats.total,
            stats.passed,
            stats.defective
        );
        self.emit(
            &mut events,
            InspectionEvent::LotFinished {
                lot_id: lot.lot_id().to_string(),
                stats,
            },
        );
        Ok(events)
    }

    /// Finishes the lot and drains the remote queue.
    pub fn shutdown(mut self, now: DateTime<Local>) -> Result<()> {
        self.finish_lot(now)?;
        if let Some(worker) = self.remote.take() {
            worker.shutdown()?;
        }
        Ok(())
    }

    fn begin_lot(&mut self) {
        let lot = self.aggregator.lot().clone();
        log::info!(
            "lot {} started (next plate #{})",
            lot.lot_id(),
            lot.next_sequence_no()
        );
        self.export = match ExportMirror::create(&self.save_root, &lot) {
            Ok(export) => Some(export),
            Err(err) => {
                log::error!("export disabled for lot {}: {:#}", lot.lot_id(), err);
                None
            }
        };
        self.submit_remote(MirrorJob::Put {
            path: remote::meta_path(&lot.session_key()),
            body: remote::lot_payload(&lot, self.aggregator.stats(), None),
        });
    }

    fn apply(&mut self, effects: Vec<Effect>, events: &mut Vec<InspectionEvent>) {
        for effect in effects {
            match effect {
                Effect::Arrived {
                    sequence_no,
                    tick_id,
                } => self.emit(
                    events,
                    InspectionEvent::PlateArrived {
                        sequence_no,
                        tick_id,
                    },
                ),
                Effect::Status {
                    sequence_no,
                    status,
                } => self.emit(
                    events,
                    InspectionEvent::Status {
                        sequence_no,
                        status,
                    },
                ),
                Effect::Commit { record, supersedes } => {
                    self.pending.push_back(PendingCommit { record, supersedes })
                }
                Effect::Stats(stats) => self.emit(events, InspectionEvent::Stats(stats)),
                Effect::Departed {
                    sequence_no,
                    reason,
                } => self.emit(
                    events,
                    InspectionEvent::PlateDeparted {
                        sequence_no,
                        reason,
                    },
                ),
            }
        }
    }

    fn flush_pending(
        &mut self,
        now: DateTime<Local>,
        events: &mut Vec<InspectionEvent>,
    ) -> Result<()> {
        let mut wrote = false;
        while let Some(pending) = self.pending.front() {
            let note = if pending.supersedes { NOTE_UPDATED } else { "" };
            let row = LedgerRow::from_record(&pending.record, note);
            if let Err(err) = self.ledger.append(&row) {
                log::error!(
                    "ledger write failed for plate #{} ({} pending): {:#}",
                    pending.record.sequence_no(),
                    self.pending.len(),
                    err
                );
                if wrote {
                    self.write_export(now);
                }
                return Err(err.context(format!(
                    "persist plate #{}",
                    pending.record.sequence_no()
                )));
            }
            let Some(PendingCommit { record, supersedes }) = self.pending.pop_front() else {
                break;
            };
            if let Some(export) = self.export.as_mut() {
                export.upsert(&record, note);
            }
            self.submit_remote(MirrorJob::Post {
                path: remote::records_path(&self.aggregator.lot().session_key()),
                body: remote::record_payload(&record, supersedes),
            });
            self.emit(events, InspectionEvent::Committed { record, supersedes });
            wrote = true;
        }
        if wrote {
            self.write_export(now);
        }
        Ok(())
    }

    fn write_export(&self, now: DateTime<Local>) {
        if let Some(export) = self.export.as_ref() {
            if let Err(err) = export.write(now) {
                log::error!("{:#}", err);
            }
        }
    }

    fn submit_remote(&self, job: MirrorJob) {
        if let Some(worker) = self.remote.as_ref() {
            worker.submit(job);
        }
    }

    fn emit(&self, events: &mut Vec<InspectionEvent>, event: InspectionEvent) {
        if let Some(tx) = self.events.as_ref() {
            if tx.send(event.clone()).is_err() {
                log::debug!("event receiver dropped");
            }
        }
        events.push(event);
    }
}
