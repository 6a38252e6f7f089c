//! Plate Inspector
//!
//! Turns a flickering per-frame detector stream into exactly-once plate
//! records for a single inspection lane.
//!
//! # Architecture
//!
//! Each tick a detector [`Frame`] flows through:
//!
//! 1. **Presence debouncer**: hysteresis over "plate detected" per tick.
//! 2. **Identity tracker**: catches a plate swapped for another without a
//!    clean absence gap.
//! 3. **Attribute aggregator**: latches defects (running max) and votes on shape.
//! 4. **Commit policy**: emits one [`PlateRecord`] per plate, superseded only by
//!    a record with a larger defect set for the same sequence number.
//!
//! [`PlateAggregator`] does all of this without I/O and returns [`Effect`]s.
//! [`Inspector`] interprets them against the local ledger (system of record),
//! the JSON export mirror and the best-effort remote mirror.
//!
//! # Module Structure
//!
//! - `frame`: detector boundary types and the frame adapter
//! - `change`: IoU, centroid distance, texture delta
//! - `presence`, `identity`, `session`, `aggregator`: the per-tick core
//! - `record`: records, statuses, stats, lots
//! - `ledger`, `export`, `remote`: persistence sinks
//! - `report`: weekly roll-up over the ledger
//! - `inspector`: effect interpreter and lot lifecycle
//! - `ingest`: frame sources for the tick loop
//! - `config`: configuration loading

pub mod aggregator;
pub mod change;
pub mod config;
pub mod export;
pub mod frame;
pub mod identity;
pub mod ingest;
pub mod inspector;
pub mod ledger;
pub mod presence;
pub mod record;
pub mod remote;
pub mod report;
pub mod session;

pub use aggregator::{DepartureReason, Effect, PlateAggregator};
pub use config::{DetectorSettings, GateSettings, IdentitySettings, InspectorConfig, RemoteSettings};
pub use export::ExportMirror;
pub use frame::{
    DefectClass, Detection, DetectionKind, Frame, FrameAdapter, GrayPatch, PlateShape,
    RawDetection, Rect, ShapeClass,
};
pub use ingest::{FeedPoll, FrameFeed, FrameSource, JsonlSource, ScriptedSource};
pub use inspector::{InspectionEvent, Inspector};
pub use ledger::{
    current_rows, hash_entry, InMemoryLedgerStore, LedgerRow, LedgerStore, SqliteLedgerStore,
};
pub use presence::{PresenceDebouncer, PresenceState, Transition};
pub use record::{format_lot_id, parse_lot_id, Lot, PlateRecord, PlateStatus, SessionStats};
pub use remote::{InMemoryMirror, MirrorJob, MirrorWorker, RemoteMirror, RestMirror};
pub use report::{week_bounds, weekly_summary, LotSummary, WeeklySummary};
pub use session::PlateSession;
