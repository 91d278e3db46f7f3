//! Wires the ledger, vault, email poller, and backup subsystems into
//! the Direct Exporter and the top-level `Engine` a host process drives
//! (spec §2, §4.11, §5).

mod engine;
mod exporter;

pub use engine::{BackupCycleReport, Engine, EnginePaths, ExportCycleReport};
pub use exporter::{export_capture, ExportOutcome};
