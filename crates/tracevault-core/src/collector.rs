use tokio::sync::mpsc;

use crate::error::CollectorError;
use crate::trace::TraceRecord;

/// Source of freshly produced trace records.
pub trait TraceCollector: Send {
    /// Start collecting.
    /// Returns a receiver that yields collected records.
    fn start(&mut self) -> Result<mpsc::Receiver<TraceRecord>, CollectorError>;

    /// Gracefully stop collecting.
    fn stop(&mut self) -> Result<(), CollectorError>;

    /// Human-readable name of this collector (e.g., "jsonl").
    fn name(&self) -> &str;
}
