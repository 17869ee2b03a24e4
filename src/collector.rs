use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracevault_core::collector::TraceCollector;
use tracevault_core::error::CollectorError;
use tracevault_core::trace::TraceRecord;
use tracing::{info, warn};

/// Reads one JSON-encoded [`TraceRecord`] per line. Malformed lines are
/// logged and skipped.
pub struct JsonLinesCollector<R> {
    reader: Option<R>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R> JsonLinesCollector<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            shutdown_tx: None,
            task_handle: None,
        }
    }
}

impl<R> TraceCollector for JsonLinesCollector<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn start(&mut self) -> Result<mpsc::Receiver<TraceRecord>, CollectorError> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| CollectorError::StartFailed("collector already started".into()))?;
        let (record_tx, record_rx) = mpsc::channel(4096);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut line_no = 0u64;
            loop {
                let line = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("collector read error: {e}");
                        break;
                    }
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TraceRecord>(&line) {
                    Ok(record) => {
                        if record_tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(line = line_no, "skipping malformed record: {e}"),
                }
            }
            info!(lines = line_no, "collector finished");
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.task_handle = Some(task_handle);
        Ok(record_rx)
    }

    fn stop(&mut self) -> Result<(), CollectorError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    use tracevault_core::trace::{Span, SpanId, TraceId};

    fn line(n: u8) -> String {
        let record = TraceRecord {
            trace_id: TraceId([n; 16]),
            root: Span {
                span_id: SpanId([n; 8]),
                name: "GET /".to_string(),
                tags: HashMap::new(),
                children: Vec::new(),
            },
            start_time: SystemTime::now(),
            duration: Duration::from_millis(3),
            tags: HashMap::new(),
        };
        serde_json::to_string(&record).unwrap()
    }

    #[tokio::test]
    async fn test_reads_records_and_skips_garbage() {
        let input = format!("{}\nnot json\n\n{}\n", line(1), line(2));
        let mut collector = JsonLinesCollector::new(std::io::Cursor::new(input.into_bytes()));
        let mut rx = collector.start().unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.trace_id, TraceId([1; 16]));
        assert_eq!(second.trace_id, TraceId([2; 16]));
        assert!(rx.recv().await.is_none());
        assert!(collector.start().is_err());
    }
}
