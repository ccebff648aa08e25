//! Emits each fetched record downstream, one JSON document per line.

use crate::error::{Error, Result};
use crate::source::AuditLogRecord;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};

/// RecordSink receives records in fetch order. Implementations must not reorder or drop records,
/// a failed emit is returned so the tick can be abandoned instead of silently losing the record.
#[trait_variant::make(Send)]
pub trait RecordSink {
    async fn emit(&mut self, record: &AuditLogRecord) -> Result<()>;
}

/// Writes compact JSON lines to the wrapped writer, flushing after every record. A slow reader
/// applies back-pressure to the tick without blocking a runtime worker.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl JsonLinesSink<io::Stdout> {
    /// Records go to stdout, logs go to stderr.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: AsyncWrite + Unpin + Send> RecordSink for JsonLinesSink<W> {
    async fn emit(&mut self, record: &AuditLogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| Error::Sink(format!("Failed to serialize record: {e}")))?;
        line.push(b'\n');

        self.writer
            .write_all(&line)
            .await
            .map_err(|e| Error::Sink(format!("Failed to write record: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Sink(format!("Failed to flush record: {e}")))
    }
}
