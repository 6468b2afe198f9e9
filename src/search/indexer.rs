//! Streaming indexing: newline-delimited GeoJSON in, processed documents out.

use crate::config::IndexOptions;
use crate::error::{GeocoderError, Result};
use crate::search::index::{GeocoderIndex, validate_zoom};
use crate::store::Store;
use crate::types::Document;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Outcome of a completed indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSummary {
    pub docs: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

/// Reads documents from `input` in batches of `options.batch_size`, applies
/// them to `index`, echoes each processed document as one JSON line to
/// `output`, and finally persists the index.
///
/// Blank lines are skipped. The first malformed line or rejected batch ends the
/// run with that error; batches applied before it stay applied.
pub async fn index_stream<S, R, W>(
    index: &GeocoderIndex<S>,
    input: R,
    mut output: W,
    options: &IndexOptions,
) -> Result<IndexSummary>
where
    S: Store,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    validate_zoom(options.zoom)?;
    let start = Instant::now();
    let batch_size = options.batch_size.max(1);
    let mut summary = IndexSummary {
        docs: 0,
        batches: 0,
        elapsed: Duration::ZERO,
    };

    let mut lines = input.lines();
    let mut line_no = 0;
    let mut batch: Vec<Document> = Vec::with_capacity(batch_size);
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let doc = serde_json::from_str(&line)
            .map_err(|source| GeocoderError::InvalidDocument { line: line_no, source })?;
        batch.push(doc);
        if batch.len() >= batch_size {
            flush(index, &mut batch, &mut output, options, &mut summary).await?;
        }
    }
    flush(index, &mut batch, &mut output, options, &mut summary).await?;

    index.store().await?;
    output.flush().await?;
    summary.elapsed = start.elapsed();
    tracing::info!(
        index = index.name(),
        docs = summary.docs,
        batches = summary.batches,
        elapsed = ?summary.elapsed,
        "indexing complete"
    );
    Ok(summary)
}

async fn flush<S, W>(
    index: &GeocoderIndex<S>,
    batch: &mut Vec<Document>,
    output: &mut W,
    options: &IndexOptions,
    summary: &mut IndexSummary,
) -> Result<()>
where
    S: Store,
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }
    if let Err(e) = index.update(batch, options).await {
        tracing::warn!(index = index.name(), batch = summary.batches, "rejected batch: {}", e);
        return Err(e);
    }
    for doc in batch.iter() {
        let mut line = serde_json::to_vec(doc).map_err(std::io::Error::other)?;
        line.push(b'\n');
        output.write_all(&line).await?;
    }
    summary.docs += batch.len();
    summary.batches += 1;
    tracing::debug!(index = index.name(), docs = summary.docs, "flushed batch");
    batch.clear();
    Ok(())
}
