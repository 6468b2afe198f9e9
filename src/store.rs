//! Storage collaborator: numbered shards grouped into named series.
//!
//! Indexes persist their frequency table, grid postings and features as
//! series of shards (`freq`, `grid`, `feature`). Shards are addressed by a
//! numeric key and always iterate in ascending key order.

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use tokio::sync::RwLock;

/// Errors raised by a [`Store`] or while walking its shards.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("shard {shard} of series '{series}' arrived after shard {previous}")]
    OutOfOrder {
        series: String,
        previous: u64,
        shard: u64,
    },

    #[error("failed to encode series '{series}': {source}")]
    Encode {
        series: String,
        #[source]
        source: postcard::Error,
    },

    #[error("failed to decode series '{series}': {source}")]
    Decode {
        series: String,
        #[source]
        source: postcard::Error,
    },

    #[error("invalid feature shard {shard}: {source}")]
    FeatureJson {
        shard: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One stored shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub shard: u64,
    pub value: Vec<u8>,
}

/// A get/put/iterate key-value backend.
pub trait Store: Send + Sync {
    fn get(
        &self,
        series: &str,
        shard: u64,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    fn put(
        &self,
        series: &str,
        shard: u64,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Shard keys of a series, ascending.
    fn list(&self, series: &str) -> impl Future<Output = Result<Vec<u64>, StoreError>> + Send;

    /// Every shard of a series, in strictly ascending key order.
    fn iterate(&self, series: &str) -> BoxStream<'_, Result<Shard, StoreError>>;
}

type Series = BTreeMap<String, BTreeMap<u64, Vec<u8>>>;

/// In-memory store, snapshotable with postcard.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<Series>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes every series into one snapshot.
    pub async fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        let series = self.series.read().await;
        postcard::to_stdvec(&*series).map_err(|source| StoreError::Encode {
            series: "*".to_string(),
            source,
        })
    }

    /// Rebuilds a store from a [`serialize`](Self::serialize) snapshot.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, StoreError> {
        let series: Series = postcard::from_bytes(bytes).map_err(|source| StoreError::Decode {
            series: "*".to_string(),
            source,
        })?;
        Ok(Self {
            series: RwLock::new(series),
        })
    }

    /// Writes a snapshot to disk.
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = self.serialize().await?;
        tokio::fs::write(path, bytes).await?;
        tracing::debug!("Saved store snapshot to {}", path.display());
        Ok(())
    }

    /// Reads a snapshot written by [`save`](Self::save).
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        Self::deserialize(&bytes)
    }
}

impl Store for MemoryStore {
    async fn get(&self, series: &str, shard: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self.series.read().await;
        Ok(data.get(series).and_then(|s| s.get(&shard)).cloned())
    }

    async fn put(&self, series: &str, shard: u64, value: Vec<u8>) -> Result<(), StoreError> {
        tracing::trace!(series, shard, bytes = value.len(), "put shard");
        self.series
            .write()
            .await
            .entry(series.to_string())
            .or_default()
            .insert(shard, value);
        Ok(())
    }

    async fn list(&self, series: &str) -> Result<Vec<u64>, StoreError> {
        let data = self.series.read().await;
        Ok(data
            .get(series)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default())
    }

    fn iterate(&self, series: &str) -> BoxStream<'_, Result<Shard, StoreError>> {
        let series = series.to_string();
        // The cursor is the lowest key not yet yielded; `None` once exhausted.
        stream::unfold(Some(0u64), move |cursor| {
            let series = series.clone();
            async move {
                let from = cursor?;
                let data = self.series.read().await;
                let (&shard, value) = data.get(&series)?.range(from..).next()?;
                let item = Shard {
                    shard,
                    value: value.clone(),
                };
                Some((Ok(item), shard.checked_add(1)))
            }
        })
        .boxed()
    }
}

/// Pull-based, forward-only walk over one series.
///
/// Each [`next`](Self::next) suspends until the store yields the following
/// shard or signals the end. Shard keys are checked to be strictly ascending;
/// a regression ends the walk with [`StoreError::OutOfOrder`]. Once finished
/// (or failed) the iterator keeps returning `Ok(None)`.
pub struct GeocoderDataIterator<'a> {
    series: String,
    inner: BoxStream<'a, Result<Shard, StoreError>>,
    last: Option<u64>,
    done: bool,
}

impl<'a> GeocoderDataIterator<'a> {
    pub fn new<S: Store + ?Sized>(store: &'a S, series: &str) -> Self {
        Self {
            series: series.to_string(),
            inner: store.iterate(series),
            last: None,
            done: false,
        }
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    pub async fn next(&mut self) -> Result<Option<Shard>, StoreError> {
        if self.done {
            return Ok(None);
        }
        let shard = match self.inner.next().await {
            Some(Ok(shard)) => shard,
            Some(Err(e)) => {
                self.done = true;
                return Err(e);
            }
            None => {
                self.done = true;
                return Ok(None);
            }
        };
        if let Some(previous) = self.last.filter(|&previous| shard.shard <= previous) {
            self.done = true;
            return Err(StoreError::OutOfOrder {
                series: self.series.clone(),
                previous,
                shard: shard.shard,
            });
        }
        self.last = Some(shard.shard);
        Ok(Some(shard))
    }
}

impl std::fmt::Debug for GeocoderDataIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeocoderDataIterator")
            .field("series", &self.series)
            .field("last", &self.last)
            .field("done", &self.done)
            .finish()
    }
}
