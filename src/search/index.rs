//! Index builder: documents in, frequency statistics and grid postings out.
//!
//! Each [`GeocoderIndex`] owns one layered source (country, place, address...).
//! `update` validates a whole batch before touching shared state, then applies
//! it under a single write lock, so readers never observe half a batch.

use crate::config::{IndexConfig, IndexOptions};
use crate::error::{GeocoderError, Result};
use crate::search::grid::{GridCodec, GridEntry, MAX_ZOOM, Tile, cover_rings, grid_id};
use crate::search::tokenize::{PhraseId, TokenReplacer, create_replacer, encode_tokens, tokenize};
use crate::store::{GeocoderDataIterator, MemoryStore, Store, StoreError};
use crate::types::{Document, Geometry, LngLat, split_synonyms};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use xxhash_rust::xxh3::xxh3_64;

/// Largest polygon (in vertices) accepted for indexing.
pub const MAX_POLYGON_VERTICES: usize = 50_000;

/// Largest tile cover a single feature may produce.
pub const MAX_COVER_TILES: u64 = 100_000;

/// Relevance of every synonym after the first.
const SYNONYM_RELEV: f64 = 0.8;

/// Series names used for persistence.
pub const FREQ_SERIES: &str = "freq";
pub const GRID_SERIES: &str = "grid";
pub const FEATURE_SERIES: &str = "feature";

/// Checks `0 < zoom < 15` and narrows it.
pub fn validate_zoom(zoom: i32) -> Result<u8> {
    if zoom > i32::from(MAX_ZOOM) {
        return Err(GeocoderError::ZoomTooHigh(zoom));
    }
    if zoom <= 0 {
        return Err(GeocoderError::ZoomTooLow(zoom));
    }
    Ok(zoom as u8)
}

/// Checks that a document has an id, something to place it by, and no
/// oversized polygon.
pub fn validate_geometry(doc: &Document) -> Result<()> {
    let id = doc.id.ok_or(GeocoderError::MissingId)?;
    let props = &doc.properties;
    if doc.geometry.is_none() && props.center.is_none() && props.zxy.is_empty() {
        return Err(GeocoderError::GeometryRequired(id));
    }
    if let Some(geometry) = &doc.geometry
        && geometry.max_polygon_vertices() > MAX_POLYGON_VERTICES
    {
        return Err(GeocoderError::TooManyVertices(id));
    }
    Ok(())
}

/// Drops geometry the index has no use for once covers are computed.
///
/// Only address indexes keep geometry, and even they drop it for documents that
/// list explicit address numbers.
pub fn clean_docs(config: &IndexConfig, docs: &mut [Document]) {
    for doc in docs {
        if !config.address || !doc.properties.address_numbers.is_empty() {
            doc.geometry = None;
        }
    }
}

/// Term statistics for one index.
///
/// Counts only ever grow: indexing the same document twice counts it twice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyTable {
    pub count: u64,
    pub max_score: f64,
    pub terms: BTreeMap<String, u64>,
}

impl FrequencyTable {
    pub const COUNT: &'static str = "__COUNT__";
    pub const MAX: &'static str = "__MAX__";

    /// Value of a term or of one of the `__COUNT__` / `__MAX__` markers.
    pub fn get(&self, term: &str) -> Option<f64> {
        match term {
            Self::COUNT => Some(self.count as f64),
            Self::MAX => Some(self.max_score),
            term => self.terms.get(term).map(|&n| n as f64),
        }
    }

    /// Adds another table's counts; the max score only moves up.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.max_score = self.max_score.max(other.max_score);
        for (term, n) in &other.terms {
            *self.terms.entry(term.clone()).or_default() += n;
        }
    }

    fn add_tokens(&mut self, tokens: &[String]) {
        self.count += tokens.len() as u64;
        for token in tokens {
            *self.terms.entry(token.clone()).or_default() += 1;
        }
    }

    /// Flattened `term -> value` map including the markers.
    fn to_series(&self) -> BTreeMap<String, f64> {
        let mut series: BTreeMap<String, f64> =
            self.terms.iter().map(|(t, &n)| (t.clone(), n as f64)).collect();
        series.insert(Self::COUNT.to_string(), self.count as f64);
        series.insert(Self::MAX.to_string(), self.max_score);
        series
    }

    fn absorb_series(&mut self, series: BTreeMap<String, f64>) {
        for (term, value) in series {
            match term.as_str() {
                Self::COUNT => self.count += value as u64,
                Self::MAX => self.max_score = self.max_score.max(value),
                _ => *self.terms.entry(term).or_default() += value as u64,
            }
        }
    }
}

/// A phrase a document is findable by.
#[derive(Debug, Clone, PartialEq)]
struct IndexablePhrase {
    tokens: Vec<String>,
    relev: f64,
}

/// Every phrase of a document: each `carmen:text` synonym and each localized
/// text, after token replacement. The first synonym of a text has relevance 1.
fn indexable_phrases(doc: &Document, replacer: &TokenReplacer) -> Vec<IndexablePhrase> {
    let props = &doc.properties;
    let texts = std::iter::once(props.text.as_str()).chain(props.localized().map(|(_, text)| text));

    let mut phrases: Vec<IndexablePhrase> = Vec::new();
    for text in texts {
        for (i, synonym) in split_synonyms(text).enumerate() {
            let tokens = replacer.replace_all(&tokenize(synonym));
            if tokens.is_empty() {
                continue;
            }
            let relev = if i == 0 { 1.0 } else { SYNONYM_RELEV };
            match phrases.iter_mut().find(|p| p.tokens == tokens) {
                Some(existing) => existing.relev = existing.relev.max(relev),
                None => phrases.push(IndexablePhrase { tokens, relev }),
            }
        }
    }
    phrases
}

/// Frequency snapshot of a batch, independent of any stored state.
pub fn generate_frequency(docs: &[Document], replacer: &TokenReplacer) -> FrequencyTable {
    let mut freq = FrequencyTable::default();
    for doc in docs {
        if let Some(score) = doc.properties.score {
            freq.max_score = freq.max_score.max(score);
        }
        for phrase in indexable_phrases(doc, replacer) {
            freq.add_tokens(&phrase.tokens);
        }
    }
    freq
}

/// Buckets a score into 0..=7 relative to the index maximum.
fn score_bucket(score: Option<f64>, max: f64) -> u8 {
    match score {
        Some(score) if score > 0.0 && max > 0.0 => (7.0 * score / max).ceil().clamp(0.0, 7.0) as u8,
        _ => 0,
    }
}

/// A feature as kept by an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFeature {
    pub id: u64,
    pub doc: Document,
    pub center: LngLat,
    pub cover: Vec<Tile>,
    /// Score bucket, 0..=7, against the index maximum when the feature was written.
    pub score: u8,
    pub phrases: Vec<PhraseId>,
}

impl StoredFeature {
    pub fn text(&self) -> &str {
        self.doc.properties.display_text()
    }

    /// `carmen:score` as indexed; 0 when absent.
    ///
    /// Ranking compares this rather than [`score`](Self::score), whose bucket
    /// goes stale once a later batch raises the index maximum.
    pub fn document_score(&self) -> f64 {
        self.doc.properties.score.unwrap_or(0.0)
    }

    /// Whether any cover tile overlaps any of `tiles`, compared at the
    /// coarsest zoom involved.
    pub fn overlaps(&self, tiles: &[Tile]) -> bool {
        let Some(z) = self.cover.iter().chain(tiles).map(|t| t.z).min() else {
            return false;
        };
        let (small, large) = if self.cover.len() <= tiles.len() {
            (self.cover.as_slice(), tiles)
        } else {
            (tiles, self.cover.as_slice())
        };
        let seen: AHashSet<Tile> = small.iter().map(|t| t.ancestor(z)).collect();
        large.iter().any(|t| seen.contains(&t.ancestor(z)))
    }
}

/// A feature reached through a phrase posting.
#[derive(Debug, Clone)]
pub struct PhraseHit {
    pub feature: Arc<StoredFeature>,
    /// Best relevance among the postings leading to the feature.
    pub relev: f64,
}

/// Summary of an index's contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub terms: usize,
    pub count: u64,
    pub max_score: f64,
    pub phrases: usize,
    pub postings: usize,
    pub features: usize,
    /// Most frequent terms, most frequent first.
    pub top_terms: Vec<(String, u64)>,
}

#[derive(Debug, Default)]
struct IndexState {
    freq: FrequencyTable,
    grid: BTreeMap<PhraseId, Vec<u64>>,
    tiles: BTreeMap<(u32, u32), BTreeSet<u64>>,
    features: BTreeMap<u32, BTreeMap<u64, Arc<StoredFeature>>>,
    generation: u64,
}

impl IndexState {
    fn feature_count(&self) -> usize {
        self.features.values().map(BTreeMap::len).sum()
    }

    /// Inserts or replaces a feature, keeping the tile lookup in step.
    fn put_feature(&mut self, feature: Arc<StoredFeature>) {
        let bucket = self.features.entry(grid_id(feature.id)).or_default();
        if let Some(old) = bucket.insert(feature.id, Arc::clone(&feature)) {
            for tile in &old.cover {
                if let Some(ids) = self.tiles.get_mut(&(tile.x, tile.y)) {
                    ids.remove(&old.id);
                }
            }
        }
        for tile in &feature.cover {
            self.tiles.entry((tile.x, tile.y)).or_default().insert(feature.id);
        }
    }
}

/// A validated document, ready to be applied.
struct Prepared {
    id: u64,
    center: LngLat,
    cover: Vec<Tile>,
    score: Option<f64>,
    phrases: Vec<(PhraseId, f64)>,
}

/// One layered source of documents.
pub struct GeocoderIndex<S: Store = MemoryStore> {
    config: IndexConfig,
    codec: GridCodec,
    replacer: TokenReplacer,
    store: S,
    state: RwLock<IndexState>,
}

impl<S: Store> std::fmt::Debug for GeocoderIndex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeocoderIndex")
            .field("name", &self.config.name)
            .field("zoom", &self.codec.zoom())
            .field("address", &self.config.address)
            .finish_non_exhaustive()
    }
}

impl<S: Store> GeocoderIndex<S> {
    /// An empty index over `store`.
    pub fn new(config: IndexConfig, store: S) -> Result<Self> {
        let zoom = validate_zoom(config.maxzoom)?;
        Ok(Self {
            codec: GridCodec::new(zoom)?,
            replacer: create_replacer(&config.tokens),
            config,
            store,
            state: RwLock::new(IndexState::default()),
        })
    }

    /// An index hydrated from what [`store`](Self::store) previously wrote.
    pub async fn open(config: IndexConfig, store: S) -> Result<Self> {
        let index = Self::new(config, store)?;
        let start = Instant::now();
        let state = index.load_state().await?;
        tracing::info!(
            index = %index.config.name,
            phrases = state.grid.len(),
            features = state.feature_count(),
            elapsed = ?start.elapsed(),
            "opened index"
        );
        *index.state.write().await = state;
        Ok(index)
    }

    async fn load_state(&self) -> Result<IndexState> {
        let mut state = IndexState::default();

        let mut freq = self.geocoder_data_iterator(FREQ_SERIES);
        while let Some(shard) = freq.next().await? {
            let series: BTreeMap<String, f64> = decode(FREQ_SERIES, &shard.value)?;
            state.freq.absorb_series(series);
        }

        let mut grid = self.geocoder_data_iterator(GRID_SERIES);
        while let Some(shard) = grid.next().await? {
            let postings: BTreeMap<PhraseId, Vec<u64>> = decode(GRID_SERIES, &shard.value)?;
            state.grid.extend(postings);
        }

        let mut features = self.geocoder_data_iterator(FEATURE_SERIES);
        while let Some(shard) = features.next().await? {
            let batch: Vec<StoredFeature> = serde_json::from_slice(&shard.value)
                .map_err(|source| StoreError::FeatureJson {
                    shard: shard.shard,
                    source,
                })?;
            for feature in batch {
                state.put_feature(Arc::new(feature));
            }
        }
        Ok(state)
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_address(&self) -> bool {
        self.config.address
    }

    pub fn zoom(&self) -> u8 {
        self.codec.zoom()
    }

    pub fn codec(&self) -> GridCodec {
        self.codec
    }

    pub fn replacer(&self) -> &TokenReplacer {
        &self.replacer
    }

    pub fn store_backend(&self) -> &S {
        &self.store
    }

    /// Bumped by every successful update.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    /// Indexes a batch of documents.
    ///
    /// Derives `carmen:center` in place where it is missing. The whole batch is
    /// validated first: one bad document fails the call and nothing is written.
    pub async fn update(&self, docs: &mut [Document], options: &IndexOptions) -> Result<()> {
        let zoom = validate_zoom(options.zoom)?;
        if zoom != self.codec.zoom() {
            return Err(GeocoderError::InvalidConfig(format!(
                "index '{}' has maxzoom {} but was updated at zoom {}",
                self.config.name,
                self.codec.zoom(),
                zoom
            )));
        }
        let start = Instant::now();

        let mut prepared = Vec::with_capacity(docs.len());
        for doc in docs.iter_mut() {
            prepared.push(self.prepare(doc)?);
        }
        let batch_freq = generate_frequency(docs, &self.replacer);
        clean_docs(&self.config, docs);

        let mut state = self.state.write().await;
        state.freq.merge(&batch_freq);
        let max_score = state.freq.max_score;

        let mut touched = BTreeSet::new();
        for (item, doc) in prepared.into_iter().zip(docs.iter()) {
            let score = score_bucket(item.score, max_score);
            for &(phrase, relev) in &item.phrases {
                let postings = state.grid.entry(phrase).or_default();
                for tile in &item.cover {
                    postings.push(self.codec.pack(&GridEntry {
                        tile: *tile,
                        relev,
                        score,
                        id: grid_id(item.id),
                    }));
                }
                touched.insert(phrase);
            }
            state.put_feature(Arc::new(StoredFeature {
                id: item.id,
                doc: doc.clone(),
                center: item.center,
                cover: item.cover,
                score,
                phrases: item.phrases.iter().map(|&(phrase, _)| phrase).collect(),
            }));
        }
        for phrase in touched {
            if let Some(postings) = state.grid.get_mut(&phrase) {
                postings.sort_unstable();
                postings.dedup();
            }
        }
        state.generation += 1;

        tracing::info!(
            index = %self.config.name,
            docs = docs.len(),
            phrases = state.grid.len(),
            elapsed = ?start.elapsed(),
            "indexed batch"
        );
        Ok(())
    }

    /// Validates one document and computes everything `update` writes for it.
    fn prepare(&self, doc: &mut Document) -> Result<Prepared> {
        let id = doc.id.ok_or(GeocoderError::MissingId)?;
        if doc.properties.center.is_none() {
            doc.properties.center = match &doc.geometry {
                Some(geometry) => geometry.center(),
                None => match doc.properties.zxy.first() {
                    Some(zxy) => Some(Tile::parse(zxy)?.center()),
                    None => None,
                },
            };
        }
        validate_geometry(doc)?;
        let center = doc.properties.center.ok_or(GeocoderError::GeometryRequired(id))?;
        let cover = self.cover(doc, id, center)?;

        let phrases = indexable_phrases(doc, &self.replacer)
            .into_iter()
            .map(|p| (encode_tokens(&p.tokens), p.relev))
            .collect();

        Ok(Prepared {
            id,
            center,
            cover,
            score: doc.properties.score,
            phrases,
        })
    }

    /// Tiles at the index zoom a document is findable in: its explicit `carmen:zxy`
    /// cover, else its geometry, else its center.
    fn cover(&self, doc: &Document, id: u64, center: LngLat) -> Result<Vec<Tile>> {
        let z = self.codec.zoom();
        let too_large = |tiles: u64| GeocoderError::CoverTooLarge { id, tiles, zoom: z };
        // Rejections report the bounding-box tile count, an upper bound of the cover.
        let bbox_too_large = |geometry: &Geometry| {
            let tiles = geometry.bbox().map_or(0, |[w, s, e, n]| {
                let a = Tile::containing(z, [w, n]);
                let b = Tile::containing(z, [e, s]);
                u64::from(b.x - a.x + 1) * u64::from(b.y - a.y + 1)
            });
            too_large(tiles)
        };
        let mut cover = BTreeSet::new();

        if !doc.properties.zxy.is_empty() {
            for zxy in &doc.properties.zxy {
                let tile = Tile::parse(zxy)?;
                if tile.z >= z {
                    cover.insert(tile.ancestor(z));
                    continue;
                }
                let shift = z - tile.z;
                let side = 1u32 << shift;
                let tiles = u64::from(side) * u64::from(side);
                if tiles + cover.len() as u64 > MAX_COVER_TILES {
                    return Err(too_large(tiles + cover.len() as u64));
                }
                for x in (tile.x << shift)..((tile.x << shift) + side) {
                    for y in (tile.y << shift)..((tile.y << shift) + side) {
                        cover.insert(Tile::new(z, x, y));
                    }
                }
            }
        } else if let Some(geometry) = &doc.geometry {
            let tiles = match geometry {
                Geometry::Point(_) | Geometry::MultiPoint(_) => geometry
                    .points()
                    .map(|points| points.iter().map(|p| Tile::containing(z, *p)).collect()),
                Geometry::LineString(line) => cover_rings(z, &[line.as_slice()], false, MAX_COVER_TILES),
                Geometry::MultiLineString(lines) => cover_rings(z, &as_slices(lines), false, MAX_COVER_TILES),
                Geometry::Polygon(rings) => cover_rings(z, &as_slices(rings), true, MAX_COVER_TILES),
                Geometry::MultiPolygon(polygons) => {
                    let mut tiles = Vec::new();
                    for rings in polygons {
                        match cover_rings(z, &as_slices(rings), true, MAX_COVER_TILES) {
                            Some(part) => tiles.extend(part),
                            None => return Err(bbox_too_large(geometry)),
                        }
                    }
                    Some(tiles)
                }
            };
            cover.extend(tiles.ok_or_else(|| bbox_too_large(geometry))?);
            if cover.len() as u64 > MAX_COVER_TILES {
                return Err(too_large(cover.len() as u64));
            }
        }
        if cover.is_empty() {
            cover.insert(Tile::containing(z, center));
        }
        Ok(cover.into_iter().collect())
    }

    /// Flushes frequency table, postings and features to the store.
    pub async fn store(&self) -> Result<()> {
        let state = self.state.read().await;
        let start = Instant::now();

        let mut freq_shards: BTreeMap<u64, BTreeMap<String, f64>> = BTreeMap::new();
        for (term, value) in state.freq.to_series() {
            freq_shards
                .entry(xxh3_64(term.as_bytes()) >> 52)
                .or_default()
                .insert(term, value);
        }
        for (shard, series) in &freq_shards {
            self.store.put(FREQ_SERIES, *shard, encode(FREQ_SERIES, series)?).await?;
        }

        let mut grid_shards: BTreeMap<u64, BTreeMap<PhraseId, &Vec<u64>>> = BTreeMap::new();
        for (phrase, postings) in &state.grid {
            grid_shards.entry(phrase >> 52).or_default().insert(*phrase, postings);
        }
        for (shard, postings) in &grid_shards {
            self.store.put(GRID_SERIES, *shard, encode(GRID_SERIES, postings)?).await?;
        }

        let mut feature_shards: BTreeMap<u64, Vec<&StoredFeature>> = BTreeMap::new();
        for (gid, bucket) in &state.features {
            feature_shards
                .entry(u64::from(*gid) >> 8)
                .or_default()
                .extend(bucket.values().map(Arc::as_ref));
        }
        for (shard, features) in &feature_shards {
            let bytes = serde_json::to_vec(features).map_err(|source| StoreError::FeatureJson {
                shard: *shard,
                source,
            })?;
            self.store.put(FEATURE_SERIES, *shard, bytes).await?;
        }

        tracing::debug!(
            index = %self.config.name,
            freq_shards = freq_shards.len(),
            grid_shards = grid_shards.len(),
            feature_shards = feature_shards.len(),
            elapsed = ?start.elapsed(),
            "stored index"
        );
        Ok(())
    }

    /// Lazy, forward-only walk over a persisted series such as `freq`.
    pub fn geocoder_data_iterator(&self, series: &str) -> GeocoderDataIterator<'_> {
        GeocoderDataIterator::new(&self.store, series)
    }

    pub async fn frequency(&self, term: &str) -> Option<f64> {
        self.state.read().await.freq.get(term)
    }

    pub async fn frequency_table(&self) -> FrequencyTable {
        self.state.read().await.freq.clone()
    }

    /// Phrase ids that have postings, ascending.
    pub async fn phrases(&self) -> Vec<PhraseId> {
        self.state.read().await.grid.keys().copied().collect()
    }

    /// Packed grid keys of a phrase, ascending.
    pub async fn grid(&self, phrase: PhraseId) -> Option<Vec<u64>> {
        self.state.read().await.grid.get(&phrase).cloned()
    }

    pub async fn feature(&self, id: u64) -> Option<Arc<StoredFeature>> {
        let state = self.state.read().await;
        state.features.get(&grid_id(id))?.get(&id).cloned()
    }

    /// Distinct features reachable from a phrase's postings.
    pub async fn phrase_hits(&self, phrase: PhraseId) -> Vec<PhraseHit> {
        let state = self.state.read().await;
        let Some(postings) = state.grid.get(&phrase) else {
            return Vec::new();
        };

        let mut hits: BTreeMap<u64, PhraseHit> = BTreeMap::new();
        for &key in postings {
            let entry = self.codec.unpack(key);
            let Some(bucket) = state.features.get(&entry.id) else {
                continue;
            };
            for feature in bucket.values().filter(|f| f.phrases.contains(&phrase)) {
                hits.entry(feature.id)
                    .and_modify(|hit| hit.relev = hit.relev.max(entry.relev))
                    .or_insert_with(|| PhraseHit {
                        feature: Arc::clone(feature),
                        relev: entry.relev,
                    });
            }
        }
        hits.into_values().collect()
    }

    /// Features whose cover contains `point`, best score first.
    pub async fn features_at(&self, point: LngLat) -> Vec<Arc<StoredFeature>> {
        let tile = Tile::containing(self.codec.zoom(), point);
        let state = self.state.read().await;
        let Some(ids) = state.tiles.get(&(tile.x, tile.y)) else {
            return Vec::new();
        };
        let mut found: Vec<Arc<StoredFeature>> = ids
            .iter()
            .filter_map(|id| state.features.get(&grid_id(*id))?.get(id).cloned())
            .collect();
        found.sort_by(|a, b| {
            b.document_score()
                .total_cmp(&a.document_score())
                .then(a.id.cmp(&b.id))
        });
        found
    }

    /// Counts and the most frequent terms.
    pub async fn analyze(&self) -> IndexStats {
        let state = self.state.read().await;
        let mut top_terms: Vec<(String, u64)> =
            state.freq.terms.iter().map(|(t, &n)| (t.clone(), n)).collect();
        top_terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_terms.truncate(10);

        IndexStats {
            terms: state.freq.terms.len(),
            count: state.freq.count,
            max_score: state.freq.max_score,
            phrases: state.grid.len(),
            postings: state.grid.values().map(Vec::len).sum(),
            features: state.feature_count(),
            top_terms,
        }
    }
}

fn as_slices(rings: &[Vec<LngLat>]) -> Vec<&[LngLat]> {
    rings.iter().map(Vec::as_slice).collect()
}

fn encode<T: Serialize + ?Sized>(series: &str, value: &T) -> std::result::Result<Vec<u8>, StoreError> {
    postcard::to_stdvec(value).map_err(|source| StoreError::Encode {
        series: series.to_string(),
        source,
    })
}

fn decode<'a, T: Deserialize<'a>>(series: &str, bytes: &'a [u8]) -> std::result::Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|source| StoreError::Decode {
        series: series.to_string(),
        source,
    })
}
