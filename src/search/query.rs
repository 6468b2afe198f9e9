//! Query engine: forward and reverse geocoding across layered indexes.
//!
//! Indexes are ordered coarse to fine (country first, poi last); an index's
//! position doubles as the rank of the type it is named after. A feature may
//! present as any type its index owns, which lets e.g. a region stand in as a
//! place where no finer place exists.

use crate::cache::{TileCache, TileKey};
use crate::config::{GeocodeOptions, GeocoderConfig};
use crate::error::{GeocoderError, Result};
use crate::lang::{Text, get_text};
use crate::search::grid::Tile;
use crate::search::index::{GeocoderIndex, StoredFeature};
use crate::search::scoring::relevance;
use crate::search::tokenize::{encode_tokens, mask_address, tokenize};
use crate::store::{MemoryStore, Store};
use crate::types::{ContextEntry, GeocodeResponse, LngLat, ResultFeature};
use futures::future::join_all;
use rapidfuzz::distance::jaro_winkler;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

/// Queries longer than this are truncated before matching.
pub const MAX_QUERY_TOKENS: usize = 20;

/// Upper bound on candidate stacks assembled for one query.
const MAX_STACKS: usize = 2_000;

static COORDINATES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*$")
        .expect("coordinate pattern is valid")
});

/// Parses a reverse query of the form `lon,lat`.
///
/// Returns `Ok(None)` for anything that is not shaped like a coordinate pair,
/// and an error for a pair outside `[-180, 180] x [-90, 90]`.
///
/// - `"0,0"` → `Some([0.0, 0.0])`
/// - `"-75.5, 38.3"` → `Some([-75.5, 38.3])`
/// - `"1234 main st"` → `None`
pub fn parse_coordinates(query: &str) -> Result<Option<LngLat>> {
    let Some(caps) = COORDINATES.captures(query) else {
        return Ok(None);
    };
    let invalid = || GeocoderError::InvalidCoordinates(query.trim().to_string());
    let lon: f64 = caps[1].parse().map_err(|_| invalid())?;
    let lat: f64 = caps[2].parse().map_err(|_| invalid())?;
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return Err(invalid());
    }
    Ok(Some([lon, lat]))
}

/// One level of a spatial hierarchy: a feature and the index it came from.
#[derive(Debug, Clone)]
pub struct ChainLink {
    pub index: usize,
    pub feature: Arc<StoredFeature>,
}

/// A phrase of the query found in one index.
#[derive(Debug, Clone)]
struct PhraseMatch {
    index: usize,
    feature: Arc<StoredFeature>,
    relev: f64,
    /// First query token covered, for word-order scoring.
    start: usize,
    /// Query tokens covered, most significant bit first.
    mask: u64,
    address: Option<String>,
}

/// Matches from distinct indexes that can describe one place. `elements[0]` is
/// the finest and is the one returned.
#[derive(Debug, Clone)]
struct Stack {
    elements: Vec<PhraseMatch>,
    relevance: f64,
}

impl Stack {
    fn new(elements: Vec<PhraseMatch>, total_tokens: usize) -> Self {
        let relevance = stack_relevance(&elements, total_tokens);
        Self { elements, relevance }
    }

    fn anchor(&self) -> &PhraseMatch {
        &self.elements[0]
    }
}

fn stack_relevance(elements: &[PhraseMatch], total_tokens: usize) -> f64 {
    let mask = elements.iter().fold(0u64, |acc, e| acc | e.mask);
    let mut ordered: Vec<&PhraseMatch> = elements.iter().collect();
    ordered.sort_by_key(|e| e.start);
    let positions: Vec<usize> = ordered.iter().map(|e| e.index).collect();
    let min_relev = elements.iter().map(|e| e.relev).fold(1.0, f64::min);
    relevance(mask.count_ones() as usize, total_tokens, &positions, min_relev)
}

/// Bits for tokens `start..end` of an `n`-token query, token 0 most significant.
fn span_mask(n: usize, start: usize, end: usize) -> u64 {
    (start..end).fold(0, |mask, i| mask | 1 << (n - 1 - i))
}

/// Combines matches into stacks: at most one match per index, no token used
/// twice, every element overlapping the finest one.
fn build_stacks(mut matches: Vec<PhraseMatch>, total_tokens: usize) -> Vec<Stack> {
    matches.sort_by(|a, b| b.index.cmp(&a.index));

    let mut stacks: Vec<Vec<PhraseMatch>> = Vec::new();
    for m in matches {
        let mut grown = Vec::new();
        for stack in &stacks {
            if stacks.len() + grown.len() >= MAX_STACKS {
                break;
            }
            let coarsest = stack.last().map_or(usize::MAX, |e| e.index);
            let disjoint = stack.iter().all(|e| e.mask & m.mask == 0);
            if coarsest > m.index && disjoint && stack[0].feature.overlaps(&m.feature.cover) {
                let mut next = stack.clone();
                next.push(m.clone());
                grown.push(next);
            }
        }
        if stacks.len() + grown.len() < MAX_STACKS {
            stacks.push(vec![m]);
        }
        stacks.extend(grown);
    }
    stacks
        .into_iter()
        .map(|elements| Stack::new(elements, total_tokens))
        .collect()
}

/// A verified candidate with its tie-break keys.
struct Ranked {
    feature: ResultFeature,
    score: f64,
    similarity: f64,
}

/// Geocoder over a stack of indexes.
pub struct Geocoder<S: Store = MemoryStore> {
    indexes: Vec<GeocoderIndex<S>>,
    cache: TileCache<Option<Arc<StoredFeature>>>,
}

impl<S: Store> std::fmt::Debug for Geocoder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geocoder")
            .field("indexes", &self.indexes.iter().map(|i| i.name()).collect::<Vec<_>>())
            .field("cache", &self.cache)
            .finish()
    }
}

impl Geocoder<MemoryStore> {
    /// Empty in-memory indexes for every configured source.
    pub fn from_config(config: &GeocoderConfig) -> Result<Self> {
        config.validate()?;
        let indexes = config
            .indexes
            .iter()
            .map(|c| GeocoderIndex::new(c.clone(), MemoryStore::new()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(indexes)
    }
}

impl<S: Store> Geocoder<S> {
    /// `indexes` must be ordered coarse to fine.
    pub fn new(indexes: Vec<GeocoderIndex<S>>) -> Result<Self> {
        GeocoderConfig::new(indexes.iter().map(|i| i.config().clone()).collect()).validate()?;
        Ok(Self {
            indexes,
            cache: TileCache::default(),
        })
    }

    pub fn indexes(&self) -> &[GeocoderIndex<S>] {
        &self.indexes
    }

    pub fn index(&self, name: &str) -> Option<&GeocoderIndex<S>> {
        self.indexes.iter().find(|i| i.name() == name)
    }

    pub fn cache(&self) -> &TileCache<Option<Arc<StoredFeature>>> {
        &self.cache
    }

    /// Forgets every cached tile lookup.
    pub async fn reset_cache(&self) {
        self.cache.reset().await;
    }

    fn rank(&self, type_tag: &str) -> Option<usize> {
        self.indexes.iter().position(|i| i.name() == type_tag)
    }

    /// Ranks of the types a feature may present as, ascending. Always includes
    /// its own index. A document listing `carmen:types` narrows what its index owns.
    fn owned_ranks(&self, index: usize, feature: &StoredFeature) -> BTreeSet<usize> {
        let declared = &feature.doc.properties.types;
        let mut ranks: BTreeSet<usize> = self.indexes[index]
            .config()
            .owned_types()
            .into_iter()
            .filter(|t| declared.is_empty() || declared.iter().any(|d| d == t))
            .filter_map(|t| self.rank(t))
            .collect();
        ranks.insert(index);
        ranks
    }

    fn type_filter(&self, types: &[String]) -> Result<Option<BTreeSet<usize>>> {
        if types.is_empty() {
            return Ok(None);
        }
        types
            .iter()
            .map(|t| self.rank(t).ok_or_else(|| GeocoderError::UnknownType(t.clone())))
            .collect::<Result<BTreeSet<_>>>()
            .map(Some)
    }

    /// Most specific type a feature may present as under `filter`.
    fn presented_rank(&self, index: usize, feature: &StoredFeature, filter: Option<&BTreeSet<usize>>) -> Option<usize> {
        self.owned_ranks(index, feature)
            .into_iter()
            .rev()
            .find(|r| filter.is_none_or(|f| f.contains(r)))
    }

    /// Geocodes free text, or a `lon,lat` pair in reverse.
    pub async fn geocode(&self, query: &str, options: &GeocodeOptions) -> Result<GeocodeResponse> {
        let start = Instant::now();
        let filter = self.type_filter(&options.types)?;
        let response = match parse_coordinates(query)? {
            Some(point) => self.reverse(point, filter.as_ref(), options).await,
            None => self.forward(query, filter.as_ref(), options).await?,
        };
        tracing::debug!(
            query,
            features = response.features.len(),
            elapsed = ?start.elapsed(),
            "geocoded"
        );
        Ok(response)
    }

    /// The feature covering `point` in each index from `finest` down to the
    /// coarsest, most specific first. Indexes without a covering feature are
    /// left out.
    pub async fn chain_at(&self, point: LngLat, finest: usize) -> Vec<ChainLink> {
        let finest = finest.min(self.indexes.len().saturating_sub(1));
        if self.indexes.is_empty() {
            return Vec::new();
        }
        let lookups = (0..=finest).rev().map(|i| async move {
            let feature = self.lookup(i, point).await?;
            Some(ChainLink { index: i, feature })
        });
        join_all(lookups).await.into_iter().flatten().collect()
    }

    async fn lookup(&self, i: usize, point: LngLat) -> Option<Arc<StoredFeature>> {
        let index = &self.indexes[i];
        let key = TileKey {
            index: i,
            generation: index.generation().await,
            tile: Tile::containing(index.zoom(), point),
        };
        if let Some(cached) = self.cache.get(&key).await {
            return cached;
        }
        let found = index.features_at(point).await.into_iter().next();
        self.cache.insert(key, found.clone()).await;
        found
    }

    async fn reverse(
        &self,
        point: LngLat,
        filter: Option<&BTreeSet<usize>>,
        options: &GeocodeOptions,
    ) -> GeocodeResponse {
        let chain = self.chain_at(point, self.indexes.len().saturating_sub(1)).await;
        let mut features = Vec::new();

        match filter {
            None => {
                // Each level presents as its finest type not already taken by a finer level.
                let mut claimed = BTreeSet::new();
                for link in &chain {
                    let rank = self
                        .owned_ranks(link.index, &link.feature)
                        .into_iter()
                        .rev()
                        .find(|r| !claimed.contains(r))
                        .unwrap_or(link.index);
                    claimed.insert(rank);
                    let context = context_below(&chain, link.index.min(rank));
                    features.push(self.build_result(link, rank, &context, 1.0, None, options));
                }
            }
            Some(filter) => {
                // Coarser levels overwrite finer ones for the same type.
                let mut slots: BTreeMap<usize, &ChainLink> = BTreeMap::new();
                for link in &chain {
                    for rank in self.owned_ranks(link.index, &link.feature) {
                        if filter.contains(&rank) {
                            slots.insert(rank, link);
                        }
                    }
                }
                let mut seen = BTreeSet::new();
                for (&rank, link) in slots.iter().rev() {
                    if !seen.insert((link.index, link.feature.id)) {
                        continue;
                    }
                    let context = context_below(&chain, link.index.min(rank));
                    features.push(self.build_result(link, rank, &context, 1.0, None, options));
                }
            }
        }
        features.truncate(options.limit);

        GeocodeResponse {
            query: point.iter().map(ToString::to_string).collect(),
            features,
        }
    }

    async fn forward(
        &self,
        query: &str,
        filter: Option<&BTreeSet<usize>>,
        options: &GeocodeOptions,
    ) -> Result<GeocodeResponse> {
        let mut tokens = tokenize(query);
        if tokens.len() > MAX_QUERY_TOKENS {
            tracing::debug!(tokens = tokens.len(), "truncating long query");
            tokens.truncate(MAX_QUERY_TOKENS);
        }
        if tokens.is_empty() {
            return Ok(GeocodeResponse::default());
        }

        let per_index = join_all((0..self.indexes.len()).map(|i| self.phrase_matches(i, &tokens))).await;
        let matches: Vec<PhraseMatch> = per_index.into_iter().flatten().collect();
        let mut stacks = build_stacks(matches, tokens.len());
        if let Some(filter) = filter {
            stacks.retain(|s| self.presented_rank(s.anchor().index, &s.anchor().feature, Some(filter)).is_some());
        }
        stacks.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| {
                    let (a, b) = (&a.anchor().feature, &b.anchor().feature);
                    b.document_score().total_cmp(&a.document_score())
                })
                .then_with(|| b.anchor().index.cmp(&a.anchor().index))
                .then_with(|| a.anchor().feature.id.cmp(&b.anchor().feature.id))
        });
        let candidates = stacks.len();
        stacks.truncate(options.limit_verify.max(1));

        let total = tokens.len();
        let deadline = Instant::now() + options.verify_timeout;
        let verify = join_all(
            stacks
                .into_iter()
                .map(|stack| self.verify(stack, total, filter, options, deadline)),
        );
        let mut ranked = tokio::time::timeout(options.verify_timeout, verify)
            .await
            .map_err(|_| GeocoderError::VerifyTimeout(options.verify_timeout))?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let query_text = tokens.join(" ");
        for r in &mut ranked {
            let name = r.feature.place_name.to_lowercase();
            r.similarity = jaro_winkler::similarity(name.chars(), query_text.chars());
        }
        ranked.sort_by(|a, b| {
            b.feature
                .relevance
                .total_cmp(&a.feature.relevance)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| b.similarity.total_cmp(&a.similarity))
        });

        let mut seen = BTreeSet::new();
        let mut features: Vec<ResultFeature> = ranked
            .into_iter()
            .filter(|r| seen.insert(r.feature.id.clone()))
            .map(|r| r.feature)
            .collect();
        features.truncate(options.limit);

        tracing::debug!(candidates, verified = features.len(), "forward query");
        Ok(GeocodeResponse {
            query: tokens,
            features,
        })
    }

    /// Every contiguous run of query tokens that is a phrase of index `i`.
    async fn phrase_matches(&self, i: usize, tokens: &[String]) -> Vec<PhraseMatch> {
        let index = &self.indexes[i];
        let replaced = index.replacer().replace_all(tokens);
        let n = tokens.len();

        let mut out = Vec::new();
        for start in 0..n {
            for end in start + 1..=n {
                let mask = span_mask(n, start, end);
                for hit in index.phrase_hits(encode_tokens(&replaced[start..end])).await {
                    let mut m = PhraseMatch {
                        index: i,
                        feature: hit.feature,
                        relev: hit.relev,
                        start,
                        mask,
                        address: None,
                    };
                    if index.is_address()
                        && let Some(found) = mask_address(tokens, mask)
                        && !(start..end).contains(&found.pos)
                        && m.feature.doc.properties.address_numbers.contains(&found.addr)
                    {
                        m.mask |= span_mask(n, found.pos, found.pos + 1);
                        m.start = m.start.min(found.pos);
                        m.address = Some(found.addr);
                    }
                    out.push(m);
                }
            }
        }
        out
    }

    /// Checks a stack against the spatial hierarchy at its finest feature and
    /// builds the result. Elements that do not contain that feature's center are
    /// dropped and relevance is recomputed without them.
    async fn verify(
        &self,
        stack: Stack,
        total_tokens: usize,
        filter: Option<&BTreeSet<usize>>,
        options: &GeocodeOptions,
        deadline: Instant,
    ) -> Result<Ranked> {
        // Lookups that never yield would outrun the timer.
        if Instant::now() >= deadline {
            return Err(GeocoderError::VerifyTimeout(options.verify_timeout));
        }
        let anchor = stack.anchor().clone();
        let center = anchor.feature.center;
        let chain = self.chain_at(center, anchor.index).await;

        let before = stack.elements.len();
        let elements: Vec<PhraseMatch> = stack
            .elements
            .into_iter()
            .enumerate()
            .filter(|(i, e)| *i == 0 || e.feature.overlaps(&[Tile::containing(self.indexes[e.index].zoom(), center)]))
            .map(|(_, e)| e)
            .collect();
        if elements.len() < before {
            tracing::trace!(
                feature = anchor.feature.id,
                dropped = before - elements.len(),
                "unverified stack elements"
            );
        }
        let relevance = stack_relevance(&elements, total_tokens);

        let rank = self
            .presented_rank(anchor.index, &anchor.feature, filter)
            .unwrap_or(anchor.index);
        let context: Vec<ChainLink> = (0..anchor.index.min(rank))
            .rev()
            .filter_map(|i| match elements.iter().find(|e| e.index == i) {
                Some(e) => Some(ChainLink {
                    index: i,
                    feature: Arc::clone(&e.feature),
                }),
                None => chain.iter().find(|l| l.index == i).cloned(),
            })
            .collect();

        let link = ChainLink {
            index: anchor.index,
            feature: Arc::clone(&anchor.feature),
        };
        Ok(Ranked {
            feature: self.build_result(&link, rank, &context, relevance, anchor.address, options),
            score: anchor.feature.document_score(),
            similarity: 0.0,
        })
    }

    fn text_of(&self, feature: &StoredFeature, options: &GeocodeOptions) -> Text {
        get_text(options.language.as_deref(), &feature.doc.properties, options.language_mode).unwrap_or_else(|| Text {
            text: feature.text().to_string(),
            language: None,
        })
    }

    fn build_result(
        &self,
        link: &ChainLink,
        rank: usize,
        context: &[ChainLink],
        relevance: f64,
        address: Option<String>,
        options: &GeocodeOptions,
    ) -> ResultFeature {
        let Text { text, language } = self.text_of(&link.feature, options);
        let context: Vec<ContextEntry> = context
            .iter()
            .map(|c| {
                let Text { text, language } = self.text_of(&c.feature, options);
                ContextEntry {
                    id: format!("{}.{}", self.indexes[c.index].name(), c.feature.id),
                    text,
                    language,
                }
            })
            .collect();

        let head = match &address {
            Some(number) => format!("{number} {text}"),
            None => text.clone(),
        };
        let place_name = std::iter::once(head)
            .chain(context.iter().map(|c| c.text.clone()))
            .collect::<Vec<_>>()
            .join(", ");

        ResultFeature {
            id: format!("{}.{}", self.indexes[rank].name(), link.feature.id),
            text,
            language,
            place_name,
            relevance,
            center: link.feature.center,
            address,
            context,
        }
    }
}

/// Links of a chain from indexes coarser than `below`, in chain order.
fn context_below(chain: &[ChainLink], below: usize) -> Vec<ChainLink> {
    chain.iter().filter(|l| l.index < below).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{check, let_assert};
    use rstest::rstest;

    #[rstest]
    #[case("0,0", [0.0, 0.0])]
    #[case(" -75.598211 , 38.367333 ", [-75.598211, 38.367333])]
    #[case("180,-90", [180.0, -90.0])]
    fn test_parse_coordinates(#[case] query: &str, #[case] expected: LngLat) {
        let_assert!(Ok(Some(point)) = parse_coordinates(query));
        check!(point == expected);
    }

    #[rstest]
    #[case("1234 main st")]
    #[case("cafe")]
    #[case("1,2 fake st")]
    fn test_parse_coordinates_text(#[case] query: &str) {
        check!(matches!(parse_coordinates(query), Ok(None)));
    }

    #[rstest]
    #[case("181,0")]
    #[case("0,91")]
    fn test_parse_coordinates_out_of_range(#[case] query: &str) {
        let_assert!(Err(GeocoderError::InvalidCoordinates(_)) = parse_coordinates(query));
    }

    #[test]
    fn test_span_mask() {
        check!(span_mask(4, 0, 1) == 0b1000);
        check!(span_mask(4, 1, 4) == 0b0111);
        check!(span_mask(1, 0, 1) == 0b1);
    }
}
