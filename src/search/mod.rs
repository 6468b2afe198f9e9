//! Text indexing and geocoding over tile grids.
//!
//! Tokenization and phrase encoding, the packed grid key, index building and
//! persistence, relevance scoring, and query resolution.

pub mod grid;
pub mod index;
pub mod indexer;
pub mod query;
pub mod scoring;
pub mod tokenize;

pub use grid::{GridCodec, GridEntry, Tile};
pub use index::{FrequencyTable, GeocoderIndex, IndexStats, PhraseHit, StoredFeature};
pub use indexer::{IndexSummary, index_stream};
pub use query::{ChainLink, Geocoder, parse_coordinates};
pub use tokenize::{PhraseId, TokenReplacer, create_replacer, encode_phrase, encode_tokens, tokenize};
