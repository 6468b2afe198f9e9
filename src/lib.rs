pub mod cache;
pub mod config;
pub mod error;
pub mod lang;
pub mod search;
pub mod store;
pub mod tracing;
pub mod types;

pub use config::{GeocodeOptions, GeocoderConfig, IndexConfig, IndexOptions};
pub use error::{ErrorKind, GeocoderError, Result};
pub use lang::{LanguageMode, Text, closest_lang_label, get_text};
pub use search::{Geocoder, GeocoderIndex, index_stream};
pub use store::{GeocoderDataIterator, MemoryStore, Store, StoreError};
pub use types::{ContextEntry, Document, GeocodeResponse, Geometry, Properties, ResultFeature};
