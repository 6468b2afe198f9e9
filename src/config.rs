//! Index layout and per-call options.

use crate::error::{GeocoderError, Result};
use crate::lang::LanguageMode;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

fn default_maxzoom() -> i32 {
    6
}

/// One layered source, e.g. `country` or `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Native type tag of the documents in this index.
    pub name: String,
    #[serde(default = "default_maxzoom")]
    pub maxzoom: i32,
    /// Type tags documents may present as. Defaults to `[name]`.
    #[serde(default)]
    pub types: Vec<String>,
    /// Whether this is an address-level index.
    #[serde(default)]
    pub address: bool,
    /// Token replacements such as `street = "st"`.
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

impl IndexConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            maxzoom: default_maxzoom(),
            types: Vec::new(),
            address: false,
            tokens: BTreeMap::new(),
        }
    }

    pub fn with_maxzoom(mut self, maxzoom: i32) -> Self {
        self.maxzoom = maxzoom;
        self
    }

    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_address(mut self, address: bool) -> Self {
        self.address = address;
        self
    }

    pub fn with_tokens(mut self, tokens: BTreeMap<String, String>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Owned type tags, always including the native one.
    pub fn owned_types(&self) -> Vec<&str> {
        let mut owned = vec![self.name.as_str()];
        for t in &self.types {
            if !owned.contains(&t.as_str()) {
                owned.push(t);
            }
        }
        owned
    }
}

/// The full index stack, ordered coarse to fine (country first, poi last).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeocoderConfig {
    #[serde(default, rename = "index")]
    pub indexes: Vec<IndexConfig>,
}

impl GeocoderConfig {
    pub fn new(indexes: Vec<IndexConfig>) -> Self {
        Self { indexes }
    }

    /// Parses and validates a TOML configuration:
    ///
    /// ```toml
    /// [[index]]
    /// name = "region"
    /// types = ["region", "place"]
    ///
    /// [[index]]
    /// name = "address"
    /// address = true
    /// tokens = { street = "st" }
    /// ```
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse geocoder config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML configuration file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read geocoder config at {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid geocoder config at {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for index in &self.indexes {
            crate::search::index::validate_zoom(index.maxzoom)?;
            if index.name.is_empty() {
                return Err(GeocoderError::InvalidConfig("index name is empty".into()));
            }
            if !names.insert(index.name.as_str()) {
                return Err(GeocoderError::InvalidConfig(format!(
                    "duplicate index '{}'",
                    index.name
                )));
            }
            if let Some(key) = index
                .tokens
                .keys()
                .find(|key| crate::search::tokenize::tokenize(key).len() > 1)
            {
                return Err(GeocoderError::InvalidConfig(format!(
                    "token replacement '{key}' in '{}' spans more than one word",
                    index.name
                )));
            }
        }
        for index in &self.indexes {
            if let Some(alias) = index.types.iter().find(|t| !names.contains(t.as_str())) {
                return Err(GeocoderError::UnknownType(alias.clone()));
            }
        }
        Ok(())
    }
}

/// Options for a streaming indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    pub zoom: i32,
    /// Documents applied per `update` call.
    pub batch_size: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            zoom: default_maxzoom(),
            batch_size: 10_000,
        }
    }
}

/// Options for one `geocode` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocodeOptions {
    /// Restrict results to these type tags. Empty means unrestricted.
    pub types: Vec<String>,
    /// Number of candidate stacks verified against the spatial hierarchy.
    pub limit_verify: usize,
    /// Maximum number of features returned.
    pub limit: usize,
    pub language: Option<String>,
    pub language_mode: LanguageMode,
    pub verify_timeout: Duration,
}

impl Default for GeocodeOptions {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            limit_verify: 5,
            limit: 5,
            language: None,
            language_mode: LanguageMode::Default,
            verify_timeout: Duration::from_secs(10),
        }
    }
}

impl GeocodeOptions {
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limit_verify(mut self, limit_verify: usize) -> Self {
        self.limit_verify = limit_verify;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>, mode: LanguageMode) -> Self {
        self.language = Some(language.into());
        self.language_mode = mode;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }
}
