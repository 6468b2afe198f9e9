//! Language label resolution.
//!
//! Picks the best localized label for a requested language tag out of a map of
//! labels keyed by tag. Tags compare case-insensitively and treat `-` and `_`
//! alike, so `zh-Hant`, `zh_HANT` and `zh_hant` all name the same label.

use crate::types::{Properties, TEXT_KEY, TEXT_PREFIX, split_synonyms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

/// Tag of the language-neutral label, used as the last resort.
pub const UNIVERSAL: &str = "universal";

/// How far a request may stray from the exact tag it asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageMode {
    /// Exact tag, then base language, then the fallback table, then universal.
    #[default]
    Default,
    /// No cross-script fallback for languages with per-language rules.
    Strict,
}

impl std::str::FromStr for LanguageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown language mode '{other}'")),
        }
    }
}

/// Tags tried after the base language in default mode.
const DEFAULT_FALLBACKS: &[(&str, &[&str])] = &[("ar", &["en"])];

/// A strict-mode rule: which tags stand in for a language and where.
struct StrictRule {
    base: &'static str,
    /// Tried for every region.
    fallbacks: &'static [&'static str],
    /// Tried only when the requested region is one of `regions`.
    regional: &'static [&'static str],
    regions: &'static [&'static str],
}

const STRICT_RULES: &[StrictRule] = &[StrictRule {
    base: "sr",
    fallbacks: &["sr_latn"],
    regional: &["hr", "bs"],
    regions: &["ba", "cs", "me", "rs"],
}];

/// A value in a label map. Null-ish values resolve to `None` and are skipped.
pub trait LabelValue {
    fn label(&self) -> Option<&str>;
}

impl LabelValue for String {
    fn label(&self) -> Option<&str> {
        Some(self.as_str())
    }
}

impl LabelValue for &str {
    fn label(&self) -> Option<&str> {
        Some(*self)
    }
}

impl LabelValue for Value {
    fn label(&self) -> Option<&str> {
        self.as_str()
    }
}

impl<T: LabelValue> LabelValue for Option<T> {
    fn label(&self) -> Option<&str> {
        self.as_ref().and_then(LabelValue::label)
    }
}

/// Anything that can list `(key, label)` pairs.
pub trait LabelMap {
    fn labels(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_>;
}

impl<K: AsRef<str>, V: LabelValue> LabelMap for BTreeMap<K, V> {
    fn labels(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_> {
        Box::new(self.iter().filter_map(|(k, v)| Some((k.as_ref(), v.label()?))))
    }
}

impl<K: AsRef<str>, V: LabelValue, S: BuildHasher> LabelMap for HashMap<K, V, S> {
    fn labels(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_> {
        Box::new(self.iter().filter_map(|(k, v)| Some((k.as_ref(), v.label()?))))
    }
}

impl LabelMap for serde_json::Map<String, Value> {
    fn labels(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_> {
        Box::new(self.iter().filter_map(|(k, v)| Some((k.as_str(), v.as_str()?))))
    }
}

impl LabelMap for Properties {
    fn labels(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_> {
        Box::new(
            std::iter::once((TEXT_KEY, self.text.as_str()))
                .chain(self.extra.iter().filter_map(|(k, v)| Some((k.as_str(), v.as_str()?)))),
        )
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase().replace('-', "_")
}

/// Ordered list of normalized tags to try for a request.
fn candidates(requested: &str, mode: LanguageMode) -> Vec<String> {
    let tag = normalize_tag(requested);
    let mut subtags = tag.split('_');
    let base = subtags.next().unwrap_or_default().to_string();
    let region = subtags.find(|s| s.len() == 2);

    let mut out = vec![tag.clone()];
    let mut push = |candidate: &str| {
        if !out.iter().any(|c| c == candidate) {
            out.push(candidate.to_string());
        }
    };

    match mode {
        LanguageMode::Default => {
            push(&base);
            if let Some((_, fallbacks)) = DEFAULT_FALLBACKS.iter().find(|(lang, _)| *lang == base) {
                fallbacks.iter().for_each(|f| push(*f));
            }
        }
        LanguageMode::Strict => match STRICT_RULES.iter().find(|rule| rule.base == base) {
            Some(rule) => {
                rule.fallbacks.iter().for_each(|f| push(*f));
                if region.is_some_and(|r| rule.regions.iter().any(|known| *known == r)) {
                    rule.regional.iter().for_each(|f| push(*f));
                }
            }
            None => push(&base),
        },
    }
    push(UNIVERSAL);
    out
}

/// Finds the label key and value best matching `requested`.
fn resolve<'a, M: LabelMap + ?Sized>(
    requested: &str,
    labels: &'a M,
    prefix: Option<&str>,
    mode: LanguageMode,
) -> Option<(String, &'a str)> {
    let keyed: Vec<(String, &'a str)> = labels
        .labels()
        .filter_map(|(key, value)| {
            let key = match prefix {
                Some(prefix) => key.strip_prefix(prefix)?,
                None => key,
            };
            Some((normalize_tag(key), value))
        })
        .collect();

    candidates(requested, mode).into_iter().find_map(|candidate| {
        keyed
            .iter()
            .find(|(key, _)| *key == candidate)
            .map(|(_, value)| (candidate, *value))
    })
}

/// Returns the label closest to `requested`, or `None` when nothing fits.
///
/// With a `prefix`, only keys beginning with it are considered and the prefix
/// is stripped before matching, so `carmen:text_` turns `carmen:text_en` into
/// the `en` label.
pub fn closest_lang_label<'a, M: LabelMap + ?Sized>(
    requested: &str,
    labels: &'a M,
    prefix: Option<&str>,
    mode: LanguageMode,
) -> Option<&'a str> {
    resolve(requested, labels, prefix, mode).map(|(_, value)| value)
}

/// Display text picked for a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Text {
    pub text: String,
    /// The requested tag (with `-` separators) when a localized label matched it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Picks display text from `carmen:text` / `carmen:text_<lang>` properties.
///
/// Without a language this is the default text. A resolved language labels the
/// result with the requested tag; the universal label and the default text are
/// returned without one. Synonym lists yield their first entry.
pub fn get_text<M: LabelMap + ?Sized>(
    language: Option<&str>,
    properties: &M,
    mode: LanguageMode,
) -> Option<Text> {
    let first = |label: &str| split_synonyms(label).next().map(str::to_owned);
    let default = || {
        let label = properties.labels().find(|(key, _)| *key == TEXT_KEY)?.1;
        Some(Text {
            text: first(label)?,
            language: None,
        })
    };

    let Some(language) = language else {
        return default();
    };
    match resolve(language, properties, Some(TEXT_PREFIX), mode) {
        Some((tag, label)) if tag == UNIVERSAL => Some(Text {
            text: first(label)?,
            language: None,
        }),
        Some((_, label)) => Some(Text {
            text: first(label)?,
            language: Some(language.replace('_', "-")),
        }),
        None => default(),
    }
}
