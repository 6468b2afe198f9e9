//! Term normalization, phrase ids and address-number extraction.

use ahash::AHashMap;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};
use xxhash_rust::xxh3::xxh3_64;

/// Deterministic numeric id of a normalized phrase.
pub type PhraseId = u64;

/// A run of digits optionally followed or infixed by a single letter: `100`, `100b`, `1s13`.
static ADDRESS_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[a-z]?\d*$").expect("address number pattern is valid"));

/// Characters removed outright rather than treated as separators, so `st.` and
/// `o'brien` collapse to `st` and `obrien`.
fn is_elided(c: char) -> bool {
    matches!(c, '\'' | '\u{2019}' | '.')
}

/// Normalizes text into an ordered sequence of tokens.
///
/// Text is NFD-decomposed with combining marks dropped (so `Café` and `cafe`
/// agree), lowercased, and split on whitespace and every other non-alphanumeric
/// character. Hyphenated names therefore become separate tokens:
/// `Winston-Salem` → `["winston", "salem"]`.
pub fn tokenize(text: &str) -> Vec<String> {
    let folded: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c) && !is_elided(*c))
        .flat_map(char::to_lowercase)
        .collect();

    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Computes the phrase id of already-normalized tokens.
///
/// The id is a content hash of the space-joined tokens: it never depends on
/// insertion order, counters, or the process it was computed in.
pub fn encode_tokens<T: AsRef<str>>(tokens: &[T]) -> PhraseId {
    let mut joined = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            joined.push(' ');
        }
        joined.push_str(token.as_ref());
    }
    xxh3_64(joined.as_bytes())
}

/// Normalizes `text` and returns its phrase id.
pub fn encode_phrase(text: &str) -> PhraseId {
    encode_tokens(&tokenize(text))
}

/// Whether a single token looks like a street-address number.
pub fn is_address_number(token: &str) -> bool {
    ADDRESS_NUMBER.is_match(token)
}

/// A house number recovered from a token sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMatch {
    pub addr: String,
    pub pos: usize,
}

/// Identifies which token of a query is a street-address number.
///
/// `mask` marks tokens already claimed by a phrase match: bit `len - 1 - i`
/// (most-significant bit first) is set when token `i` is claimed. The left-most
/// unclaimed number wins; when every token is claimed the left-most number
/// overall is returned instead.
pub fn mask_address<T: AsRef<str>>(tokens: &[T], mask: u64) -> Option<AddressMatch> {
    let len = tokens.len();
    let claimed = |i: usize| {
        let shift = len - 1 - i;
        shift < 64 && (mask >> shift) & 1 == 1
    };
    let all_claimed = (0..len).all(claimed);

    tokens
        .iter()
        .enumerate()
        .filter(|(i, _)| all_claimed || !claimed(*i))
        .find(|(_, token)| is_address_number(token.as_ref()))
        .map(|(pos, token)| AddressMatch {
            addr: token.as_ref().to_owned(),
            pos,
        })
}

/// Token substitution table applied before counting and phrase encoding.
///
/// Built from a map such as `{"street": "st"}`; both sides are normalized with
/// [`tokenize`] so configuration may use any casing.
#[derive(Debug, Clone, Default)]
pub struct TokenReplacer {
    replacements: AHashMap<String, String>,
}

impl TokenReplacer {
    /// Replacement for a single token, or the token itself.
    pub fn replace<'a>(&'a self, token: &'a str) -> &'a str {
        self.replacements.get(token).map_or(token, String::as_str)
    }

    /// Applies the table to every token.
    pub fn replace_all<T: AsRef<str>>(&self, tokens: &[T]) -> Vec<String> {
        tokens
            .iter()
            .map(|token| self.replace(token.as_ref()).to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.replacements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }
}

/// Builds a [`TokenReplacer`] from a `from → to` map.
pub fn create_replacer(map: &BTreeMap<String, String>) -> TokenReplacer {
    let replacements = map
        .iter()
        .filter_map(|(from, to)| {
            let mut from = tokenize(from);
            if from.len() > 1 {
                tracing::warn!(key = %from.join(" "), "Skipping multi-word token replacement");
                return None;
            }
            let from = from.pop()?;
            Some((from, tokenize(to).join(" ")))
        })
        .collect();
    TokenReplacer { replacements }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{check, let_assert};
    use rstest::rstest;

    #[rstest]
    #[case("Main Street", &["main", "street"])]
    #[case("Winston-Salem", &["winston", "salem"])]
    #[case("Log Cabin Ln", &["log", "cabin", "ln"])]
    #[case("Café de l'Opéra", &["cafe", "de", "lopera"])]
    #[case("St. Louis, MO", &["st", "louis", "mo"])]
    #[case("  ", &[])]
    fn test_tokenize(#[case] input: &str, #[case] expected: &[&str]) {
        check!(tokenize(input) == expected);
    }

    #[test]
    fn test_phrase_id_is_content_addressed() {
        let id = encode_phrase("a");
        check!(encode_phrase("a") == id);
        check!(encode_phrase("A") == id);
        check!(encode_tokens(&["a"]) == id);
        check!(encode_phrase("b") != id);
        check!(encode_phrase("main st") == encode_tokens(&["main", "st"]));
    }

    #[rstest]
    #[case(&["1", "fake", "street", "100"], 0b1110, "100", 3)]
    #[case(&["100", "1", "fake", "street"], 0b1111, "100", 0)]
    #[case(&["1", "fake", "street", "100b"], 0b1110, "100b", 3)]
    #[case(&["100b", "1", "fake", "street"], 0b1111, "100b", 0)]
    #[case(&["1s13", "fake", "street"], 0b111, "1s13", 0)]
    #[case(&["6n486", "fake", "street"], 0b111, "6n486", 0)]
    #[case(&["54w32", "fake", "street"], 0b111, "54w32", 0)]
    #[case(&["8e234", "fake", "street"], 0b111, "8e234", 0)]
    fn test_mask_address(
        #[case] tokens: &[&str],
        #[case] mask: u64,
        #[case] addr: &str,
        #[case] pos: usize,
    ) {
        let_assert!(Some(found) = mask_address(tokens, mask));
        check!(found == AddressMatch { addr: addr.to_string(), pos });
    }

    #[test]
    fn test_mask_address_prefers_unclaimed() {
        // "1" is unclaimed and left of "100", so it wins.
        let_assert!(Some(found) = mask_address(&["1", "fake", "street", "100"], 0b0110));
        check!(found.pos == 0);
        check!(mask_address(&["fake", "street"], 0b00).is_none());
        check!(mask_address::<&str>(&[], 0).is_none());
    }

    #[rstest]
    #[case("100", true)]
    #[case("100b", true)]
    #[case("1s13", true)]
    #[case("b100", false)]
    #[case("10ab", false)]
    #[case("street", false)]
    fn test_is_address_number(#[case] token: &str, #[case] expected: bool) {
        check!(is_address_number(token) == expected);
    }

    #[test]
    fn test_replacer() {
        let map = BTreeMap::from([
            ("Street".to_string(), "st".to_string()),
            ("road".to_string(), "rd".to_string()),
        ]);
        let replacer = create_replacer(&map);
        check!(replacer.replace_all(&tokenize("Main Street")) == ["main", "st"]);
        check!(replacer.replace("road") == "rd");
        check!(replacer.replace("main") == "main");
        check!(!replacer.is_empty());
    }

    #[test]
    fn test_replacer_skips_multi_word_keys() {
        let map = BTreeMap::from([
            ("Saint Louis".to_string(), "stl".to_string()),
            ("saint".to_string(), "st".to_string()),
        ]);
        let replacer = create_replacer(&map);
        check!(replacer.len() == 1);
        check!(replacer.replace_all(&tokenize("Saint Louis")) == ["st", "louis"]);
    }
}
