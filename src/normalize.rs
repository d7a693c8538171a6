//! Name and text normalization shared by topic resolution, speaker lookup and
//! event deduplication.

use lazy_static::lazy_static;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::{BTreeSet, HashSet};
use strsim::{jaro_winkler, levenshtein};
use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::TARGET_TOPIC;

/// Score given to structural matches (token containment, acronyms, small typos).
const STRUCTURAL_MATCH: f64 = 0.95;
/// Score given to names that only differ by inflection.
const STEMMED_MATCH: f64 = 0.98;
/// Levenshtein is only trusted on names at least this long.
const MIN_LEVENSHTEIN_LEN: usize = 6;

lazy_static! {
    static ref STEMMER: Stemmer = Stemmer::create(Algorithm::English);
    static ref STOPWORDS: HashSet<&'static str> = [
        "a", "an", "and", "are", "as", "at", "be", "been", "by", "for", "from", "had", "has",
        "have", "he", "her", "his", "in", "into", "is", "it", "its", "of", "on", "or", "over",
        "she", "that", "the", "their", "they", "this", "to", "was", "were", "which", "who",
        "will", "with",
    ]
    .into_iter()
    .collect();
}

/// Unicode folding, possessive and apostrophe removal, lowercasing, and
/// punctuation collapsed to single spaces.
pub fn basic_normalize(name: &str) -> String {
    let without_apostrophes = name
        .replace('\u{2019}', "'")
        .replace("'s ", " ")
        .replace("'s", "")
        .replace("s' ", "s ")
        .replace("' ", " ")
        .replace('\'', "");

    without_apostrophes
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .replace(|c: char| !c.is_alphanumeric() && c != ' ', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote text as used in the statement uniqueness key.
pub fn normalize_quote(quote: &str) -> String {
    basic_normalize(quote)
}

/// Stemmed content words of `text`, stopwords removed.
pub fn content_tokens(text: &str) -> BTreeSet<String> {
    basic_normalize(text)
        .split_whitespace()
        .filter(|token| !STOPWORDS.contains(token))
        .map(|token| STEMMER.stem(token).into_owned())
        .collect()
}

/// Dice coefficient of two token sets. Two empty sets score 0.
pub fn dice(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    2.0 * shared as f64 / (a.len() + b.len()) as f64
}

fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn stem_all(normalized: &str) -> String {
    normalized
        .split_whitespace()
        .map(|token| STEMMER.stem(token).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compares topic and speaker names.
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    max_edit_distance: usize,
}

impl Default for NameNormalizer {
    fn default() -> Self {
        Self {
            max_edit_distance: 2,
        }
    }
}

impl NameNormalizer {
    pub fn new(max_edit_distance: usize) -> Self {
        Self { max_edit_distance }
    }

    /// Canonical comparison form of a name. A leading article is dropped.
    pub fn normalize(&self, name: &str) -> String {
        let normalized = basic_normalize(name);
        match normalized.strip_prefix("the ") {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            _ => normalized,
        }
    }

    /// Similarity of two names in [0, 1].
    ///
    /// Names whose numbers differ ("2023 budget", "2024 budget") never match.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let norm_a = self.normalize(a);
        let norm_b = self.normalize(b);
        if norm_a.is_empty() || norm_b.is_empty() {
            return 0.0;
        }
        if norm_a == norm_b {
            return 1.0;
        }
        if digits(&norm_a) != digits(&norm_b) {
            return 0.0;
        }
        if stem_all(&norm_a) == stem_all(&norm_b) {
            debug!(target: TARGET_TOPIC, "Stemmed match: '{}' and '{}'", a, b);
            return STEMMED_MATCH;
        }

        if is_acronym_of(a, &norm_b) || is_acronym_of(b, &norm_a) {
            debug!(target: TARGET_TOPIC, "Acronym match: '{}' and '{}'", a, b);
            return STRUCTURAL_MATCH;
        }

        if token_subset(&norm_a, &norm_b) {
            debug!(target: TARGET_TOPIC, "Token subset match: '{}' and '{}'", a, b);
            return STRUCTURAL_MATCH;
        }

        let (len_a, len_b) = (norm_a.chars().count(), norm_b.chars().count());
        if len_a.min(len_b) >= MIN_LEVENSHTEIN_LEN
            && len_a.abs_diff(len_b) <= self.max_edit_distance
            && levenshtein(&norm_a, &norm_b) <= self.max_edit_distance
        {
            debug!(target: TARGET_TOPIC, "Levenshtein match: '{}' and '{}'", a, b);
            return STRUCTURAL_MATCH;
        }

        jaro_winkler(&norm_a, &norm_b)
    }
}

/// `candidate` is written as an acronym (e.g. "NATO") whose letters are the
/// initials of the content words of `expanded`.
fn is_acronym_of(candidate: &str, expanded: &str) -> bool {
    let candidate = candidate.trim();
    let len = candidate.chars().count();
    if !(2..=6).contains(&len) || !candidate.chars().all(|c| c.is_ascii_uppercase()) {
        return false;
    }
    let initials: String = expanded
        .split_whitespace()
        .filter(|word| !STOPWORDS.contains(word))
        .filter_map(|word| word.chars().next())
        .collect();
    initials.len() >= 2 && initials == candidate.to_lowercase()
}

/// The shorter name has at least two tokens, all found in the longer name,
/// and covers at least half of it.
fn token_subset(a: &str, b: &str) -> bool {
    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    let (shorter, longer) = if tokens_a.len() <= tokens_b.len() {
        (tokens_a, tokens_b)
    } else {
        (tokens_b, tokens_a)
    };
    shorter.len() >= 2 && shorter.is_subset(&longer) && shorter.len() * 2 >= longer.len()
}
