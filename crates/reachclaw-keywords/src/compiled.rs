//! One immutable compilation of every tenant's keyword sets.

use aho_corasick::AhoCorasick;
use regex::{Regex, RegexBuilder};
use reachclaw_core::types::{KeywordSet, TenantId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Upper bound on a compiled regex program, so one hostile entry cannot
/// blow up memory for the whole index.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A keyword found in a text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordMatch {
    pub tenant_id: TenantId,
    pub set_id: i64,
    #[serde(serialize_with = "serialize_shared_str")]
    pub set_name: Arc<str>,
    pub keyword_id: i64,
    pub pattern: String,
    pub is_regex: bool,
}

fn serialize_shared_str<S: serde::Serializer>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value)
}

/// An entry left out of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub set_name: String,
    pub pattern: String,
    pub reason: String,
}

/// Summary of a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub sets: usize,
    pub literals: usize,
    pub regexes: usize,
    pub skipped: Vec<SkippedEntry>,
}

/// A literal automaton plus, per automaton pattern, the entries that share
/// that normalized needle.
struct LiteralMatcher {
    automaton: AhoCorasick,
    owners: Vec<Vec<usize>>,
}

pub struct CompiledIndex {
    entries: Vec<KeywordMatch>,
    literals: Vec<LiteralMatcher>,
    regexes: Vec<(Regex, usize)>,
    cache: Mutex<HashMap<String, Arc<[usize]>>>,
    cache_capacity: usize,
}

/// Char-wise lowercase. A substring of `s` always maps to a substring of
/// `normalize(s)`, which keeps literal matching monotonic.
pub fn normalize(s: &str) -> String {
    s.chars().flat_map(char::to_lowercase).collect()
}

impl CompiledIndex {
    pub fn empty(cache_capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            literals: Vec::new(),
            regexes: Vec::new(),
            cache: Mutex::new(HashMap::new()),
            cache_capacity,
        }
    }

    /// Compile enabled sets. Invalid entries are skipped and reported.
    pub fn build(sets: &[KeywordSet], cache_capacity: usize) -> (Self, CompileReport) {
        let mut index = Self::empty(cache_capacity);
        let mut report = CompileReport::default();
        // needle -> entry indices, grouped per set so a failed automaton
        // build can fall back to set granularity.
        let mut needles: Vec<(String, Vec<(String, Vec<usize>)>)> = Vec::new();

        for set in sets.iter().filter(|s| s.enabled) {
            report.sets += 1;
            let set_name: Arc<str> = Arc::from(set.name.as_str());
            let mut set_needles: HashMap<String, Vec<usize>> = HashMap::new();
            let mut order: Vec<String> = Vec::new();

            for kw in &set.keywords {
                let skip = |reason: String| SkippedEntry {
                    set_name: set.name.clone(),
                    pattern: kw.pattern.clone(),
                    reason,
                };
                if kw.pattern.trim().is_empty() {
                    report.skipped.push(skip("empty pattern".into()));
                    continue;
                }
                let entry = KeywordMatch {
                    tenant_id: set.tenant_id.clone(),
                    set_id: set.id,
                    set_name: set_name.clone(),
                    keyword_id: kw.id,
                    pattern: kw.pattern.clone(),
                    is_regex: kw.is_regex,
                };

                if kw.is_regex {
                    match RegexBuilder::new(&kw.pattern)
                        .case_insensitive(true)
                        .size_limit(REGEX_SIZE_LIMIT)
                        .build()
                    {
                        Ok(re) => {
                            index.entries.push(entry);
                            index.regexes.push((re, index.entries.len() - 1));
                            report.regexes += 1;
                        }
                        Err(e) => {
                            tracing::warn!(set = %set.name, pattern = %kw.pattern, "⚠️ Invalid keyword regex skipped: {e}");
                            report.skipped.push(skip(e.to_string()));
                        }
                    }
                } else {
                    index.entries.push(entry);
                    let needle = normalize(&kw.pattern);
                    let slot = set_needles.entry(needle.clone()).or_insert_with(|| {
                        order.push(needle);
                        Vec::new()
                    });
                    slot.push(index.entries.len() - 1);
                    report.literals += 1;
                }
            }

            let grouped = order
                .into_iter()
                .map(|n| {
                    let owners = set_needles.remove(&n).unwrap_or_default();
                    (n, owners)
                })
                .collect();
            needles.push((set.name.clone(), grouped));
        }

        index.literals = build_literal_matchers(needles, &mut report);
        (index, report)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry occurring in `text`, each reported once, in compile order.
    pub fn matches(&self, text: &str) -> Vec<KeywordMatch> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let normalized = normalize(text);
        let hits = match self.cached(&normalized) {
            Some(hits) => hits,
            None => {
                let hits: Arc<[usize]> = self.scan(&normalized).into();
                self.remember(normalized, hits.clone());
                hits
            }
        };
        hits.iter().map(|&i| self.entries[i].clone()).collect()
    }

    fn scan(&self, normalized: &str) -> Vec<usize> {
        let mut hits = BTreeSet::new();
        for matcher in &self.literals {
            for m in matcher.automaton.find_overlapping_iter(normalized) {
                hits.extend(matcher.owners[m.pattern().as_usize()].iter().copied());
            }
        }
        for (re, idx) in &self.regexes {
            if re.is_match(normalized) {
                hits.insert(*idx);
            }
        }
        hits.into_iter().collect()
    }

    fn cached(&self, normalized: &str) -> Option<Arc<[usize]>> {
        self.cache.lock().ok()?.get(normalized).cloned()
    }

    fn remember(&self, normalized: String, hits: Arc<[usize]>) {
        if self.cache_capacity == 0 {
            return;
        }
        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= self.cache_capacity {
                cache.clear();
            }
            cache.insert(normalized, hits);
        }
    }

    pub fn cached_texts(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// One automaton over every needle; if that fails, one per set so a single
/// set cannot take the others down.
fn build_literal_matchers(
    needles: Vec<(String, Vec<(String, Vec<usize>)>)>,
    report: &mut CompileReport,
) -> Vec<LiteralMatcher> {
    // Identical needles from different sets share one automaton pattern.
    let mut merged: Vec<(String, Vec<usize>)> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for (needle, owners) in needles.iter().flat_map(|(_, g)| g.iter()) {
        match position.get(needle) {
            Some(&i) => merged[i].1.extend(owners.iter().copied()),
            None => {
                position.insert(needle.clone(), merged.len());
                merged.push((needle.clone(), owners.clone()));
            }
        }
    }
    if merged.is_empty() {
        return Vec::new();
    }
    match AhoCorasick::new(merged.iter().map(|(n, _)| n.as_str())) {
        Ok(automaton) => vec![LiteralMatcher {
            automaton,
            owners: merged.into_iter().map(|(_, o)| o).collect(),
        }],
        Err(e) => {
            tracing::warn!("⚠️ Combined keyword automaton failed ({e}), building per set");
            let mut out = Vec::new();
            for (set_name, group) in needles {
                if group.is_empty() {
                    continue;
                }
                match AhoCorasick::new(group.iter().map(|(n, _)| n.as_str())) {
                    Ok(automaton) => out.push(LiteralMatcher {
                        automaton,
                        owners: group.into_iter().map(|(_, o)| o).collect(),
                    }),
                    Err(e) => {
                        tracing::warn!(set = %set_name, "⚠️ Keyword set skipped: {e}");
                        report.literals = report.literals.saturating_sub(group.len());
                        report.skipped.extend(group.into_iter().map(|(n, _)| SkippedEntry {
                            set_name: set_name.clone(),
                            pattern: n,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachclaw_core::types::Keyword;

    fn set(tenant: &str, id: i64, name: &str, keywords: Vec<Keyword>) -> KeywordSet {
        let mut s = KeywordSet::new(TenantId::new(tenant), name, keywords);
        s.id = id;
        s
    }

    #[test]
    fn test_case_insensitive_literals_and_unicode() {
        let sets = vec![set("t1", 1, "pricing", vec![Keyword::literal("Giá Bao Nhiêu"), Keyword::literal("ship")])];
        let (idx, report) = CompiledIndex::build(&sets, 16);
        assert_eq!(report.literals, 2);
        let hits = idx.matches("Cho mình hỏi GIÁ BAO NHIÊU vậy, có SHIP không?");
        assert_eq!(hits.len(), 2);
        assert!(idx.matches("hello").is_empty());
    }

    #[test]
    fn test_invalid_regex_skipped_not_fatal() {
        let sets = vec![set(
            "t1",
            1,
            "mixed",
            vec![Keyword::regex("(unclosed"), Keyword::regex(r"mua\s+\d+"), Keyword::literal("  ")],
        )];
        let (idx, report) = CompiledIndex::build(&sets, 16);
        assert_eq!(report.regexes, 1);
        assert_eq!(report.skipped.len(), 2);
        let hits = idx.matches("Em muốn MUA 3 cái");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_regex);
    }

    #[test]
    fn test_overlapping_and_shared_needles_reported_once_each() {
        let sets = vec![
            set("t1", 1, "a", vec![Keyword::literal("order"), Keyword::literal("reorder")]),
            set("t2", 2, "b", vec![Keyword::literal("ORDER")]),
        ];
        let (idx, _) = CompiledIndex::build(&sets, 16);
        let hits = idx.matches("please reorder order order");
        assert_eq!(hits.len(), 3);
        assert_eq!(hits.iter().filter(|h| h.tenant_id.as_str() == "t2").count(), 1);
    }

    #[test]
    fn test_match_serializes_set_name_as_string() {
        let sets = vec![set("t1", 7, "pricing", vec![Keyword::literal("price")])];
        let (idx, _) = CompiledIndex::build(&sets, 16);
        let hits = idx.matches("what price?");
        let json = serde_json::to_value(&hits).unwrap();
        assert_eq!(json[0]["set_name"], "pricing");
        assert_eq!(json[0]["set_id"], 7);
        assert_eq!(json[0]["is_regex"], false);
    }

    #[test]
    fn test_disabled_sets_ignored() {
        let mut s = set("t1", 1, "off", vec![Keyword::literal("deal")]);
        s.enabled = false;
        let (idx, report) = CompiledIndex::build(&[s], 16);
        assert_eq!(report.sets, 0);
        assert!(idx.matches("deal").is_empty());
    }

    #[test]
    fn test_cache_bounded_and_cleared_wholesale() {
        let sets = vec![set("t1", 1, "a", vec![Keyword::literal("x")])];
        let (idx, _) = CompiledIndex::build(&sets, 3);
        for t in ["x1", "x2", "x3"] {
            idx.matches(t);
        }
        assert_eq!(idx.cached_texts(), 3);
        idx.matches("x4");
        assert_eq!(idx.cached_texts(), 1);
        // Cache hit returns the same answer.
        assert_eq!(idx.matches("X4").len(), 1);
        assert_eq!(idx.cached_texts(), 1);
    }
}
