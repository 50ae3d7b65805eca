//! Hot-swappable keyword index.

use arc_swap::ArcSwap;
use reachclaw_core::error::Result;
use reachclaw_core::types::{KeywordSet, TenantId};
use reachclaw_db::FleetDb;
use std::sync::Arc;

use crate::compiled::{CompileReport, CompiledIndex, KeywordMatch};

/// Shared keyword index. Readers load the current snapshot without locking;
/// `compile` builds a fresh snapshot and swaps it in whole.
pub struct KeywordIndex {
    current: ArcSwap<CompiledIndex>,
    cache_capacity: usize,
}

impl KeywordIndex {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            current: ArcSwap::from_pointee(CompiledIndex::empty(cache_capacity)),
            cache_capacity,
        }
    }

    /// Rebuild from the full current set of keyword definitions. The old
    /// snapshot, and its match cache, stay valid for readers already holding
    /// it.
    pub fn compile(&self, sets: &[KeywordSet]) -> CompileReport {
        let (index, report) = CompiledIndex::build(sets, self.cache_capacity);
        self.current.store(Arc::new(index));
        tracing::info!(
            sets = report.sets,
            literals = report.literals,
            regexes = report.regexes,
            skipped = report.skipped.len(),
            "🔤 Keyword index compiled"
        );
        report
    }

    /// Reload every set from the datastore.
    pub fn reload(&self, db: &FleetDb) -> Result<CompileReport> {
        let sets = db.all_keyword_sets()?;
        Ok(self.compile(&sets))
    }

    /// Every keyword occurring in `text`, across all tenants.
    pub fn matches(&self, text: &str) -> Vec<KeywordMatch> {
        self.current.load().matches(text)
    }

    /// Keywords of one tenant occurring in `text`.
    pub fn matches_for(&self, tenant: &TenantId, text: &str) -> Vec<KeywordMatch> {
        let mut hits = self.matches(text);
        hits.retain(|m| &m.tenant_id == tenant);
        hits
    }

    pub fn snapshot(&self) -> Arc<CompiledIndex> {
        self.current.load_full()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiled::normalize;
    use proptest::prelude::*;
    use reachclaw_core::types::Keyword;

    fn set_of(tenant: &str, id: i64, words: &[&str]) -> KeywordSet {
        let mut s = KeywordSet::new(
            TenantId::new(tenant),
            format!("set-{id}"),
            words.iter().map(|w| Keyword::literal(*w)).collect(),
        );
        s.id = id;
        s
    }

    #[test]
    fn test_recompile_swaps_snapshot() {
        let index = KeywordIndex::new(64);
        index.compile(&[set_of("t1", 1, &["alpha"])]);
        let old = index.snapshot();
        assert_eq!(index.matches("ALPHA beta").len(), 1);

        index.compile(&[set_of("t1", 1, &["beta"])]);
        // Readers holding the old snapshot keep a consistent view.
        assert_eq!(old.matches("alpha").len(), 1);
        assert!(index.matches("alpha").is_empty());
        assert_eq!(index.matches("alpha beta").len(), 1);
        assert_eq!(index.snapshot().cached_texts(), 2);
    }

    #[test]
    fn test_matches_for_filters_tenant() {
        let index = KeywordIndex::new(64);
        index.compile(&[set_of("t1", 1, &["sale"]), set_of("t2", 2, &["sale"])]);
        assert_eq!(index.matches("big SALE").len(), 2);
        let t1 = index.matches_for(&TenantId::new("t1"), "big SALE");
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].set_id, 1);
    }

    #[test]
    fn test_reload_from_db() {
        let db = FleetDb::open_in_memory(false).unwrap();
        db.insert_keyword_set(&set_of("t1", 0, &["khuyến mãi"])).unwrap();
        let index = KeywordIndex::new(64);
        let report = index.reload(&db).unwrap();
        assert_eq!(report.literals, 1);
        assert_eq!(index.matches_for(&TenantId::new("t1"), "KHUYẾN MÃI hôm nay").len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn prop_present_keywords_found_absent_never(
            words in proptest::collection::vec("[a-z]{3,7}", 1..6),
            filler in "[a-z ]{0,12}",
            pick in any::<proptest::sample::Index>(),
            shout in any::<bool>(),
        ) {
            let refs: Vec<&str> = words.iter().map(String::as_str).collect();
            let index = KeywordIndex::new(16);
            index.compile(&[set_of("t1", 1, &refs)]);

            let chosen = pick.get(&words);
            let embedded = if shout { chosen.to_uppercase() } else { chosen.clone() };
            let text = format!("{filler} {embedded} {filler}");
            let hits = index.matches(&text);

            prop_assert!(hits.iter().any(|h| &h.pattern == chosen));
            let lowered = normalize(&text);
            for h in &hits {
                prop_assert!(lowered.contains(&normalize(&h.pattern)));
            }
        }

        #[test]
        fn prop_malformed_regex_never_aborts(pattern in "[a-z()\\[\\]*+?\\\\]{1,10}") {
            let mut s = set_of("t1", 1, &["anchor"]);
            s.keywords.push(Keyword::regex(pattern));
            let index = KeywordIndex::new(16);
            let report = index.compile(&[s]);
            prop_assert_eq!(report.literals, 1);
            prop_assert_eq!(index.matches("ANCHOR").iter().filter(|h| !h.is_regex).count(), 1);
        }
    }
}
