//! C7 — FacetingService: facet counting, a short-TTL cache keyed by
//! `(workspace, query, max_results)`, and the four suggestion algorithms
//! (§4.7).

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

pub const FACET_DIMENSIONS: &[&str] = &["type", "status", "priority", "category", "is_shared", "files"];
const DEFAULT_TOP_N: usize = 10;
const DEFAULT_MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone)]
pub struct FacetSnapshot {
    pub counts: BTreeMap<String, BTreeMap<String, usize>>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacetSuggestion {
    pub dimension: String,
    pub value: String,
    pub reason: String,
}

struct CacheEntry {
    snapshot: FacetSnapshot,
    cached_at: Instant,
}

pub struct FacetingService {
    cache: DashMap<(String, String, usize), CacheEntry>,
    ttl: Duration,
}

static QUERY_CONTEXT_MAP: LazyLock<Vec<(&'static str, &'static [(&'static str, &'static str)])>> = LazyLock::new(|| {
    vec![
        ("authentication", &[("type", "SecurityRule"), ("category", "Backend/Security")]),
        ("auth", &[("type", "SecurityRule"), ("category", "Backend/Security")]),
        ("performance", &[("category", "Backend/Performance")]),
        ("database", &[("category", "Backend/Database")]),
        ("ui", &[("category", "Frontend/UI")]),
    ]
});

static POPULAR_COMBINATIONS: LazyLock<Vec<((&'static str, &'static str), (&'static str, &'static str))>> =
    LazyLock::new(|| {
        vec![
            (("type", "TechnicalDebt"), ("priority", "high")),
            (("type", "BugReport"), ("priority", "high")),
            (("type", "SecurityRule"), ("priority", "critical")),
        ]
    });

const SMART_DEFAULT_ORDER: &[&str] = &["type", "priority", "status", "is_shared", "category"];

impl FacetingService {
    pub fn new(ttl: Duration) -> Self {
        Self { cache: DashMap::new(), ttl }
    }

    pub fn get_cached(&self, workspace: &str, query: &str, max_results: usize) -> Option<FacetSnapshot> {
        let key = (workspace.to_string(), query.to_string(), max_results);
        let entry = self.cache.get(&key)?;
        if entry.cached_at.elapsed() > self.ttl {
            drop(entry);
            self.cache.remove(&key);
            return None;
        }
        Some(entry.snapshot.clone())
    }

    pub fn put(&self, workspace: &str, query: &str, max_results: usize, snapshot: FacetSnapshot) {
        let key = (workspace.to_string(), query.to_string(), max_results);
        self.cache.insert(key, CacheEntry { snapshot, cached_at: Instant::now() });
    }

    /// Invalidated on any memory write for `workspace` (§4.7).
    pub fn invalidate(&self, workspace: &str) {
        self.cache.retain(|(ws, _, _), _| ws != workspace);
    }

    pub fn suggestions(
        &self,
        snapshot: &FacetSnapshot,
        query: &str,
        applied: &BTreeMap<String, String>,
        max_suggestions: Option<usize>,
    ) -> Vec<FacetSuggestion> {
        let max = max_suggestions.unwrap_or(DEFAULT_MAX_SUGGESTIONS);
        let mut out: Vec<FacetSuggestion> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for (dim, value) in self.query_context_suggestions(query) {
            self.push_unique(&mut out, &mut seen, dim, value, "query context match".to_string());
        }

        for (dim, value, reason) in self.popular_combination_suggestions(applied) {
            self.push_unique(&mut out, &mut seen, dim, value, reason);
        }

        for s in self.discriminating_suggestions(snapshot, applied) {
            self.push_unique(&mut out, &mut seen, s.dimension, s.value, s.reason);
        }

        if applied.is_empty() {
            for s in self.smart_default_suggestions(snapshot) {
                self.push_unique(&mut out, &mut seen, s.dimension, s.value, s.reason);
            }
        }

        out.truncate(max);
        out
    }

    fn push_unique(
        &self,
        out: &mut Vec<FacetSuggestion>,
        seen: &mut std::collections::HashSet<(String, String)>,
        dim: String,
        value: String,
        reason: String,
    ) {
        let k = (dim.clone(), value.clone());
        if seen.insert(k) {
            out.push(FacetSuggestion { dimension: dim, value, reason });
        }
    }

    fn query_context_suggestions(&self, query: &str) -> Vec<(String, String)> {
        let lower = query.to_lowercase();
        let mut out = Vec::new();
        for (keyword, pairs) in QUERY_CONTEXT_MAP.iter() {
            if lower.contains(keyword) {
                for (dim, value) in *pairs {
                    out.push((dim.to_string(), value.to_string()));
                }
            }
        }
        out
    }

    fn popular_combination_suggestions(&self, applied: &BTreeMap<String, String>) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for (trigger, suggestion) in POPULAR_COMBINATIONS.iter() {
            if applied.get(trigger.0).map(|v| v.as_str()) == Some(trigger.1) {
                out.push((
                    suggestion.0.to_string(),
                    suggestion.1.to_string(),
                    format!("commonly paired with {}={}", trigger.0, trigger.1),
                ));
            }
        }
        out
    }

    /// For each unfiltered dimension, propose the value whose share of the
    /// result set is within `[0.2, 0.6]`, closest to `0.35` preferred.
    fn discriminating_suggestions(
        &self,
        snapshot: &FacetSnapshot,
        applied: &BTreeMap<String, String>,
    ) -> Vec<FacetSuggestion> {
        if snapshot.total == 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        for dim in FACET_DIMENSIONS {
            if applied.contains_key(*dim) {
                continue;
            }
            let Some(values) = snapshot.counts.get(*dim) else { continue };
            let mut best: Option<(&String, f64)> = None;
            for (value, count) in values {
                let share = *count as f64 / snapshot.total as f64;
                if !(0.2..=0.6).contains(&share) {
                    continue;
                }
                let distance = (share - 0.35).abs();
                if best.map(|(_, d)| distance < d).unwrap_or(true) {
                    best = Some((value, distance));
                }
            }
            if let Some((value, _)) = best {
                out.push(FacetSuggestion {
                    dimension: dim.to_string(),
                    value: value.clone(),
                    reason: "discriminates the current result set".to_string(),
                });
            }
        }
        out
    }

    /// When nothing is filtered, suggest the top value of each dimension by
    /// the fixed priority order, gated by share `[0.1, 0.8]`.
    fn smart_default_suggestions(&self, snapshot: &FacetSnapshot) -> Vec<FacetSuggestion> {
        if snapshot.total == 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        for dim in SMART_DEFAULT_ORDER {
            let Some(values) = snapshot.counts.get(*dim) else { continue };
            let Some((top_value, top_count)) = values.iter().max_by_key(|(_, c)| **c) else { continue };
            let share = *top_count as f64 / snapshot.total as f64;
            if (0.1..=0.8).contains(&share) {
                out.push(FacetSuggestion {
                    dimension: dim.to_string(),
                    value: top_value.clone(),
                    reason: "smart default".to_string(),
                });
            }
        }
        out
    }
}

pub fn top_n(counts: &BTreeMap<String, usize>, n: usize) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.truncate(if n == 0 { DEFAULT_TOP_N } else { n });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(type_counts: &[(&str, usize)], total: usize) -> FacetSnapshot {
        let mut counts = BTreeMap::new();
        let mut type_map = BTreeMap::new();
        for (v, c) in type_counts {
            type_map.insert(v.to_string(), *c);
        }
        counts.insert("type".to_string(), type_map);
        FacetSnapshot { counts, total }
    }

    #[test]
    fn discriminating_suggestion_prefers_share_near_0_35() {
        let svc = FacetingService::new(Duration::from_secs(300));
        let snapshot = snapshot_with(&[("Bug", 35), ("Feature", 65)], 100);
        let applied = BTreeMap::new();
        let suggestions = svc.discriminating_suggestions(&snapshot, &applied);
        assert_eq!(suggestions[0].value, "Bug");
    }

    #[test]
    fn query_context_suggests_security_rule_for_authentication() {
        let svc = FacetingService::new(Duration::from_secs(300));
        let suggestions = svc.query_context_suggestions("tell me about authentication flows");
        assert!(suggestions.contains(&("type".to_string(), "SecurityRule".to_string())));
    }

    #[test]
    fn popular_combination_suggests_priority_high_for_technical_debt() {
        let svc = FacetingService::new(Duration::from_secs(300));
        let mut applied = BTreeMap::new();
        applied.insert("type".to_string(), "TechnicalDebt".to_string());
        let suggestions = svc.popular_combination_suggestions(&applied);
        assert!(suggestions.iter().any(|(d, v, _)| d == "priority" && v == "high"));
    }

    #[test]
    fn cache_entry_expires_after_ttl() {
        let svc = FacetingService::new(Duration::from_millis(1));
        svc.put("ws", "q", 10, FacetSnapshot { counts: BTreeMap::new(), total: 0 });
        std::thread::sleep(Duration::from_millis(5));
        assert!(svc.get_cached("ws", "q", 10).is_none());
    }
}
