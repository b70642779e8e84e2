//! C8 — QueryExpansion: natural-language query detection, code-identifier
//! tokenization and domain-synonym expansion, turned into a tantivy `Query`
//! against the memory schema's `_all` field (§4.8).

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, PhraseQuery, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption};
use tantivy::{Index, Term};

const NL_MARKERS: &[&str] = &[
    "that", "about", "where", "when", "how", "what", "which", "why", "find", "show", "get",
    "need", "remember", "recall", "was", "were", "discussed", "mentioned", "talked", "related",
    "regarding", "concerning",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "of", "to", "in", "is", "it", "for", "on", "as", "by", "at",
];

const LUCENE_SPECIAL: &[char] =
    &['+', '-', '&', '|', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', '*', '?', ':', '\\', '/'];

static SYNONYMS: LazyLock<HashMap<&'static str, &'static [&'static str]>> = LazyLock::new(|| {
    HashMap::from([
        ("auth", ["authentication", "authorization", "login"].as_slice()),
        ("authentication", ["auth", "login", "signin"].as_slice()),
        ("bug", ["defect", "issue", "problem"].as_slice()),
        ("config", ["configuration", "settings"].as_slice()),
        ("db", ["database", "datastore"].as_slice()),
        ("fn", ["function", "method"].as_slice()),
        ("perf", ["performance", "optimization"].as_slice()),
        ("ui", ["interface", "frontend"].as_slice()),
    ])
});

/// `true` if the query reads as natural language rather than a structured
/// query expression.
pub fn is_natural_language(query: &str) -> bool {
    let lower = query.to_lowercase();
    let has_marker = NL_MARKERS.iter().any(|m| lower.split_whitespace().any(|w| w == *m));
    if has_marker {
        return true;
    }
    let word_count = lower.split_whitespace().count();
    let has_operator = query.chars().any(|c| "*~".contains(c))
        || query.contains(" AND ")
        || query.contains(" OR ")
        || query.contains(':');
    word_count > 3 && !has_operator
}

/// Splits `PascalCase`/`camelCase`/`snake_case`/`CONSTANT_CASE` identifiers
/// into their constituent parts (lowercased).
pub fn split_identifier(token: &str) -> Vec<String> {
    if token.contains('_') {
        return token.split('_').filter(|p| !p.is_empty()).map(|p| p.to_lowercase()).collect();
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    for ch in token.chars() {
        if ch.is_uppercase() && !current.is_empty() && !current.chars().last().unwrap().is_uppercase() {
            parts.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    if parts.is_empty() {
        vec![token.to_lowercase()]
    } else {
        parts.into_iter().map(|p| p.to_lowercase()).collect()
    }
}

fn escape_lucene(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if LUCENE_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn tokenize(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .flat_map(|t| {
            let base = t.to_lowercase();
            let mut out = vec![base];
            out.extend(split_identifier(t));
            out
        })
        .collect()
}

/// Plain lowercased tokens in original query order, with no identifier
/// splitting or synonym expansion — the literal words the phrase query
/// matches against.
fn original_tokens(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn expand_terms(tokens: &[String]) -> Vec<String> {
    let mut set: HashSet<String> = HashSet::new();
    for t in tokens {
        if t.len() <= 2 || STOPWORDS.contains(&t.as_str()) {
            continue;
        }
        set.insert(t.clone());
        if let Some(syns) = SYNONYMS.get(t.as_str()) {
            for s in *syns {
                set.insert(s.to_string());
            }
        }
    }
    set.into_iter().collect()
}

/// Builds the tantivy query for a memory search. `all_text_field` is the
/// schema's `_all` field; `fallback_fields` are used by the non-NL parser.
pub fn build_query(
    index: &Index,
    all_text_field: Field,
    fallback_fields: &[Field],
    query_text: &str,
) -> Box<dyn Query> {
    let trimmed = query_text.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Box::new(tantivy::query::AllQuery);
    }

    if is_natural_language(trimmed) {
        let tokens = tokenize(trimmed);
        let expanded = expand_terms(&tokens);
        if expanded.is_empty() {
            return Box::new(tantivy::query::AllQuery);
        }

        let minimum_should_match = (expanded.len() / 3).max(1);
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = expanded
            .iter()
            .map(|term| {
                let escaped = escape_lucene(term);
                let t = Term::from_field_text(all_text_field, &escaped);
                let q: Box<dyn Query> = Box::new(TermQuery::new(t, IndexRecordOption::Basic));
                (Occur::Should, q)
            })
            .collect();

        // Optional phrase query over the original (unexpanded) tokens — rewards
        // documents that contain the query words in order, on top of the
        // boosted single-term matches above.
        let originals = original_tokens(trimmed);
        if originals.len() >= 2 {
            let terms: Vec<Term> = originals
                .iter()
                .map(|t| Term::from_field_text(all_text_field, &escape_lucene(t)))
                .collect();
            clauses.push((Occur::Should, Box::new(PhraseQuery::new(terms))));
        }

        let mut boolean = BooleanQuery::new(clauses);
        boolean.set_minimum_number_should_match(minimum_should_match);
        Box::new(boolean)
    } else {
        let parser = QueryParser::for_index(index, fallback_fields.to_vec());
        match parser.parse_query(trimmed) {
            Ok(q) => q,
            Err(_) => {
                let escaped = escape_lucene(trimmed);
                let t = Term::from_field_text(all_text_field, &escaped);
                Box::new(FuzzyTermQuery::new(t, 0, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_natural_language_via_marker_word() {
        assert!(is_natural_language("find the auth bug we discussed"));
    }

    #[test]
    fn detects_natural_language_via_word_count_without_operators() {
        assert!(is_natural_language("something about database connection pooling logic"));
    }

    #[test]
    fn does_not_detect_structured_query_as_natural_language() {
        assert!(!is_natural_language("type:Bug AND status:open"));
        assert!(!is_natural_language("foo"));
    }

    #[test]
    fn splits_camel_case() {
        assert_eq!(split_identifier("getUserById"), vec!["get", "user", "by", "id"]);
    }

    #[test]
    fn splits_pascal_case() {
        assert_eq!(split_identifier("UserAccountService"), vec!["user", "account", "service"]);
    }

    #[test]
    fn splits_snake_and_constant_case() {
        assert_eq!(split_identifier("max_retry_count"), vec!["max", "retry", "count"]);
        assert_eq!(split_identifier("MAX_RETRY_COUNT"), vec!["max", "retry", "count"]);
    }

    #[test]
    fn escape_lucene_prefixes_special_characters() {
        assert_eq!(escape_lucene("a+b"), "a\\+b");
        assert_eq!(escape_lucene("plain"), "plain");
    }
}
