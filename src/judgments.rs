//! Relevance judgments: graded labels for (query, document) pairs.

use crate::queries::QueryStrings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of one judged query within a run; the key per-query scores are
/// recorded under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query_id: String,
    /// Empty string = the unnamed/default query set.
    #[serde(default)]
    pub query_set: String,
    #[serde(default)]
    pub query_strings: QueryStrings,
    /// How many times this query was observed (weighting hook); defaults to 1.
    #[serde(default = "default_query_count")]
    pub query_count: i64,
}

fn default_query_count() -> i64 {
    1
}

impl QueryInfo {
    pub fn new(query_id: impl Into<String>, query_strings: QueryStrings) -> Self {
        Self {
            query_id: query_id.into(),
            query_set: String::new(),
            query_strings,
            query_count: 1,
        }
    }
}

/// One query's graded judgments: document id -> relevance grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgments {
    #[serde(flatten)]
    pub query_info: QueryInfo,
    #[serde(default)]
    pub judgments: BTreeMap<String, f64>,
}

impl Judgments {
    pub fn new(query_info: QueryInfo) -> Self {
        Self {
            query_info,
            judgments: BTreeMap::new(),
        }
    }

    pub fn add_judgment(&mut self, doc_id: impl Into<String>, grade: f64) {
        self.judgments.insert(doc_id.into(), grade);
    }

    pub fn contains_judgment(&self, doc_id: &str) -> bool {
        self.judgments.contains_key(doc_id)
    }

    pub fn grade(&self, doc_id: &str) -> Option<f64> {
        self.judgments.get(doc_id).copied()
    }

    pub fn len(&self) -> usize {
        self.judgments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.judgments.is_empty()
    }

    /// Document ids ordered by descending grade (ties broken by id for
    /// determinism). This is the ideal ordering used by normalized metrics.
    pub fn ids_by_descending_grade(&self) -> Vec<&str> {
        let mut ids: Vec<(&str, f64)> = self
            .judgments
            .iter()
            .map(|(id, grade)| (id.as_str(), *grade))
            .collect();
        ids.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        ids.into_iter().map(|(id, _)| id).collect()
    }

    pub fn query_strings(&self) -> &QueryStrings {
        &self.query_info.query_strings
    }
}

/// Ordered collection of per-query judgments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JudgmentList {
    pub judgments: Vec<Judgments>,
}

impl JudgmentList {
    pub fn add(&mut self, judgments: Judgments) {
        self.judgments.push(judgments);
    }

    pub fn len(&self) -> usize {
        self.judgments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.judgments.is_empty()
    }

    /// Distinct query-set names present, excluding the unnamed set.
    pub fn query_sets(&self) -> Vec<String> {
        let mut sets: Vec<String> = self
            .judgments
            .iter()
            .map(|j| j.query_info.query_set.clone())
            .filter(|s| !s.is_empty())
            .collect();
        sets.sort();
        sets.dedup();
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Judgments {
        let mut j = Judgments::new(QueryInfo::new("q1", QueryStrings::single("red shoes")));
        j.add_judgment("doc_low", 1.0);
        j.add_judgment("doc_high", 3.0);
        j.add_judgment("doc_mid", 2.0);
        j
    }

    #[test]
    fn ids_sorted_by_grade_desc() {
        let j = sample();
        assert_eq!(
            j.ids_by_descending_grade(),
            vec!["doc_high", "doc_mid", "doc_low"]
        );
    }

    #[test]
    fn grade_ties_break_by_id() {
        let mut j = Judgments::new(QueryInfo::new("q1", QueryStrings::default()));
        j.add_judgment("b", 1.0);
        j.add_judgment("a", 1.0);
        assert_eq!(j.ids_by_descending_grade(), vec!["a", "b"]);
    }

    #[test]
    fn judgment_list_query_sets() {
        let mut list = JudgmentList::default();
        for (id, set) in [("q1", "head"), ("q2", ""), ("q3", "tail"), ("q4", "head")] {
            let mut info = QueryInfo::new(id, QueryStrings::default());
            info.query_set = set.to_string();
            list.add(Judgments::new(info));
        }
        assert_eq!(list.query_sets(), vec!["head", "tail"]);
    }

    #[test]
    fn json_roundtrip() {
        let mut list = JudgmentList::default();
        list.add(sample());
        let json = serde_json::to_string(&list).unwrap();
        let back: JudgmentList = serde_json::from_str(&json).unwrap();
        assert_eq!(list, back);
    }

    #[test]
    fn query_info_defaults_from_minimal_json() {
        let j: Judgments = serde_json::from_str(
            r#"{"query_id": "q9", "judgments": {"d1": 2.0}}"#,
        )
        .unwrap();
        assert_eq!(j.query_info.query_count, 1);
        assert_eq!(j.query_info.query_set, "");
        assert!(j.contains_judgment("d1"));
    }
}
