//! Ranking-quality metrics computed per query, plus the accumulation and
//! aggregation machinery the runner reduces them with.
//!
//! Scorers themselves are stateless and shareable; per-query values collect
//! in a per-worker [`ScoreAccumulator`] and are merged single-threaded after
//! the workers join.

use crate::judgments::{Judgments, QueryInfo};
use crate::search::SearchResultSet;
use crate::stats;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Recorded when a metric cannot be computed for a query (zero ideal score,
/// no judged document within reach).
pub const ERROR_VALUE: f64 = -1.0;

/// The metric a scorer computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum Metric {
    /// Discounted cumulative gain normalized against the best achievable
    /// ordering of the judged documents.
    Ndcg { at_n: usize },
    /// 1-based rank of the first judged document within `at_n`;
    /// [`ERROR_VALUE`] when none appears.
    HighestRank { at_n: usize },
    /// Result-set-only: how many documents came back within `at_n`.
    ResultCount { at_n: usize },
}

/// How per-query values roll up into one aggregated row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Mean and median.
    Distributional,
    /// Total only.
    Summing,
}

/// One configured metric with its report/selection flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorer {
    #[serde(flatten)]
    pub metric: Metric,
    #[serde(default)]
    pub use_for_train: bool,
    #[serde(default)]
    pub use_for_test: bool,
    /// Include this scorer in the significance-matrix reports.
    #[serde(default)]
    pub export_p_matrix: bool,
}

impl Scorer {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            use_for_train: false,
            use_for_test: false,
            export_p_matrix: false,
        }
    }

    /// Column-safe identifier, e.g. `ndcg_10`.
    pub fn name(&self) -> String {
        match &self.metric {
            Metric::Ndcg { at_n } => format!("ndcg_{}", at_n),
            Metric::HighestRank { at_n } => format!("highest_rank_{}", at_n),
            Metric::ResultCount { at_n } => format!("result_count_{}", at_n),
        }
    }

    pub fn at_n(&self) -> usize {
        match &self.metric {
            Metric::Ndcg { at_n }
            | Metric::HighestRank { at_n }
            | Metric::ResultCount { at_n } => *at_n,
        }
    }

    /// Judgment-based metrics need the graded-relevance map; result-set-only
    /// metrics score from the returned ids alone.
    pub fn needs_judgments(&self) -> bool {
        !matches!(self.metric, Metric::ResultCount { .. })
    }

    pub fn aggregation(&self) -> Aggregation {
        match self.metric {
            Metric::ResultCount { .. } => Aggregation::Summing,
            _ => Aggregation::Distributional,
        }
    }

    /// Name of the aggregated column used to rank experiments.
    pub fn primary_statistic(&self) -> String {
        match self.aggregation() {
            Aggregation::Summing => format!("{}_sum", self.name()),
            Aggregation::Distributional => format!("{}_mean", self.name()),
        }
    }

    /// All aggregated column names this scorer produces.
    pub fn aggregated_columns(&self) -> Vec<String> {
        match self.aggregation() {
            Aggregation::Summing => vec![format!("{}_sum", self.name())],
            Aggregation::Distributional => vec![
                format!("{}_mean", self.name()),
                format!("{}_median", self.name()),
            ],
        }
    }

    /// Aggregated (column, value) pairs over one query set's per-query scores.
    pub fn aggregate(&self, values: &[f64]) -> Vec<(String, f64)> {
        match self.aggregation() {
            Aggregation::Summing => {
                vec![(format!("{}_sum", self.name()), values.iter().sum())]
            }
            Aggregation::Distributional => vec![
                (format!("{}_mean", self.name()), stats::mean(values)),
                (format!("{}_median", self.name()), stats::median(values)),
            ],
        }
    }

    /// Score one query given its judgments and results.
    pub fn score_judged(&self, judgments: &Judgments, results: &SearchResultSet) -> f64 {
        match &self.metric {
            Metric::Ndcg { at_n } => ndcg(judgments, results, *at_n),
            Metric::HighestRank { at_n } => highest_rank(judgments, results, *at_n),
            Metric::ResultCount { at_n } => self.score_result_set_at(results, *at_n),
        }
    }

    /// Score one query from the result set alone.
    pub fn score_result_set(&self, results: &SearchResultSet) -> f64 {
        self.score_result_set_at(results, self.at_n())
    }

    fn score_result_set_at(&self, results: &SearchResultSet, at_n: usize) -> f64 {
        results.documents.len().min(at_n) as f64
    }
}

/// DCG over the first `at_n` results: sum of (2^grade - 1) / log2(rank + 2).
fn dcg(judgments: &Judgments, ids: &[&str], at_n: usize) -> f64 {
    let mut total = 0.0;
    for (i, id) in ids.iter().take(at_n).enumerate() {
        if let Some(grade) = judgments.grade(id) {
            total += (2f64.powf(grade) - 1.0) / (i as f64 + 2.0).log2();
        }
    }
    total
}

fn ndcg(judgments: &Judgments, results: &SearchResultSet, at_n: usize) -> f64 {
    let actual_ids = results.ids();
    // ideal ordering truncated at the shorter of at_n and the actual depth
    let depth = at_n.min(results.documents.len());
    let ideal_ids = judgments.ids_by_descending_grade();
    let ideal = dcg(judgments, &ideal_ids, depth);
    if ideal == 0.0 {
        log::warn!(
            "ideal DCG is 0 (ndcg@{}): {}",
            at_n,
            judgments.query_strings()
        );
        return ERROR_VALUE;
    }
    dcg(judgments, &actual_ids, at_n) / ideal
}

fn highest_rank(judgments: &Judgments, results: &SearchResultSet, at_n: usize) -> f64 {
    for (i, id) in results.ids().iter().take(at_n).enumerate() {
        if judgments.contains_judgment(id) {
            return (i + 1) as f64;
        }
    }
    log::warn!(
        "no judged document in the top {}: {}",
        at_n,
        judgments.query_strings()
    );
    ERROR_VALUE
}

/// Per-worker score store: scorer name -> (query -> score).
#[derive(Debug, Default, Clone)]
pub struct ScoreAccumulator {
    scores: HashMap<String, HashMap<QueryInfo, f64>>,
}

impl ScoreAccumulator {
    pub fn record(&mut self, scorer_name: &str, query_info: &QueryInfo, score: f64) {
        self.scores
            .entry(scorer_name.to_string())
            .or_default()
            .insert(query_info.clone(), score);
    }

    pub fn get(&self, scorer_name: &str, query_info: &QueryInfo) -> Option<f64> {
        self.scores
            .get(scorer_name)
            .and_then(|m| m.get(query_info))
            .copied()
    }

    /// Fold another worker's accumulator into this one (single-threaded
    /// reduce after join).
    pub fn merge(&mut self, other: ScoreAccumulator) {
        for (scorer, map) in other.scores {
            self.scores.entry(scorer).or_default().extend(map);
        }
    }

    /// All scores for one scorer restricted to a query set; empty set name
    /// means every query.
    pub fn scores_for(&self, scorer_name: &str, query_set: &str) -> Vec<f64> {
        self.scores
            .get(scorer_name)
            .map(|m| {
                m.iter()
                    .filter(|(qi, _)| query_set.is_empty() || qi.query_set == query_set)
                    .map(|(_, v)| *v)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn query_count(&self, scorer_name: &str) -> usize {
        self.scores.get(scorer_name).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judgments::QueryInfo;
    use crate::queries::QueryStrings;
    use crate::search::{SearchResultSet, StoredDocument};

    fn results(ids: &[&str]) -> SearchResultSet {
        SearchResultSet {
            total_hits: ids.len() as u64,
            query_time_ms: 1,
            elapsed_ms: 2,
            documents: ids.iter().map(|id| StoredDocument::new(*id)).collect(),
        }
    }

    fn judged(pairs: &[(&str, f64)]) -> Judgments {
        let mut j = Judgments::new(QueryInfo::new("q1", QueryStrings::single("shoes")));
        for (id, grade) in pairs {
            j.add_judgment(*id, *grade);
        }
        j
    }

    #[test]
    fn highest_rank_one_based() {
        let scorer = Scorer::new(Metric::HighestRank { at_n: 10 });
        let j = judged(&[("doc1", 1.0)]);
        let score = scorer.score_judged(&j, &results(&["doc2", "doc1"]));
        assert_eq!(score, 2.0);
    }

    #[test]
    fn highest_rank_not_found_sentinel() {
        let scorer = Scorer::new(Metric::HighestRank { at_n: 2 });
        let j = judged(&[("doc1", 1.0)]);
        let score = scorer.score_judged(&j, &results(&["a", "b", "doc1"]));
        assert_eq!(score, ERROR_VALUE);
    }

    #[test]
    fn ndcg_ideal_order_is_one() {
        let scorer = Scorer::new(Metric::Ndcg { at_n: 10 });
        let j = judged(&[("doc1", 3.0), ("doc2", 1.0)]);
        let score = scorer.score_judged(&j, &results(&["doc1", "doc2"]));
        assert!((score - 1.0).abs() < 1e-9, "score was {}", score);
    }

    #[test]
    fn ndcg_worse_order_below_one() {
        let scorer = Scorer::new(Metric::Ndcg { at_n: 10 });
        let j = judged(&[("doc1", 3.0), ("doc2", 1.0)]);
        let score = scorer.score_judged(&j, &results(&["doc2", "doc1"]));
        assert!(score > 0.0 && score < 1.0, "score was {}", score);
    }

    #[test]
    fn ndcg_zero_ideal_is_error_sentinel() {
        let scorer = Scorer::new(Metric::Ndcg { at_n: 10 });
        // judged docs exist but results are empty, so the truncated ideal is 0
        let j = judged(&[("doc1", 3.0)]);
        let score = scorer.score_judged(&j, &results(&[]));
        assert_eq!(score, ERROR_VALUE);
    }

    #[test]
    fn result_count_caps_at_n() {
        let scorer = Scorer::new(Metric::ResultCount { at_n: 2 });
        assert_eq!(scorer.score_result_set(&results(&["a", "b", "c"])), 2.0);
        assert!(!scorer.needs_judgments());
    }

    #[test]
    fn scorer_names_and_columns() {
        let ndcg = Scorer::new(Metric::Ndcg { at_n: 10 });
        assert_eq!(ndcg.name(), "ndcg_10");
        assert_eq!(ndcg.primary_statistic(), "ndcg_10_mean");
        assert_eq!(
            ndcg.aggregated_columns(),
            vec!["ndcg_10_mean", "ndcg_10_median"]
        );
        let rc = Scorer::new(Metric::ResultCount { at_n: 5 });
        assert_eq!(rc.aggregated_columns(), vec!["result_count_5_sum"]);
    }

    #[test]
    fn aggregate_distributional() {
        let scorer = Scorer::new(Metric::Ndcg { at_n: 10 });
        let agg = scorer.aggregate(&[0.2, 0.4, 0.9]);
        assert_eq!(agg[0].0, "ndcg_10_mean");
        assert!((agg[0].1 - 0.5).abs() < 1e-9);
        assert_eq!(agg[1].0, "ndcg_10_median");
        assert!((agg[1].1 - 0.4).abs() < 1e-9);
    }

    #[test]
    fn accumulator_merge_and_filter() {
        let scorer = "ndcg_10";
        let mut a = ScoreAccumulator::default();
        let mut b = ScoreAccumulator::default();
        let mut q1 = QueryInfo::new("q1", QueryStrings::default());
        q1.query_set = "head".to_string();
        let mut q2 = QueryInfo::new("q2", QueryStrings::default());
        q2.query_set = "tail".to_string();
        a.record(scorer, &q1, 0.5);
        b.record(scorer, &q2, 0.7);
        a.merge(b);
        assert_eq!(a.query_count(scorer), 2);
        assert_eq!(a.scores_for(scorer, "head"), vec![0.5]);
        assert_eq!(a.scores_for(scorer, "").len(), 2);
    }

    #[test]
    fn scorer_json_shape() {
        let json = r#"{"metric": "ndcg", "at_n": 10, "use_for_train": true, "export_p_matrix": true}"#;
        let scorer: Scorer = serde_json::from_str(json).unwrap();
        assert_eq!(scorer.metric, Metric::Ndcg { at_n: 10 });
        assert!(scorer.use_for_train);
        assert!(!scorer.use_for_test);
        assert!(scorer.export_p_matrix);
    }
}
