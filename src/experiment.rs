//! Experiments: fully-specified, nameable query configurations, and the
//! named set of them one run evaluates.

use crate::error::{QuerytuneError, Result};
use crate::features::{CustomHandler, ServerConnection};
use crate::queries::Query;
use crate::scorers::Scorer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One query configuration against one backend connection.
///
/// Immutable once stored in an [`ExperimentSet`]; the name is the unique key
/// persisted scores are recorded under. The query is shared read-only across
/// worker threads; runtime text is always bound on a per-call clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub server: ServerConnection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_handler: Option<CustomHandler>,
    pub query: Query,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_queries: Vec<Query>,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        server: ServerConnection,
        custom_handler: Option<CustomHandler>,
        query: Query,
    ) -> Self {
        Self {
            name: name.into(),
            server,
            custom_handler,
            query,
            filter_queries: Vec::new(),
        }
    }

    pub fn with_filter_queries(mut self, filter_queries: Vec<Query>) -> Self {
        self.filter_queries = filter_queries;
        self
    }
}

/// Named mapping of experiments plus the scorers to evaluate them with.
/// Created from a JSON file, consumed read-only by the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentSet {
    pub experiments: BTreeMap<String, Experiment>,
    #[serde(default)]
    pub scorers: Vec<Scorer>,
}

impl ExperimentSet {
    pub fn new(scorers: Vec<Scorer>) -> Self {
        Self {
            experiments: BTreeMap::new(),
            scorers,
        }
    }

    /// Add an experiment; names must be unique within the set.
    pub fn add_experiment(&mut self, experiment: Experiment) -> Result<()> {
        if self.experiments.contains_key(&experiment.name) {
            return Err(QuerytuneError::Experiment(format!(
                "duplicate experiment name: {}",
                experiment.name
            )));
        }
        self.experiments.insert(experiment.name.clone(), experiment);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Experiment> {
        self.experiments.get(name)
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Search depth the runner asks for: the deepest `at_n` any scorer needs.
    pub fn max_rows(&self) -> usize {
        self.scorers.iter().map(|s| s.at_n()).max().unwrap_or(10)
    }

    /// The scorer that ranks experiments during tuning. Exactly one may be
    /// flagged; with none flagged the first scorer is the default.
    pub fn train_scorer(&self) -> Result<&Scorer> {
        select_scorer(&self.scorers, |s| s.use_for_train, "train")
    }

    /// The scorer that ranks experiments when reporting a held-out test set.
    pub fn test_scorer(&self) -> Result<&Scorer> {
        select_scorer(&self.scorers, |s| s.use_for_test, "test")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Shared flagged-scorer lookup for train/test selection.
pub(crate) fn select_scorer<'a>(
    scorers: &'a [Scorer],
    flag: impl Fn(&Scorer) -> bool,
    role: &str,
) -> Result<&'a Scorer> {
    let mut found: Option<&Scorer> = None;
    for scorer in scorers {
        if flag(scorer) {
            if found.is_some() {
                return Err(QuerytuneError::InvalidConfiguration(format!(
                    "more than one scorer is flagged for {}",
                    role
                )));
            }
            found = Some(scorer);
        }
    }
    found
        .or(scorers.first())
        .ok_or_else(|| QuerytuneError::InvalidConfiguration("no scorers declared".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FieldWeights, WeightedField};
    use crate::queries::MultiMatchQuery;
    use crate::scorers::Metric;

    fn experiment(name: &str) -> Experiment {
        Experiment::new(
            name,
            ServerConnection::new("http://localhost:9200/idx"),
            None,
            Query::MultiMatch(MultiMatchQuery::new(FieldWeights(vec![
                WeightedField::new("title", 2.0),
            ]))),
        )
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut set = ExperimentSet::default();
        set.add_experiment(experiment("a")).unwrap();
        assert!(set.add_experiment(experiment("a")).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn max_rows_is_deepest_scorer() {
        let mut set = ExperimentSet::new(vec![
            Scorer::new(Metric::Ndcg { at_n: 10 }),
            Scorer::new(Metric::HighestRank { at_n: 50 }),
        ]);
        set.add_experiment(experiment("a")).unwrap();
        assert_eq!(set.max_rows(), 50);
    }

    #[test]
    fn scorer_selection_defaults_to_first() {
        let set = ExperimentSet::new(vec![
            Scorer::new(Metric::Ndcg { at_n: 10 }),
            Scorer::new(Metric::HighestRank { at_n: 10 }),
        ]);
        assert_eq!(set.train_scorer().unwrap().name(), "ndcg_10");
        assert_eq!(set.test_scorer().unwrap().name(), "ndcg_10");
    }

    #[test]
    fn scorer_selection_rejects_multiple_flags() {
        let mut a = Scorer::new(Metric::Ndcg { at_n: 10 });
        a.use_for_test = true;
        let mut b = Scorer::new(Metric::HighestRank { at_n: 10 });
        b.use_for_test = true;
        let set = ExperimentSet::new(vec![a, b]);
        assert!(set.test_scorer().is_err());
        assert!(set.train_scorer().is_ok());
    }

    #[test]
    fn json_roundtrip() {
        let mut set = ExperimentSet::new(vec![Scorer::new(Metric::Ndcg { at_n: 10 })]);
        set.add_experiment(experiment("exp_1")).unwrap();
        let json = set.to_json().unwrap();
        let back = ExperimentSet::from_json(&json).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.get("exp_1").unwrap(), set.get("exp_1").unwrap());
        assert_eq!(back.scorers, set.scorers);
    }
}
