//! Experiment generation: full cartesian permutation over the declared
//! feature space, and the genetic operators (random, mutate, crossover) used
//! for iterative tuning.

use crate::error::{QuerytuneError, Result};
use crate::experiment::{Experiment, ExperimentSet};
use crate::features::{
    CustomHandler, CustomHandlerFactory, FeatureFactory, FieldWeightsFactory,
    FloatFeatureFactory, ServerConnectionFeatureFactory, StringFeatureFactory,
};
use crate::queries::{MultiMatchQuery, Query};
use crate::scorers::Scorer;
use rand::Rng;
use serde::Deserialize;

/// Composes a multi-field match query from its declared feature slots.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryFactory {
    pub fields: FieldWeightsFactory,
    #[serde(default)]
    pub tie: Option<FloatFeatureFactory>,
    #[serde(default)]
    pub operator: Option<StringFeatureFactory>,
    #[serde(default)]
    pub boost: Option<FloatFeatureFactory>,
}

impl QueryFactory {
    fn build(
        &self,
        fields: crate::features::FieldWeights,
        tie: Option<f32>,
        operator: Option<String>,
        boost: Option<f32>,
    ) -> Query {
        let mut q = MultiMatchQuery::new(fields);
        if let Some(tie) = tie {
            q.tie = tie;
        }
        q.operator = operator;
        if let Some(boost) = boost {
            q.boost = boost;
        }
        Query::MultiMatch(q)
    }

    /// Cartesian product over all declared slots, truncated at `max_size`.
    /// Slots with no declared values pass through as backend defaults.
    pub fn permute(&self, max_size: usize) -> Vec<Query> {
        let field_combos = self.fields.permute(max_size);
        let ties: Vec<Option<f32>> = slot_values(&self.tie, max_size);
        let operators: Vec<Option<String>> = slot_values(&self.operator, max_size);
        let boosts: Vec<Option<f32>> = slot_values(&self.boost, max_size);

        let mut out = Vec::new();
        for fields in &field_combos {
            for tie in &ties {
                for operator in &operators {
                    for boost in &boosts {
                        if out.len() >= max_size {
                            return out;
                        }
                        out.push(self.build(
                            fields.clone(),
                            *tie,
                            operator.clone(),
                            *boost,
                        ));
                    }
                }
            }
        }
        out
    }

    pub fn random(&self) -> Query {
        self.build(
            self.fields.random(),
            self.tie.as_ref().map(|f| f.random()),
            self.operator.as_ref().map(|f| f.random()),
            self.boost.as_ref().map(|f| f.random()),
        )
    }

    /// Mutate each declared slot through its own factory; non-multi-match
    /// queries (from hand-written experiment files) are returned unchanged.
    pub fn mutate(&self, query: &Query, probability: f32, amplitude: f32) -> Query {
        let Query::MultiMatch(mm) = query else {
            return query.clone();
        };
        let mut mutated = mm.clone();
        mutated.fields = self.fields.mutate(&mm.fields, probability, amplitude);
        if let Some(f) = &self.tie {
            mutated.tie = f.mutate(&mm.tie, probability, amplitude);
        }
        if let (Some(f), Some(op)) = (&self.operator, &mm.operator) {
            mutated.operator = Some(f.mutate(op, probability, amplitude));
        }
        if let Some(f) = &self.boost {
            mutated.boost = f.mutate(&mm.boost, probability, amplitude);
        }
        Query::MultiMatch(mutated)
    }

    /// Slot-wise 50/50 crossover; two fresh children, parents untouched.
    pub fn crossover(&self, a: &Query, b: &Query) -> (Query, Query) {
        let (Query::MultiMatch(ma), Query::MultiMatch(mb)) = (a, b) else {
            return (a.clone(), b.clone());
        };
        let mut rng = rand::thread_rng();
        let mut child_a = ma.clone();
        let mut child_b = mb.clone();
        if rng.gen::<f32>() < 0.5 {
            std::mem::swap(&mut child_a.fields, &mut child_b.fields);
        }
        if rng.gen::<f32>() < 0.5 {
            std::mem::swap(&mut child_a.tie, &mut child_b.tie);
        }
        if rng.gen::<f32>() < 0.5 {
            std::mem::swap(&mut child_a.operator, &mut child_b.operator);
        }
        if rng.gen::<f32>() < 0.5 {
            std::mem::swap(&mut child_a.boost, &mut child_b.boost);
        }
        (Query::MultiMatch(child_a), Query::MultiMatch(child_b))
    }
}

fn slot_values<T: Clone, F: FeatureFactory<T>>(
    slot: &Option<F>,
    max_size: usize,
) -> Vec<Option<T>>
where
    T: PartialEq,
{
    match slot {
        Some(factory) => {
            let values = factory.permute(max_size);
            if values.is_empty() {
                vec![None]
            } else {
                values.into_iter().map(Some).collect()
            }
        }
        None => vec![None],
    }
}

/// Drives experiment generation from a declared feature space.
///
/// Owns the monotonic counter that synthesizes unique names for one
/// generation run (not required to survive restarts).
#[derive(Debug, Deserialize)]
pub struct ExperimentFactory {
    pub servers: ServerConnectionFeatureFactory,
    #[serde(default)]
    pub custom_handlers: Option<CustomHandlerFactory>,
    pub query: QueryFactory,
    #[serde(default)]
    pub scorers: Vec<Scorer>,
    #[serde(default)]
    pub filter_queries: Vec<Query>,
    #[serde(skip)]
    counter: u64,
}

impl ExperimentFactory {
    pub fn from_json(json: &str) -> Result<Self> {
        let factory: ExperimentFactory = serde_json::from_str(json)?;
        if factory.servers.connections.is_empty() {
            return Err(QuerytuneError::InvalidConfiguration(
                "at least one server connection is required".to_string(),
            ));
        }
        Ok(factory)
    }

    fn next_name(&mut self) -> String {
        let name = format!("experiment_{}", self.counter);
        self.counter += 1;
        name
    }

    fn handler_slot(&self, max_size: usize) -> Vec<Option<CustomHandler>> {
        match &self.custom_handlers {
            Some(factory) => factory.permute(max_size).into_iter().map(Some).collect(),
            None => vec![None],
        }
    }

    /// Full-combination generation: cartesian over (server x query x
    /// handler), bounded by `max_experiments`.
    pub fn permute(&mut self, max_experiments: usize) -> Result<ExperimentSet> {
        let mut set = ExperimentSet::new(self.scorers.clone());
        let servers = self.servers.permute(max_experiments);
        let handlers = self.handler_slot(max_experiments);
        for server in &servers {
            for query in self.query.permute(max_experiments) {
                for handler in &handlers {
                    if set.len() >= max_experiments {
                        return Ok(set);
                    }
                    let experiment = Experiment::new(
                        self.next_name(),
                        server.clone(),
                        handler.clone(),
                        query.clone(),
                    )
                    .with_filter_queries(self.filter_queries.clone());
                    set.add_experiment(experiment)?;
                }
            }
        }
        Ok(set)
    }

    /// One experiment with every top-level feature group drawn independently
    /// at random.
    pub fn random_experiment(&self, name: impl Into<String>) -> Experiment {
        let handler = self.custom_handlers.as_ref().map(|f| f.random());
        Experiment::new(name, self.servers.random(), handler, self.query.random())
            .with_filter_queries(self.filter_queries.clone())
    }

    /// Swap top-level feature groups independently per group with 50%
    /// probability. Children never alias parent state.
    pub fn crossover(&self, parent_a: &Experiment, parent_b: &Experiment) -> (Experiment, Experiment) {
        let mut rng = rand::thread_rng();
        let (mut server_a, mut server_b) = (parent_a.server.clone(), parent_b.server.clone());
        if rng.gen::<f32>() < 0.5 {
            std::mem::swap(&mut server_a, &mut server_b);
        }
        let (mut handler_a, mut handler_b) = (
            parent_a.custom_handler.clone(),
            parent_b.custom_handler.clone(),
        );
        if rng.gen::<f32>() < 0.5 {
            std::mem::swap(&mut handler_a, &mut handler_b);
        }
        let (query_a, query_b) = self.query.crossover(&parent_a.query, &parent_b.query);

        let child_a = Experiment::new("child_a", server_a, handler_a, query_a)
            .with_filter_queries(self.filter_queries.clone());
        let child_b = Experiment::new("child_b", server_b, handler_b, query_b)
            .with_filter_queries(self.filter_queries.clone());
        (child_a, child_b)
    }

    /// Deep-copy, then re-roll each top-level feature group with probability
    /// `probability` (each group's factory applies `amplitude` its own way).
    pub fn mutate(&self, parent: &Experiment, probability: f32, amplitude: f32) -> Experiment {
        let mut mutated = parent.clone();
        mutated.server = self.servers.mutate(&parent.server, probability, amplitude);
        if let (Some(factory), Some(handler)) =
            (&self.custom_handlers, &parent.custom_handler)
        {
            mutated.custom_handler = Some(factory.mutate(handler, probability, amplitude));
        }
        mutated.query = self.query.mutate(&parent.query, probability, amplitude);
        mutated.filter_queries = self.filter_queries.clone();
        mutated
    }

    /// The scorer that drives experiment ranking during tuning. Exactly one
    /// may carry the flag; with none flagged the first scorer is the default.
    pub fn train_scorer(&self) -> Result<&Scorer> {
        crate::experiment::select_scorer(&self.scorers, |s| s.use_for_train, "train")
    }

    /// The scorer that drives ranking when reporting a held-out test set.
    pub fn test_scorer(&self) -> Result<&Scorer> {
        crate::experiment::select_scorer(&self.scorers, |s| s.use_for_test, "test")
    }
}
