//! Experiment execution: a per-experiment worker pool that searches, scores,
//! and persists results, then aggregates per query set.

pub mod validate;

use crate::config::RunnerConfig;
use crate::db::experiment_db::{ExperimentDB, ScoreRow};
use crate::error::{QuerytuneError, Result};
use crate::experiment::Experiment;
use crate::judgments::{JudgmentList, Judgments};
use crate::scorers::{ScoreAccumulator, Scorer};
use crate::search::{QueryRequest, SearchClient, SearchClientFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub use validate::validate_judgments;

/// Lifecycle of one experiment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Validating,
    Running,
    Aggregating,
    Done,
    /// Scores already existed and the run was not forced.
    Skipped,
}

/// What one [`ExperimentRunner::run_experiment`] call did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: RunState,
    pub queries_scored: usize,
    pub elapsed: Duration,
}

/// Work queue entry. One poison per worker terminates the pool; the queue is
/// filled completely before any worker starts, so a pop never blocks.
enum WorkItem {
    Job(Box<Judgments>),
    Poison,
}

/// Runs experiments one at a time, fanning each one's queries out over a
/// fixed pool of workers. Each worker owns its client, accumulator, and
/// batched writer; nothing is shared but the queue.
pub struct ExperimentRunner<F: SearchClientFactory> {
    factory: Arc<F>,
    store: ExperimentDB,
    config: RunnerConfig,
    /// Judgments validated per (server url, judgment list); experiments
    /// against the same server and list reuse the filtered list instead of
    /// re-probing the index.
    validated: HashMap<(String, u64), JudgmentList>,
}

/// Stable identity for a judgment list so the validation cache never hands
/// back a list validated from different input.
fn judgment_fingerprint(judgments: &JudgmentList) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for j in &judgments.judgments {
        j.query_info.hash(&mut hasher);
        for (id, grade) in &j.judgments {
            id.hash(&mut hasher);
            grade.to_bits().hash(&mut hasher);
        }
    }
    hasher.finish()
}

impl<F: SearchClientFactory> ExperimentRunner<F> {
    pub fn new(factory: F, store: ExperimentDB, config: RunnerConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            store,
            config,
            validated: HashMap::new(),
        }
    }

    pub fn store(&self) -> &ExperimentDB {
        &self.store
    }

    /// Score one experiment against the judgment list.
    ///
    /// `num_results` is the search depth (the deepest `at_n` any scorer
    /// needs). Existing scores cause a skip unless `force` is set, in which
    /// case they are cleared and recomputed.
    pub async fn run_experiment(
        &mut self,
        experiment: &Experiment,
        scorers: &[Scorer],
        judgments: &JudgmentList,
        num_results: usize,
        force: bool,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let mut state = RunState::NotStarted;
        log::debug!("experiment {}: {:?}", experiment.name, state);

        if self.store.has_scores(&experiment.name).await? {
            if !force {
                log::info!(
                    "experiment {} already has scores, skipping (use a fresh start to re-run)",
                    experiment.name
                );
                return Ok(RunSummary {
                    state: RunState::Skipped,
                    queries_scored: 0,
                    elapsed: start.elapsed(),
                });
            }
            self.store.clear_scores_for(&experiment.name).await?;
        }

        state = RunState::Validating;
        log::debug!("experiment {}: {:?}", experiment.name, state);
        let judgments = self.validated_judgments(experiment, judgments).await?;
        if judgments.is_empty() {
            return Err(QuerytuneError::InvalidInput(
                "no judged queries survived validation".to_string(),
            ));
        }

        state = RunState::Running;
        log::debug!("experiment {}: {:?}", experiment.name, state);
        let accumulator = self
            .run_workers(experiment, scorers, &judgments, num_results)
            .await?;

        state = RunState::Aggregating;
        log::debug!("experiment {}: {:?}", experiment.name, state);
        let queries_scored = self
            .aggregate(experiment, scorers, &judgments, &accumulator)
            .await?;

        let elapsed = start.elapsed();
        log::info!(
            "experiment {}: scored {} queries in {:.1}s",
            experiment.name,
            queries_scored,
            elapsed.as_secs_f64()
        );
        Ok(RunSummary {
            state: RunState::Done,
            queries_scored,
            elapsed,
        })
    }

    async fn validated_judgments(
        &mut self,
        experiment: &Experiment,
        judgments: &JudgmentList,
    ) -> Result<JudgmentList> {
        let key = (experiment.server.url.clone(), judgment_fingerprint(judgments));
        if let Some(cached) = self.validated.get(&key) {
            return Ok(cached.clone());
        }
        let client = self.factory.create(&experiment.server)?;
        let id_field = self.id_field(&client);
        let validated =
            validate_judgments(&client, judgments, &id_field, self.config.sleep_ms).await?;
        self.validated.insert(key, validated.clone());
        Ok(validated)
    }

    fn id_field(&self, client: &F::Client) -> String {
        if self.config.id_field.is_empty() {
            client.default_id_field().to_string()
        } else {
            self.config.id_field.clone()
        }
    }

    async fn run_workers(
        &self,
        experiment: &Experiment,
        scorers: &[Scorer],
        judgments: &JudgmentList,
        num_results: usize,
    ) -> Result<ScoreAccumulator> {
        let mut queue = VecDeque::with_capacity(judgments.len() + self.config.num_threads);
        for j in &judgments.judgments {
            queue.push_back(WorkItem::Job(Box::new(j.clone())));
        }
        for _ in 0..self.config.num_threads {
            queue.push_back(WorkItem::Poison);
        }
        let queue = Arc::new(Mutex::new(queue));

        let experiment = Arc::new(experiment.clone());
        let scorers: Arc<Vec<Scorer>> = Arc::new(scorers.to_vec());
        let mut handles = Vec::with_capacity(self.config.num_threads);
        for worker_id in 0..self.config.num_threads {
            let ctx = WorkerContext {
                factory: Arc::clone(&self.factory),
                experiment: Arc::clone(&experiment),
                scorers: Arc::clone(&scorers),
                queue: Arc::clone(&queue),
                writer_source: self.store.clone(),
                id_field: self.config.id_field.clone(),
                num_results,
                sleep_ms: self.config.sleep_ms,
                retries: self.config.retries,
            };
            handles.push(tokio::spawn(async move { run_worker(worker_id, ctx).await }));
        }

        let mut merged = ScoreAccumulator::default();
        let mut succeeded = 0usize;
        for handle in handles {
            match handle.await {
                Ok(Ok(accumulator)) => {
                    merged.merge(accumulator);
                    succeeded += 1;
                }
                // a failed score write means partial persisted data; abort
                // this experiment rather than aggregate over it
                Ok(Err(e @ QuerytuneError::Database(_))) => return Err(e),
                Ok(Err(e)) => log::error!("worker failed: {}", e),
                Err(e) => log::error!("worker panicked: {}", e),
            }
        }
        if succeeded == 0 {
            return Err(QuerytuneError::Experiment(format!(
                "every worker failed for experiment {}",
                experiment.name
            )));
        }
        Ok(merged)
    }

    async fn aggregate(
        &self,
        experiment: &Experiment,
        scorers: &[Scorer],
        judgments: &JudgmentList,
        accumulator: &ScoreAccumulator,
    ) -> Result<usize> {
        // each named set, plus a combined row under the unnamed set
        let mut sets = judgments.query_sets();
        sets.push(String::new());
        for set in &sets {
            let mut values: Vec<(String, f64)> = Vec::new();
            for scorer in scorers {
                let scores = accumulator.scores_for(&scorer.name(), set);
                if scores.is_empty() {
                    continue;
                }
                values.extend(scorer.aggregate(&scores));
            }
            if !values.is_empty() {
                self.store
                    .insert_aggregated(&experiment.name, set, &values)
                    .await?;
            }
        }
        let queries_scored = scorers
            .first()
            .map(|s| accumulator.query_count(&s.name()))
            .unwrap_or(0);
        Ok(queries_scored)
    }
}

struct WorkerContext<F: SearchClientFactory> {
    factory: Arc<F>,
    experiment: Arc<Experiment>,
    scorers: Arc<Vec<Scorer>>,
    queue: Arc<Mutex<VecDeque<WorkItem>>>,
    writer_source: ExperimentDB,
    id_field: String,
    num_results: usize,
    sleep_ms: u64,
    retries: usize,
}

async fn run_worker<F: SearchClientFactory>(
    worker_id: usize,
    ctx: WorkerContext<F>,
) -> Result<ScoreAccumulator> {
    let client = ctx.factory.create(&ctx.experiment.server)?;
    let id_field = if ctx.id_field.is_empty() {
        client.default_id_field().to_string()
    } else {
        ctx.id_field.clone()
    };
    let mut accumulator = ScoreAccumulator::default();
    let mut writer = ctx.writer_source.batch_writer();

    loop {
        let item = ctx.queue.lock().await.pop_front();
        let judgments = match item {
            Some(WorkItem::Job(j)) => j,
            Some(WorkItem::Poison) | None => break,
        };
        if let Some(results) = search_with_retries(&client, &ctx, &judgments, &id_field).await {
            let mut scores = Vec::with_capacity(ctx.scorers.len());
            for scorer in ctx.scorers.iter() {
                let score = if scorer.needs_judgments() {
                    scorer.score_judged(&judgments, &results)
                } else {
                    scorer.score_result_set(&results)
                };
                accumulator.record(&scorer.name(), &judgments.query_info, score);
                scores.push(score);
            }
            let results_json = serde_json::to_string(&results.minimized())?;
            writer
                .add(ScoreRow {
                    query_info: judgments.query_info.clone(),
                    experiment: ctx.experiment.name.clone(),
                    scores,
                    results_json: Some(results_json),
                })
                .await?;
        }
        if ctx.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(ctx.sleep_ms)).await;
        }
    }

    writer.flush().await?;
    log::debug!("worker {} finished", worker_id);
    Ok(accumulator)
}

/// Search one judged query, retrying on transient failures. Returns `None`
/// when the retry budget runs out; the query is skipped, not fatal.
async fn search_with_retries<F: SearchClientFactory>(
    client: &F::Client,
    ctx: &WorkerContext<F>,
    judgments: &Judgments,
    id_field: &str,
) -> Option<crate::search::SearchResultSet> {
    let mut query = ctx.experiment.query.clone();
    query.set_query_strings(judgments.query_strings());
    let mut request = QueryRequest::new(query, ctx.experiment.custom_handler.clone(), id_field);
    request.num_results = ctx.num_results;
    request.filter_queries = ctx.experiment.filter_queries.clone();

    let mut attempt = 0;
    loop {
        match client.search(&request).await {
            Ok(results) => return Some(results),
            Err(e) if attempt < ctx.retries => {
                attempt += 1;
                log::warn!(
                    "search failed for query {} (attempt {} of {}): {}",
                    judgments.query_info.query_id,
                    attempt,
                    ctx.retries,
                    e
                );
            }
            Err(e) => {
                log::warn!(
                    "skipping query {} after {} retries: {}",
                    judgments.query_info.query_id,
                    ctx.retries,
                    e
                );
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::features::{FieldWeights, ServerConnection, WeightedField};
    use crate::judgments::QueryInfo;
    use crate::queries::{MultiMatchQuery, Query, QueryStrings, TermsQuery};
    use crate::scorers::Metric;
    use crate::search::{SearchResultSet, StoredDocument};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Canned backend: fixed ranking per query text, knows every ranked id.
    #[derive(Clone)]
    struct CannedSearch {
        rankings: HashMap<String, Vec<String>>,
        failures_before_success: Arc<AtomicUsize>,
    }

    impl CannedSearch {
        fn new(rankings: &[(&str, &[&str])]) -> Self {
            Self {
                rankings: rankings
                    .iter()
                    .map(|(q, ids)| {
                        (
                            q.to_string(),
                            ids.iter().map(|s| s.to_string()).collect(),
                        )
                    })
                    .collect(),
                failures_before_success: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn all_ids(&self) -> HashSet<&str> {
            self.rankings
                .values()
                .flat_map(|ids| ids.iter().map(|s| s.as_str()))
                .collect()
        }
    }

    impl SearchClient for CannedSearch {
        async fn search(&self, request: &QueryRequest) -> Result<SearchResultSet> {
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(QuerytuneError::SearchClient("transient".to_string()));
            }
            let ids: Vec<String> = match &request.query {
                Query::Terms(TermsQuery { values, .. }) => values
                    .iter()
                    .filter(|v| self.all_ids().contains(v.as_str()))
                    .cloned()
                    .collect(),
                Query::MultiMatch(mm) => self
                    .rankings
                    .get(&mm.query_string)
                    .cloned()
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let documents = ids
                .into_iter()
                .take(request.num_results)
                .map(StoredDocument::new)
                .collect::<Vec<_>>();
            Ok(SearchResultSet {
                total_hits: documents.len() as u64,
                query_time_ms: 0,
                elapsed_ms: 0,
                documents,
            })
        }

        async fn analyze(&self, _field: &str, _text: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get_docs(
            &self,
            _id_field: &str,
            _ids: &[String],
            _include: &[String],
            _exclude: &[String],
        ) -> Result<Vec<StoredDocument>> {
            Ok(Vec::new())
        }

        fn default_id_field(&self) -> &str {
            "_id"
        }
    }

    struct CannedFactory(CannedSearch);

    impl SearchClientFactory for CannedFactory {
        type Client = CannedSearch;

        fn create(&self, _server: &ServerConnection) -> Result<CannedSearch> {
            Ok(self.0.clone())
        }
    }

    fn experiment() -> Experiment {
        Experiment::new(
            "e1",
            ServerConnection::new("http://localhost:9200/idx"),
            None,
            Query::MultiMatch(MultiMatchQuery::new(FieldWeights(vec![WeightedField::new(
                "title", 1.0,
            )]))),
        )
    }

    fn scorers() -> Vec<Scorer> {
        vec![
            Scorer::new(Metric::Ndcg { at_n: 10 }),
            Scorer::new(Metric::ResultCount { at_n: 10 }),
        ]
    }

    fn judged(query_id: &str, text: &str, ids: &[&str]) -> Judgments {
        let mut j = Judgments::new(QueryInfo::new(query_id, QueryStrings::single(text)));
        for id in ids {
            j.add_judgment(*id, 1.0);
        }
        j
    }

    fn config(num_threads: usize) -> RunnerConfig {
        RunnerConfig {
            num_threads,
            sleep_ms: 0,
            retries: 2,
            id_field: String::new(),
        }
    }

    async fn store(dir: &TempDir) -> ExperimentDB {
        ExperimentDB::open(Db::new(dir.path().join("scores.db")), &scorers(), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn end_to_end_scores_and_aggregates() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let backend = CannedSearch::new(&[
            ("shoes", &["s1", "s2"] as &[&str]),
            ("boots", &["b1"]),
        ]);
        let mut runner = ExperimentRunner::new(CannedFactory(backend), store.clone(), config(2));

        let mut list = JudgmentList::default();
        list.add(judged("q1", "shoes", &["s1", "s2"]));
        list.add(judged("q2", "boots", &["b1"]));

        let summary = runner
            .run_experiment(&experiment(), &scorers(), &list, 10, false)
            .await
            .unwrap();
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.queries_scored, 2);

        let scores = store.get_scores("", "e1", "ndcg_10").await.unwrap();
        assert_eq!(scores.len(), 2);
        // both result sets are in ideal order
        assert!((scores["q1"] - 1.0).abs() < 1e-9);
        assert!((scores["q2"] - 1.0).abs() < 1e-9);

        let rows = store.aggregated_rows("", "ndcg_10_mean").await.unwrap();
        assert_eq!(rows.len(), 1);
        let (_, mean) = rows[0]
            .values
            .iter()
            .find(|(c, _)| c == "ndcg_10_mean")
            .unwrap();
        assert!((mean - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn existing_scores_skip_unless_forced() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let backend = CannedSearch::new(&[("shoes", &["s1"] as &[&str])]);
        let mut runner = ExperimentRunner::new(CannedFactory(backend), store, config(1));

        let mut list = JudgmentList::default();
        list.add(judged("q1", "shoes", &["s1"]));

        let first = runner
            .run_experiment(&experiment(), &scorers(), &list, 10, false)
            .await
            .unwrap();
        assert_eq!(first.state, RunState::Done);

        let second = runner
            .run_experiment(&experiment(), &scorers(), &list, 10, false)
            .await
            .unwrap();
        assert_eq!(second.state, RunState::Skipped);

        let forced = runner
            .run_experiment(&experiment(), &scorers(), &list, 10, true)
            .await
            .unwrap();
        assert_eq!(forced.state, RunState::Done);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let backend = CannedSearch::new(&[("shoes", &["s1"] as &[&str])]);
        // validation issues one search; the scoring search then fails once
        backend.failures_before_success.store(0, Ordering::SeqCst);
        let mut runner =
            ExperimentRunner::new(CannedFactory(backend.clone()), store.clone(), config(1));

        let mut list = JudgmentList::default();
        list.add(judged("q1", "shoes", &["s1"]));

        // prime the validation cache so the failure hits the scoring search
        runner
            .run_experiment(&experiment(), &scorers(), &list, 10, false)
            .await
            .unwrap();
        store.clear_scores_for("e1").await.unwrap();
        backend.failures_before_success.store(2, Ordering::SeqCst);

        let summary = runner
            .run_experiment(&experiment(), &scorers(), &list, 10, true)
            .await
            .unwrap();
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.queries_scored, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_skip_the_query() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let backend = CannedSearch::new(&[
            ("shoes", &["s1"] as &[&str]),
            ("boots", &["b1"]),
        ]);
        let mut runner =
            ExperimentRunner::new(CannedFactory(backend.clone()), store.clone(), config(1));

        let mut list = JudgmentList::default();
        list.add(judged("q1", "shoes", &["s1"]));
        list.add(judged("q2", "boots", &["b1"]));

        // prime validation, then make more failures than one query's budget
        runner
            .run_experiment(&experiment(), &scorers(), &list, 10, false)
            .await
            .unwrap();
        store.clear_scores_for("e1").await.unwrap();
        backend.failures_before_success.store(3, Ordering::SeqCst);

        let summary = runner
            .run_experiment(&experiment(), &scorers(), &list, 10, true)
            .await
            .unwrap();
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.queries_scored, 1);
    }

    #[tokio::test]
    async fn validation_cache_reused_across_experiments() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let backend = CannedSearch::new(&[("shoes", &["s1"] as &[&str])]);
        let mut runner = ExperimentRunner::new(CannedFactory(backend), store, config(1));

        let mut list = JudgmentList::default();
        list.add(judged("q1", "shoes", &["s1", "ghost"]));

        runner
            .run_experiment(&experiment(), &scorers(), &list, 10, false)
            .await
            .unwrap();
        assert_eq!(runner.validated.len(), 1);
        let cached = runner.validated.values().next().unwrap();
        assert!(!cached.judgments[0].contains_judgment("ghost"));

        let mut second = experiment();
        second.name = "e2".to_string();
        runner
            .run_experiment(&second, &scorers(), &list, 10, false)
            .await
            .unwrap();
        assert_eq!(runner.validated.len(), 1);
    }

    #[tokio::test]
    async fn validation_cache_is_per_judgment_list() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let backend = CannedSearch::new(&[
            ("shoes", &["s1"] as &[&str]),
            ("boots", &["b1"]),
        ]);
        let mut runner = ExperimentRunner::new(CannedFactory(backend), store.clone(), config(1));

        let mut list_a = JudgmentList::default();
        list_a.add(judged("q1", "shoes", &["s1"]));
        runner
            .run_experiment(&experiment(), &scorers(), &list_a, 10, false)
            .await
            .unwrap();

        // same server, different judgment list: must be validated and scored
        // on its own, not served from the first list's cache entry
        let mut list_b = JudgmentList::default();
        list_b.add(judged("q2", "boots", &["b1"]));
        let mut second = experiment();
        second.name = "e2".to_string();
        runner
            .run_experiment(&second, &scorers(), &list_b, 10, false)
            .await
            .unwrap();

        assert_eq!(runner.validated.len(), 2);
        let scores = store.get_scores("", "e2", "ndcg_10").await.unwrap();
        assert_eq!(scores.keys().collect::<Vec<_>>(), vec!["q2"]);
    }
}
