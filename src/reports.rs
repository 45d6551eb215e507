//! CSV report generation from persisted scores: the aggregated leaderboard,
//! per-query scores, and pairwise significance matrices.

use crate::db::experiment_db::ExperimentDB;
use crate::error::Result;
use crate::scorers::Scorer;
use crate::stats::{self, INVALID_P_VALUE};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Writes every configured report under one directory.
pub struct ReportWriter<'a> {
    store: &'a ExperimentDB,
    dir: PathBuf,
    /// Significance matrices are O(n^2) in experiments; past this many
    /// columns the matrix is truncated to the top performers.
    max_matrix_cols: usize,
}

impl<'a> ReportWriter<'a> {
    pub fn new(store: &'a ExperimentDB, dir: impl AsRef<Path>, max_matrix_cols: usize) -> Self {
        Self {
            store,
            dir: dir.as_ref().to_path_buf(),
            max_matrix_cols,
        }
    }

    /// Write all reports, ranking experiments by `sort_scorer`. Returns the
    /// paths written.
    pub async fn dump(&self, scorers: &[Scorer], sort_scorer: &Scorer) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.dir)?;
        let mut written = Vec::new();
        written.push(self.write_aggregated(sort_scorer).await?);
        written.push(self.write_per_query().await?);
        for scorer in scorers {
            if !scorer.export_p_matrix {
                continue;
            }
            let mut sets = self.store.query_sets().await?;
            sets.push(String::new());
            for set in sets {
                written.push(self.write_significance_matrix(scorer, &set).await?);
            }
        }
        Ok(written)
    }

    /// Leaderboard: one row per (experiment, query set), best first.
    async fn write_aggregated(&self, sort_scorer: &Scorer) -> Result<PathBuf> {
        let sort_column = sort_scorer.primary_statistic();
        let mut out = String::new();
        let mut header = vec!["experiment".to_string(), "query_set".to_string()];
        header.extend(self.store.aggregated_columns().iter().cloned());
        write_row(&mut out, &header);

        let mut sets = self.store.query_sets().await?;
        sets.push(String::new());
        for set in &sets {
            for row in self.store.aggregated_rows(set, &sort_column).await? {
                let values: HashMap<&str, f64> = row
                    .values
                    .iter()
                    .map(|(c, v)| (c.as_str(), *v))
                    .collect();
                let mut cells = vec![row.experiment.clone(), row.query_set.clone()];
                for column in self.store.aggregated_columns() {
                    cells.push(
                        values
                            .get(column.as_str())
                            .map(|v| format!("{:.4}", v))
                            .unwrap_or_default(),
                    );
                }
                write_row(&mut out, &cells);
            }
        }
        let path = self.dir.join("scores_aggregated.csv");
        std::fs::write(&path, out)?;
        Ok(path)
    }

    async fn write_per_query(&self) -> Result<PathBuf> {
        let mut out = String::new();
        let mut header = vec![
            "query_id".to_string(),
            "query_set".to_string(),
            "query_count".to_string(),
            "experiment".to_string(),
        ];
        header.extend(self.store.scorer_columns().iter().cloned());
        write_row(&mut out, &header);
        for row in self.store.per_query_rows().await? {
            let mut cells = vec![
                row.query_id,
                row.query_set,
                row.query_count.to_string(),
                row.experiment,
            ];
            cells.extend(row.scores.iter().map(|s| format!("{:.4}", s)));
            write_row(&mut out, &cells);
        }
        let path = self.dir.join("per_query_scores.csv");
        std::fs::write(&path, out)?;
        Ok(path)
    }

    /// Upper-triangular matrix of paired two-sided p-values between
    /// experiments, best-ranked first. The diagonal is 1.0 (an experiment
    /// against itself); cells below the diagonal are left empty.
    async fn write_significance_matrix(&self, scorer: &Scorer, query_set: &str) -> Result<PathBuf> {
        let sort_column = scorer.primary_statistic();
        let mut experiments: Vec<String> = self
            .store
            .aggregated_rows(query_set, &sort_column)
            .await?
            .into_iter()
            .map(|r| r.experiment)
            .collect();
        if experiments.len() > self.max_matrix_cols {
            log::info!(
                "truncating {} significance matrix to the top {} of {} experiments",
                scorer.name(),
                self.max_matrix_cols,
                experiments.len()
            );
            experiments.truncate(self.max_matrix_cols);
        }

        let mut per_experiment: Vec<HashMap<String, f64>> =
            Vec::with_capacity(experiments.len());
        for experiment in &experiments {
            per_experiment.push(
                self.store
                    .get_scores(query_set, experiment, &scorer.name())
                    .await?,
            );
        }

        let mut out = String::new();
        let mut header = vec!["experiment".to_string()];
        header.extend(experiments.iter().cloned());
        write_row(&mut out, &header);
        for (i, row_experiment) in experiments.iter().enumerate() {
            let mut cells = vec![row_experiment.clone()];
            for j in 0..experiments.len() {
                if j < i {
                    cells.push(String::new());
                } else if j == i {
                    cells.push("1.0000".to_string());
                } else {
                    let p = paired_p_value(&per_experiment[i], &per_experiment[j]);
                    cells.push(format!("{:.4}", p));
                }
            }
            write_row(&mut out, &cells);
        }

        let file_name = if query_set.is_empty() {
            format!("sig_diffs_{}.csv", scorer.name())
        } else {
            format!("sig_diffs_{}_{}.csv", scorer.name(), query_set)
        };
        let path = self.dir.join(file_name);
        std::fs::write(&path, out)?;
        Ok(path)
    }
}

/// Pair scores by query id and run the paired two-sided t-test. Error
/// sentinels clamp to 0 so an unscorable query counts as a zero, not as a
/// negative observation.
fn paired_p_value(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    if a.len() != b.len() {
        log::warn!(
            "mismatched query counts in significance pairing: {} vs {}",
            a.len(),
            b.len()
        );
    }
    let mut paired_a = Vec::new();
    let mut paired_b = Vec::new();
    let mut ids: Vec<&String> = a.keys().collect();
    ids.sort();
    for id in ids {
        if let Some(vb) = b.get(id) {
            paired_a.push(a[id].max(0.0));
            paired_b.push(vb.max(0.0));
        }
    }
    if paired_a.len() < 2 {
        return INVALID_P_VALUE;
    }
    stats::paired_t_test(&paired_a, &paired_b)
}

fn write_row(out: &mut String, cells: &[String]) {
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}", escape(cell));
    }
    out.push('\n');
}

/// Quote a cell containing a comma, quote, or line break; double embedded
/// quotes.
fn escape(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') || cell.contains('\r') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::experiment_db::ScoreRow;
    use crate::db::Db;
    use crate::judgments::QueryInfo;
    use crate::queries::QueryStrings;
    use crate::scorers::Metric;
    use tempfile::TempDir;

    fn scorers() -> Vec<Scorer> {
        let mut ndcg = Scorer::new(Metric::Ndcg { at_n: 10 });
        ndcg.use_for_train = true;
        ndcg.export_p_matrix = true;
        vec![ndcg]
    }

    async fn seeded_store(dir: &TempDir) -> ExperimentDB {
        let store = ExperimentDB::open(Db::new(dir.path().join("scores.db")), &scorers(), false)
            .await
            .unwrap();
        let mut writer = store.batch_writer();
        let rows = [
            ("q1", "good", 0.9),
            ("q2", "good", 0.8),
            ("q3", "good", 0.95),
            ("q1", "bad", 0.2),
            ("q2", "bad", 0.1),
            ("q3", "bad", 0.3),
        ];
        for (query_id, experiment, score) in rows {
            writer
                .add(ScoreRow {
                    query_info: QueryInfo::new(query_id, QueryStrings::single(query_id)),
                    experiment: experiment.to_string(),
                    scores: vec![score],
                    results_json: None,
                })
                .await
                .unwrap();
        }
        writer.flush().await.unwrap();
        for (experiment, mean) in [("good", 0.8833), ("bad", 0.2)] {
            store
                .insert_aggregated(experiment, "", &[("ndcg_10_mean".to_string(), mean)])
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn aggregated_report_orders_best_first() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let writer = ReportWriter::new(&store, dir.path().join("reports"), 100);
        let scorers = scorers();
        writer.dump(&scorers, &scorers[0]).await.unwrap();

        let csv =
            std::fs::read_to_string(dir.path().join("reports/scores_aggregated.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert!(lines[0].starts_with("experiment,query_set,ndcg_10_mean"));
        assert!(lines[1].starts_with("good,"));
        assert!(lines[2].starts_with("bad,"));
    }

    #[tokio::test]
    async fn per_query_report_lists_every_row() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let writer = ReportWriter::new(&store, dir.path().join("reports"), 100);
        let scorers = scorers();
        writer.dump(&scorers, &scorers[0]).await.unwrap();

        let csv =
            std::fs::read_to_string(dir.path().join("reports/per_query_scores.csv")).unwrap();
        // header plus 6 score rows
        assert_eq!(csv.lines().count(), 7);
        assert!(csv.lines().any(|l| l.starts_with("q1,,1,good,0.9000")));
    }

    #[tokio::test]
    async fn significance_matrix_shape() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let writer = ReportWriter::new(&store, dir.path().join("reports"), 100);
        let scorers = scorers();
        writer.dump(&scorers, &scorers[0]).await.unwrap();

        let csv =
            std::fs::read_to_string(dir.path().join("reports/sig_diffs_ndcg_10.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "experiment,good,bad");
        let row_good: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(row_good[0], "good");
        assert_eq!(row_good[1], "1.0000");
        let p: f64 = row_good[2].parse().unwrap();
        assert!((0.0..=1.0).contains(&p));
        // below the diagonal stays empty
        let row_bad: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(row_bad[1], "");
        assert_eq!(row_bad[2], "1.0000");
    }

    #[tokio::test]
    async fn matrix_caps_at_max_cols() {
        let dir = TempDir::new().unwrap();
        let store = ExperimentDB::open(Db::new(dir.path().join("scores.db")), &scorers(), false)
            .await
            .unwrap();
        let mut writer = store.batch_writer();
        for i in 0..5 {
            let experiment = format!("e{}", i);
            for q in ["q1", "q2"] {
                writer
                    .add(ScoreRow {
                        query_info: QueryInfo::new(q, QueryStrings::single(q)),
                        experiment: experiment.clone(),
                        scores: vec![0.1 * i as f64],
                        results_json: None,
                    })
                    .await
                    .unwrap();
            }
            store
                .insert_aggregated(&experiment, "", &[("ndcg_10_mean".to_string(), 0.1 * i as f64)])
                .await
                .unwrap();
        }
        writer.flush().await.unwrap();

        let report = ReportWriter::new(&store, dir.path().join("reports"), 3);
        let scorers = scorers();
        report.dump(&scorers, &scorers[0]).await.unwrap();
        let csv =
            std::fs::read_to_string(dir.path().join("reports/sig_diffs_ndcg_10.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        // header + 3 experiment rows, best (e4) first
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("e4,"));
    }

    #[test]
    fn csv_escaping() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape("line\nbreak"), "\"line\nbreak\"");
        assert_eq!(escape("cr\rhere"), "\"cr\rhere\"");
    }

    #[test]
    fn identical_scores_give_p_one() {
        let a: HashMap<String, f64> =
            [("q1".to_string(), 0.5), ("q2".to_string(), 0.5)].into();
        let p = paired_p_value(&a, &a.clone());
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn too_few_pairs_is_invalid() {
        let a: HashMap<String, f64> = [("q1".to_string(), 0.5)].into();
        let b: HashMap<String, f64> = [("q1".to_string(), 0.9)].into();
        assert_eq!(paired_p_value(&a, &b), INVALID_P_VALUE);
    }
}
