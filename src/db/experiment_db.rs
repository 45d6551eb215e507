//! Persistent score store. One REAL column per configured scorer, so a run
//! with a different scorer set gets a fresh schema rather than a silent
//! partial write.

use crate::db::Db;
use crate::error::{QuerytuneError, Result};
use crate::judgments::QueryInfo;
use crate::scorers::Scorer;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use std::sync::Arc;

/// Rows buffered per writer before a transactional flush.
const BATCH_SIZE: usize = 100;

/// One per-query score record headed for the `scores` table.
#[derive(Debug, Clone)]
pub struct ScoreRow {
    pub query_info: QueryInfo,
    pub experiment: String,
    /// Aligned with the scorer columns the store was opened with.
    pub scores: Vec<f64>,
    /// Minimized result ids as JSON, kept for post-hoc inspection.
    pub results_json: Option<String>,
}

/// One row of the `scores_aggregated` table.
#[derive(Debug, Clone)]
pub struct AggregatedRow {
    pub experiment: String,
    pub query_set: String,
    /// (column, value), in the store's aggregated-column order.
    pub values: Vec<(String, f64)>,
}

/// Per-query row joined back out for reporting.
#[derive(Debug, Clone)]
pub struct PerQueryRow {
    pub query_id: String,
    pub query_set: String,
    pub query_count: i64,
    pub experiment: String,
    pub scores: Vec<f64>,
}

/// Score store over one SQLite file.
#[derive(Clone)]
pub struct ExperimentDB {
    db: Arc<Db>,
    scorer_columns: Vec<String>,
    aggregated_columns: Vec<String>,
}

impl ExperimentDB {
    /// Open (and if needed create) the score tables for this scorer set.
    ///
    /// `fresh_start` drops any existing rows; otherwise an existing schema
    /// that does not match the configured scorers is an error, since
    /// appending under a different scorer set would corrupt comparisons.
    pub async fn open(db: Db, scorers: &[Scorer], fresh_start: bool) -> Result<Self> {
        if scorers.is_empty() {
            return Err(QuerytuneError::InvalidConfiguration(
                "at least one scorer is required".to_string(),
            ));
        }
        let scorer_columns: Vec<String> = scorers.iter().map(|s| s.name()).collect();
        let aggregated_columns: Vec<String> = scorers
            .iter()
            .flat_map(|s| s.aggregated_columns())
            .collect();

        let store = Self {
            db: Arc::new(db),
            scorer_columns,
            aggregated_columns,
        };

        let columns = store.scorer_columns.clone();
        let agg_columns = store.aggregated_columns.clone();
        store
            .db
            .with_connection(move |conn| {
                if fresh_start {
                    conn.execute_batch(
                        "DROP TABLE IF EXISTS scores; \
                         DROP TABLE IF EXISTS search_results; \
                         DROP TABLE IF EXISTS scores_aggregated;",
                    )?;
                }
                create_tables(conn, &columns, &agg_columns)?;
                verify_columns(conn, "scores", &columns)?;
                verify_columns(conn, "scores_aggregated", &agg_columns)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    pub fn scorer_columns(&self) -> &[String] {
        &self.scorer_columns
    }

    pub fn aggregated_columns(&self) -> &[String] {
        &self.aggregated_columns
    }

    /// Whether any per-query scores exist for the named experiment.
    pub async fn has_scores(&self, experiment: &str) -> Result<bool> {
        let experiment = experiment.to_string();
        self.db
            .with_connection(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM scores WHERE experiment = ?1",
                    [&experiment],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    /// Drop one experiment's rows ahead of a re-run.
    pub async fn clear_scores_for(&self, experiment: &str) -> Result<()> {
        let experiment = experiment.to_string();
        self.db
            .with_connection(move |conn| {
                conn.execute("DELETE FROM scores WHERE experiment = ?1", [&experiment])?;
                conn.execute(
                    "DELETE FROM search_results WHERE experiment = ?1",
                    [&experiment],
                )?;
                conn.execute(
                    "DELETE FROM scores_aggregated WHERE experiment = ?1",
                    [&experiment],
                )?;
                Ok(())
            })
            .await
    }

    /// A buffered writer for one worker. Each writer batches independently;
    /// flush order across writers is irrelevant because (query, experiment)
    /// rows never collide.
    pub fn batch_writer(&self) -> ScoreBatchWriter {
        ScoreBatchWriter {
            db: Arc::clone(&self.db),
            insert_sql: self.score_insert_sql(),
            column_count: self.scorer_columns.len(),
            buffer: Vec::with_capacity(BATCH_SIZE),
        }
    }

    fn score_insert_sql(&self) -> String {
        let quoted: Vec<String> = self
            .scorer_columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        let placeholders: Vec<String> = (1..=(4 + quoted.len()))
            .map(|i| format!("?{}", i))
            .collect();
        format!(
            "INSERT OR REPLACE INTO scores (query_id, query_set, query_count, experiment, {}) VALUES ({})",
            quoted.join(", "),
            placeholders.join(", ")
        )
    }

    /// query_id -> score for one scorer, optionally restricted to a query
    /// set (empty set name means every query).
    pub async fn get_scores(
        &self,
        query_set: &str,
        experiment: &str,
        scorer_name: &str,
    ) -> Result<HashMap<String, f64>> {
        if !self.scorer_columns.iter().any(|c| c == scorer_name) {
            return Err(QuerytuneError::InvalidInput(format!(
                "unknown scorer column: {}",
                scorer_name
            )));
        }
        let sql = if query_set.is_empty() {
            format!(
                "SELECT query_id, \"{}\" FROM scores WHERE experiment = ?1",
                scorer_name
            )
        } else {
            format!(
                "SELECT query_id, \"{}\" FROM scores WHERE experiment = ?1 AND query_set = ?2",
                scorer_name
            )
        };
        let experiment = experiment.to_string();
        let query_set = query_set.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let params: Vec<&str> = if query_set.is_empty() {
                    vec![&experiment]
                } else {
                    vec![&experiment, &query_set]
                };
                let mut rows = stmt.query(params_from_iter(params))?;
                let mut out = HashMap::new();
                while let Some(row) = rows.next()? {
                    out.insert(row.get::<_, String>(0)?, row.get::<_, f64>(1)?);
                }
                Ok(out)
            })
            .await
    }

    /// Upsert one aggregated row; `values` are (column, value) pairs over the
    /// store's aggregated columns (missing columns persist as NULL).
    pub async fn insert_aggregated(
        &self,
        experiment: &str,
        query_set: &str,
        values: &[(String, f64)],
    ) -> Result<()> {
        for (column, _) in values {
            if !self.aggregated_columns.iter().any(|c| c == column) {
                return Err(QuerytuneError::InvalidInput(format!(
                    "unknown aggregated column: {}",
                    column
                )));
            }
        }
        let quoted: Vec<String> = values.iter().map(|(c, _)| format!("\"{}\"", c)).collect();
        let placeholders: Vec<String> = (3..(3 + values.len()))
            .map(|i| format!("?{}", i))
            .collect();
        let sql = format!(
            "INSERT OR REPLACE INTO scores_aggregated (experiment, query_set, {}) VALUES (?1, ?2, {})",
            quoted.join(", "),
            placeholders.join(", ")
        );
        let experiment = experiment.to_string();
        let query_set = query_set.to_string();
        let numbers: Vec<f64> = values.iter().map(|(_, v)| *v).collect();
        self.db
            .with_connection(move |conn| {
                let mut params: Vec<Value> = vec![Value::Text(experiment), Value::Text(query_set)];
                params.extend(numbers.into_iter().map(Value::Real));
                conn.execute(&sql, params_from_iter(params))?;
                Ok(())
            })
            .await
    }

    /// Aggregated rows for one query set, sorted descending by the named
    /// column (NULLs last).
    pub async fn aggregated_rows(
        &self,
        query_set: &str,
        sort_column: &str,
    ) -> Result<Vec<AggregatedRow>> {
        if !self.aggregated_columns.iter().any(|c| c == sort_column) {
            return Err(QuerytuneError::InvalidInput(format!(
                "unknown aggregated column: {}",
                sort_column
            )));
        }
        let quoted: Vec<String> = self
            .aggregated_columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        let sql = format!(
            "SELECT experiment, query_set, {} FROM scores_aggregated \
             WHERE query_set = ?1 ORDER BY \"{}\" DESC NULLS LAST, experiment ASC",
            quoted.join(", "),
            sort_column
        );
        let query_set = query_set.to_string();
        let columns = self.aggregated_columns.clone();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([&query_set])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut values = Vec::with_capacity(columns.len());
                    for (i, column) in columns.iter().enumerate() {
                        let value: Option<f64> = row.get(2 + i)?;
                        if let Some(v) = value {
                            values.push((column.clone(), v));
                        }
                    }
                    out.push(AggregatedRow {
                        experiment: row.get(0)?,
                        query_set: row.get(1)?,
                        values,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Every per-query row, ordered for stable report output.
    pub async fn per_query_rows(&self) -> Result<Vec<PerQueryRow>> {
        let quoted: Vec<String> = self
            .scorer_columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        let sql = format!(
            "SELECT query_id, query_set, query_count, experiment, {} FROM scores \
             ORDER BY experiment, query_set, query_id",
            quoted.join(", ")
        );
        let count = self.scorer_columns.len();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut scores = Vec::with_capacity(count);
                    for i in 0..count {
                        scores.push(row.get::<_, f64>(4 + i)?);
                    }
                    out.push(PerQueryRow {
                        query_id: row.get(0)?,
                        query_set: row.get(1)?,
                        query_count: row.get(2)?,
                        experiment: row.get(3)?,
                        scores,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Distinct named query sets present in the scores (excluding the
    /// unnamed set).
    pub async fn query_sets(&self) -> Result<Vec<String>> {
        self.db
            .with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT query_set FROM scores WHERE query_set != '' ORDER BY query_set",
                )?;
                let sets = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(sets)
            })
            .await
    }

    /// Distinct experiment names with persisted scores.
    pub async fn experiments(&self) -> Result<Vec<String>> {
        self.db
            .with_connection(|conn| {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT experiment FROM scores ORDER BY experiment")?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .await
    }
}

fn create_tables(conn: &Connection, columns: &[String], agg_columns: &[String]) -> Result<()> {
    let score_cols: Vec<String> = columns.iter().map(|c| format!("\"{}\" REAL", c)).collect();
    let agg_cols: Vec<String> = agg_columns
        .iter()
        .map(|c| format!("\"{}\" REAL", c))
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS scores (\
             query_id TEXT NOT NULL, \
             query_set TEXT NOT NULL DEFAULT '', \
             query_count INTEGER NOT NULL DEFAULT 1, \
             experiment TEXT NOT NULL, \
             {}, \
             PRIMARY KEY (query_id, query_set, experiment)); \
         CREATE TABLE IF NOT EXISTS search_results (\
             query_id TEXT NOT NULL, \
             experiment TEXT NOT NULL, \
             results TEXT NOT NULL, \
             PRIMARY KEY (query_id, experiment)); \
         CREATE TABLE IF NOT EXISTS scores_aggregated (\
             experiment TEXT NOT NULL, \
             query_set TEXT NOT NULL DEFAULT '', \
             {}, \
             PRIMARY KEY (experiment, query_set));",
        score_cols.join(", "),
        agg_cols.join(", ")
    ))?;
    Ok(())
}

fn verify_columns(conn: &Connection, table: &str, expected: &[String]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for column in expected {
        if !existing.iter().any(|c| c == column) {
            return Err(QuerytuneError::InvalidConfiguration(format!(
                "table {} is missing column {}; rerun with a fresh start or the original scorers",
                table, column
            )));
        }
    }
    Ok(())
}

/// Buffered, transactional writer for per-query scores.
///
/// Call [`flush`](Self::flush) before dropping; buffered rows do not write
/// themselves.
pub struct ScoreBatchWriter {
    db: Arc<Db>,
    insert_sql: String,
    column_count: usize,
    buffer: Vec<ScoreRow>,
}

impl ScoreBatchWriter {
    pub async fn add(&mut self, row: ScoreRow) -> Result<()> {
        if row.scores.len() != self.column_count {
            return Err(QuerytuneError::InvalidInput(format!(
                "expected {} scores per row, got {}",
                self.column_count,
                row.scores.len()
            )));
        }
        self.buffer.push(row);
        if self.buffer.len() >= BATCH_SIZE {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        let insert_sql = self.insert_sql.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut insert = tx.prepare(&insert_sql)?;
                    let mut insert_results = tx.prepare(
                        "INSERT OR REPLACE INTO search_results (query_id, experiment, results) \
                         VALUES (?1, ?2, ?3)",
                    )?;
                    for row in &rows {
                        let mut params: Vec<Value> = vec![
                            Value::Text(row.query_info.query_id.clone()),
                            Value::Text(row.query_info.query_set.clone()),
                            Value::Integer(row.query_info.query_count),
                            Value::Text(row.experiment.clone()),
                        ];
                        params.extend(row.scores.iter().map(|s| Value::Real(*s)));
                        insert.execute(params_from_iter(params))?;
                        if let Some(json) = &row.results_json {
                            insert_results.execute(rusqlite::params![
                                row.query_info.query_id,
                                row.experiment,
                                json
                            ])?;
                        }
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }
}
