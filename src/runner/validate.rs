//! Judgment validation: confirms judged document ids actually exist in the
//! index before any experiment is scored against them.

use crate::error::Result;
use crate::judgments::JudgmentList;
use crate::queries::{Query, TermsQuery};
use crate::search::{QueryRequest, SearchClient};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

/// Ids are checked in batches bounded by total id length, so pathological id
/// lengths cannot blow past backend URL/body limits.
const MAX_BATCH_ID_CHARS: usize = 1000;

/// Check every judged document id against the index and return a copy of the
/// list with unresolvable ids removed.
///
/// Queries whose judgments all vanish are dropped entirely. Running the
/// output through validation again is a no-op.
pub async fn validate_judgments<C: SearchClient>(
    client: &C,
    judgments: &JudgmentList,
    id_field: &str,
    sleep_ms: u64,
) -> Result<JudgmentList> {
    let mut distinct: BTreeSet<&str> = BTreeSet::new();
    for j in &judgments.judgments {
        distinct.extend(j.judgments.keys().map(|s| s.as_str()));
    }

    let mut found: HashSet<String> = HashSet::with_capacity(distinct.len());
    let mut batch: Vec<String> = Vec::new();
    let mut batch_chars = 0usize;
    for id in &distinct {
        if !batch.is_empty() && batch_chars + id.len() > MAX_BATCH_ID_CHARS {
            check_batch(client, id_field, &mut batch, &mut found).await?;
            batch_chars = 0;
            if sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
        }
        batch_chars += id.len();
        batch.push((*id).to_string());
    }
    if !batch.is_empty() {
        check_batch(client, id_field, &mut batch, &mut found).await?;
    }

    let missing = distinct.len() - found.len();
    if missing > 0 {
        for id in &distinct {
            if !found.contains(*id) {
                log::warn!("judged document does not exist in the index: {}", id);
            }
        }
    }
    log::info!(
        "validated judgments: {} of {} judged ids exist",
        found.len(),
        distinct.len()
    );

    let mut validated = JudgmentList::default();
    for j in &judgments.judgments {
        let mut kept = j.clone();
        kept.judgments.retain(|id, _| found.contains(id));
        if kept.is_empty() {
            log::warn!(
                "dropping query {}: no judged documents remain after validation",
                j.query_info.query_id
            );
            continue;
        }
        validated.add(kept);
    }
    Ok(validated)
}

async fn check_batch<C: SearchClient>(
    client: &C,
    id_field: &str,
    batch: &mut Vec<String>,
    found: &mut HashSet<String>,
) -> Result<()> {
    let ids = std::mem::take(batch);
    let query = Query::Terms(TermsQuery {
        field: id_field.to_string(),
        values: ids.clone(),
    });
    let mut request = QueryRequest::new(query, None, id_field);
    // headroom over the batch size, in case the id field is multivalued
    request.num_results = ids.len() * 2;
    let results = client.search(&request).await?;
    for id in results.ids() {
        found.insert(id.to_string());
    }
    Ok(())
}
