//! Elasticsearch-flavored HTTP search client.
//!
//! Wire details stay contained here: the rest of the crate sees only the
//! `SearchClient` capability. One client per worker; the underlying reqwest
//! client is built with a fixed timeout like the rest of our HTTP callers.

use crate::error::{QuerytuneError, Result};
use crate::features::ServerConnection;
use crate::queries::Query;
use crate::search::{
    QueryRequest, SearchClient, SearchClientFactory, SearchResultSet, StoredDocument,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_ID_FIELD: &str = "_id";

/// Response structure for `_search`
#[derive(Deserialize)]
struct SearchResponse {
    took: Option<u64>,
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    total: TotalHits,
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct TotalHits {
    value: u64,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
}

/// Response structure for `_analyze`
#[derive(Deserialize)]
struct AnalyzeResponse {
    tokens: Vec<AnalyzeToken>,
}

#[derive(Deserialize)]
struct AnalyzeToken {
    token: String,
}

pub struct HttpSearchClient {
    client: Client,
    /// Index URL without a trailing slash, e.g. `http://localhost:9200/products`.
    base_url: String,
    user: Option<String>,
    password: Option<String>,
}

impl HttpSearchClient {
    pub fn new(server: &ServerConnection) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| QuerytuneError::SearchClient(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            base_url: server.url.trim_end_matches('/').to_string(),
            user: server.user.clone(),
            password: server.password.clone(),
        })
    }

    async fn post_json(&self, url: &str, body: Value) -> Result<Value> {
        let mut req = self.client.post(url).json(&body);
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.as_deref());
        }
        let response = req
            .send()
            .await
            .map_err(|e| QuerytuneError::SearchClient(format!("POST {} failed: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QuerytuneError::SearchClient(format!(
                "POST {} returned {}: {}",
                url, status, body
            )));
        }
        response
            .json()
            .await
            .map_err(|e| QuerytuneError::SearchClient(format!("bad JSON from {}: {}", url, e)))
    }

    fn search_endpoint(&self, request: &QueryRequest) -> String {
        match (&request.custom_handler, &request.query) {
            (_, Query::Template(_)) => format!("{}/_search/template", self.base_url),
            (Some(handler), _) => format!("{}/{}", self.base_url, handler.handler),
            (None, _) => format!("{}/_search", self.base_url),
        }
    }

    fn search_body(&self, request: &QueryRequest) -> Value {
        if let Query::Template(t) = &request.query {
            return json!({ "id": t.id, "params": t.params });
        }
        let mut query = query_to_json(&request.query);
        if !request.filter_queries.is_empty() {
            let filters: Vec<Value> =
                request.filter_queries.iter().map(query_to_json).collect();
            query = json!({ "bool": { "must": query, "filter": filters } });
        }
        let mut body = json!({
            "query": query,
            "size": request.num_results,
        });
        if request.fields_to_retrieve.is_empty() {
            body["_source"] = json!(false);
        } else {
            body["_source"] = json!(request.fields_to_retrieve);
        }
        body
    }

    fn parse_results(value: Value, elapsed_ms: u64) -> Result<SearchResultSet> {
        let parsed: SearchResponse = serde_json::from_value(value)?;
        let documents = parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let mut doc = StoredDocument::new(hit.id);
                if let Some(Value::Object(map)) = hit.source {
                    doc.fields = map.into_iter().collect();
                }
                doc
            })
            .collect();
        Ok(SearchResultSet {
            total_hits: parsed.hits.total.value,
            query_time_ms: parsed.took.unwrap_or(0),
            elapsed_ms,
            documents,
        })
    }
}

impl SearchClient for HttpSearchClient {
    async fn search(&self, request: &QueryRequest) -> Result<SearchResultSet> {
        let url = self.search_endpoint(request);
        let body = self.search_body(request);
        let start = std::time::Instant::now();
        let value = self.post_json(&url, body).await?;
        Self::parse_results(value, start.elapsed().as_millis() as u64)
    }

    async fn analyze(&self, field: &str, text: &str) -> Result<Vec<String>> {
        let url = format!("{}/_analyze", self.base_url);
        let value = self
            .post_json(&url, json!({ "field": field, "text": text }))
            .await?;
        let parsed: AnalyzeResponse = serde_json::from_value(value)?;
        Ok(parsed.tokens.into_iter().map(|t| t.token).collect())
    }

    async fn get_docs(
        &self,
        id_field: &str,
        ids: &[String],
        include_fields: &[String],
        exclude_fields: &[String],
    ) -> Result<Vec<StoredDocument>> {
        let url = format!("{}/_search", self.base_url);
        let mut body = json!({
            "query": { "terms": { (id_field): ids } },
            "size": ids.len(),
        });
        if !include_fields.is_empty() || !exclude_fields.is_empty() {
            body["_source"] = json!({
                "includes": include_fields,
                "excludes": exclude_fields,
            });
        }
        let value = self.post_json(&url, body).await?;
        Ok(Self::parse_results(value, 0)?.documents)
    }

    fn default_id_field(&self) -> &str {
        DEFAULT_ID_FIELD
    }
}

/// Translate a query variant into backend query DSL.
fn query_to_json(query: &Query) -> Value {
    match query {
        Query::MultiMatch(q) => {
            let fields: Vec<String> = q.fields.active_fields().map(|wf| wf.to_string()).collect();
            let mut body = json!({
                "query": q.query_string,
                "fields": fields,
                "tie_breaker": q.tie,
                "boost": q.boost,
            });
            if let Some(op) = &q.operator {
                body["operator"] = json!(op);
            }
            json!({ "multi_match": body })
        }
        Query::Boosting(q) => json!({
            "boosting": {
                "positive": query_to_json(&q.positive),
                "negative": query_to_json(&q.negative),
                "negative_boost": q.negative_boost,
            }
        }),
        Query::MoreLikeThis(q) => {
            let fields: Vec<String> = q.fields.active_fields().map(|wf| wf.to_string()).collect();
            let mut body = json!({
                "fields": fields,
                "like": [q.text],
                "max_query_terms": q.max_query_terms,
                "min_term_freq": q.min_term_freq,
                "min_doc_freq": q.min_doc_freq,
                "min_word_length": q.min_word_length,
                "max_word_length": q.max_word_length,
            });
            if let Some(max_doc_freq) = q.max_doc_freq {
                body["max_doc_freq"] = json!(max_doc_freq);
            }
            json!({ "more_like_this": body })
        }
        Query::Term(q) => json!({ "term": { (q.field.as_str()): { "value": q.value } } }),
        Query::Terms(q) => json!({ "terms": { (q.field.as_str()): q.values } }),
        Query::Lucene(q) => {
            let mut body = json!({ "query": q.query_string });
            if let Some(df) = &q.default_field {
                body["default_field"] = json!(df);
            }
            json!({ "query_string": body })
        }
        Query::MatchAll => json!({ "match_all": {} }),
        Query::Template(t) => json!({ "id": t.id, "params": t.params }),
    }
}

/// Default factory: one [`HttpSearchClient`] per worker.
#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory;

impl SearchClientFactory for HttpClientFactory {
    type Client = HttpSearchClient;

    fn create(&self, server: &ServerConnection) -> Result<Self::Client> {
        HttpSearchClient::new(server)
    }
}
