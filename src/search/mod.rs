//! Search-client capability consumed by the validator and the runner.
//!
//! Clients are not thread safe by contract: every worker constructs its own
//! through a [`SearchClientFactory`].

pub mod http;

use crate::error::Result;
use crate::features::{CustomHandler, ServerConnection};
use crate::queries::Query;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;

pub use http::{HttpClientFactory, HttpSearchClient};

/// One fully-specified search call.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: Query,
    pub custom_handler: Option<CustomHandler>,
    pub id_field: String,
    pub num_results: usize,
    /// Fields to bring back; empty means ids only.
    pub fields_to_retrieve: Vec<String>,
    pub filter_queries: Vec<Query>,
}

impl QueryRequest {
    pub fn new(query: Query, custom_handler: Option<CustomHandler>, id_field: impl Into<String>) -> Self {
        Self {
            query,
            custom_handler,
            id_field: id_field.into(),
            num_results: 10,
            fields_to_retrieve: Vec::new(),
            filter_queries: Vec::new(),
        }
    }
}

/// One document as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl StoredDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }
}

/// One query's results. Produced fresh per search call; immutable after
/// return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultSet {
    pub total_hits: u64,
    pub query_time_ms: u64,
    pub elapsed_ms: u64,
    pub documents: Vec<StoredDocument>,
}

impl SearchResultSet {
    pub fn ids(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Ids-only snapshot for persistence: strips any extra retrieved fields.
    pub fn minimized(&self) -> SearchResultSet {
        SearchResultSet {
            total_hits: self.total_hits,
            query_time_ms: self.query_time_ms,
            elapsed_ms: self.elapsed_ms,
            documents: self
                .documents
                .iter()
                .map(|d| StoredDocument::new(d.id.clone()))
                .collect(),
        }
    }
}

/// Basic functionality of a search backend.
///
/// Implementations are not expected to be shareable across workers; create
/// one per worker thread via [`SearchClientFactory`].
pub trait SearchClient: Send {
    fn search(
        &self,
        request: &QueryRequest,
    ) -> impl Future<Output = Result<SearchResultSet>> + Send;

    fn analyze(
        &self,
        field: &str,
        text: &str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn get_docs(
        &self,
        id_field: &str,
        ids: &[String],
        include_fields: &[String],
        exclude_fields: &[String],
    ) -> impl Future<Output = Result<Vec<StoredDocument>>> + Send;

    fn default_id_field(&self) -> &str;
}

/// Builds one client per worker from an experiment's server connection.
pub trait SearchClientFactory: Send + Sync + 'static {
    type Client: SearchClient + Send + Sync + 'static;

    fn create(&self, server: &ServerConnection) -> Result<Self::Client>;
}
