//! Query composition: a closed set of query variants, each carrying its own
//! tunable features.
//!
//! A `Query` owned by an experiment is read concurrently by many workers and
//! must never be mutated in place; bind runtime text with
//! [`Query::set_query_strings`] on a per-call clone.

use crate::features::FieldWeights;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the default query-string slot.
pub const DEFAULT_QUERY_STRING: &str = "query";

/// Runtime query text/parameters, keyed by slot name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryStrings(pub BTreeMap<String, String>);

impl QueryStrings {
    /// A single-slot binding under the default name.
    pub fn single(text: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(DEFAULT_QUERY_STRING.to_string(), text.into());
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.0.insert(name.into(), text.into());
    }

    pub fn default_text(&self) -> &str {
        self.get(DEFAULT_QUERY_STRING).unwrap_or("")
    }
}

impl std::fmt::Display for QueryStrings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Multi-field match with per-field boosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiMatchQuery {
    pub fields: FieldWeights,
    #[serde(default)]
    pub tie: f32,
    /// "AND"/"OR"; backend default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default = "default_boost")]
    pub boost: f32,
    #[serde(default)]
    pub query_string: String,
}

fn default_boost() -> f32 {
    1.0
}

impl MultiMatchQuery {
    pub fn new(fields: FieldWeights) -> Self {
        Self {
            fields,
            tie: 0.0,
            operator: None,
            boost: 1.0,
            query_string: String::new(),
        }
    }
}

/// Positive/negative clause pair with a deboost on the negative side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostingQuery {
    pub positive: Box<Query>,
    pub negative: Box<Query>,
    pub negative_boost: f32,
}

/// More-like-this over the bound text, with term-selection bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoreLikeThisQuery {
    pub fields: FieldWeights,
    #[serde(default = "mlt_max_query_terms")]
    pub max_query_terms: u32,
    #[serde(default = "mlt_min_term_freq")]
    pub min_term_freq: u32,
    #[serde(default = "mlt_min_doc_freq")]
    pub min_doc_freq: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_doc_freq: Option<u32>,
    #[serde(default)]
    pub min_word_length: u32,
    #[serde(default)]
    pub max_word_length: u32,
    #[serde(default)]
    pub text: String,
}

// backend defaults for term selection
fn mlt_max_query_terms() -> u32 {
    25
}

fn mlt_min_term_freq() -> u32 {
    2
}

fn mlt_min_doc_freq() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermQuery {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermsQuery {
    pub field: String,
    pub values: Vec<String>,
}

/// Raw query-syntax string passed through to the backend parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LuceneQuery {
    #[serde(default)]
    pub query_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_field: Option<String>,
}

/// Server-side search template invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateQuery {
    pub id: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// The closed set of query configurations an experiment can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    MultiMatch(MultiMatchQuery),
    Boosting(BoostingQuery),
    MoreLikeThis(MoreLikeThisQuery),
    Term(TermQuery),
    Terms(TermsQuery),
    Lucene(LuceneQuery),
    MatchAll,
    Template(TemplateQuery),
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::MultiMatch(_) => "multi_match",
            Query::Boosting(_) => "boosting",
            Query::MoreLikeThis(_) => "more_like_this",
            Query::Term(_) => "term",
            Query::Terms(_) => "terms",
            Query::Lucene(_) => "lucene",
            Query::MatchAll => "match_all",
            Query::Template(_) => "template",
        }
    }

    /// Bind runtime query text into this clone.
    ///
    /// Text-driven variants take the default slot; templates absorb every
    /// named slot as a parameter; boosting recurses into both clauses.
    /// Term/terms/match-all queries carry no runtime text.
    pub fn set_query_strings(&mut self, query_strings: &QueryStrings) {
        match self {
            Query::MultiMatch(q) => {
                q.query_string = query_strings.default_text().to_string();
            }
            Query::Lucene(q) => {
                q.query_string = query_strings.default_text().to_string();
            }
            Query::MoreLikeThis(q) => {
                q.text = query_strings.default_text().to_string();
            }
            Query::Boosting(q) => {
                q.positive.set_query_strings(query_strings);
                q.negative.set_query_strings(query_strings);
            }
            Query::Template(q) => {
                for (name, text) in &query_strings.0 {
                    q.params.insert(name.clone(), text.clone());
                }
            }
            Query::Term(_) | Query::Terms(_) | Query::MatchAll => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::WeightedField;

    fn mm_query() -> Query {
        Query::MultiMatch(MultiMatchQuery::new(FieldWeights(vec![
            WeightedField::new("title", 2.0),
            WeightedField::new("body", 1.0),
        ])))
    }

    #[test]
    fn set_query_strings_binds_default_slot() {
        let mut q = mm_query();
        q.set_query_strings(&QueryStrings::single("red shoes"));
        match q {
            Query::MultiMatch(mm) => assert_eq!(mm.query_string, "red shoes"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn set_query_strings_does_not_touch_original() {
        let original = mm_query();
        let mut clone = original.clone();
        clone.set_query_strings(&QueryStrings::single("red shoes"));
        assert_ne!(original, clone);
    }

    #[test]
    fn boosting_recurses() {
        let mut q = Query::Boosting(BoostingQuery {
            positive: Box::new(mm_query()),
            negative: Box::new(Query::Lucene(LuceneQuery {
                query_string: String::new(),
                default_field: None,
            })),
            negative_boost: 0.3,
        });
        q.set_query_strings(&QueryStrings::single("boots"));
        match q {
            Query::Boosting(b) => {
                match *b.positive {
                    Query::MultiMatch(ref mm) => assert_eq!(mm.query_string, "boots"),
                    _ => panic!(),
                }
                match *b.negative {
                    Query::Lucene(ref lq) => assert_eq!(lq.query_string, "boots"),
                    _ => panic!(),
                }
            }
            _ => panic!(),
        }
    }

    #[test]
    fn template_absorbs_all_slots() {
        let mut qs = QueryStrings::default();
        qs.insert("query", "boots");
        qs.insert("category", "footwear");
        let mut q = Query::Template(TemplateQuery {
            id: "tmpl1".to_string(),
            params: BTreeMap::new(),
        });
        q.set_query_strings(&qs);
        match q {
            Query::Template(t) => {
                assert_eq!(t.params.get("query").unwrap(), "boots");
                assert_eq!(t.params.get("category").unwrap(), "footwear");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn serde_tagged_roundtrip() {
        let q = mm_query();
        let json = serde_json::to_string(&q).unwrap();
        assert!(json.contains("\"type\":\"multi_match\""));
        let back: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(q, back);
    }

    #[test]
    fn match_all_roundtrip() {
        let json = serde_json::to_string(&Query::MatchAll).unwrap();
        let back: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Query::MatchAll);
    }
}
