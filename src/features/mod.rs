//! Tunable feature values: the typed parameters a query configuration is built from.
//!
//! Every feature is an immutable named value with value-based equality; `Clone`
//! is the deep copy. Features never share mutable state across experiments.

pub mod factories;

use serde::{Deserialize, Serialize};

pub use factories::{
    CustomHandlerFactory, FeatureFactory, FieldWeightsFactory, FloatFeatureFactory,
    ServerConnectionFeatureFactory, StringFeatureFactory,
};

/// One field with its boost weight, e.g. `title^2.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedField {
    pub field: String,
    pub weight: f32,
}

impl WeightedField {
    pub fn new(field: impl Into<String>, weight: f32) -> Self {
        Self {
            field: field.into(),
            weight,
        }
    }
}

impl std::fmt::Display for WeightedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if (self.weight - 1.0).abs() < f32::EPSILON {
            write!(f, "{}", self.field)
        } else {
            write!(f, "{}^{}", self.field, self.weight)
        }
    }
}

/// An ordered list of weighted fields (a "qf"-style feature).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldWeights(pub Vec<WeightedField>);

impl FieldWeights {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Fields currently carrying a non-zero weight.
    pub fn active_fields(&self) -> impl Iterator<Item = &WeightedField> {
        self.0.iter().filter(|wf| wf.weight > 0.0)
    }
}

/// Connection coordinates for one search backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerConnection {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ServerConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
        }
    }
}

impl std::fmt::Display for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A non-default request handler on the backend, with an optional custom
/// key the query text is bound to (defaults to `q`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomHandler {
    pub handler: String,
    #[serde(default = "default_query_key")]
    pub query_key: String,
}

fn default_query_key() -> String {
    "q".to_string()
}

impl CustomHandler {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            query_key: default_query_key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_field_display() {
        assert_eq!(WeightedField::new("title", 2.0).to_string(), "title^2");
        assert_eq!(WeightedField::new("body", 1.0).to_string(), "body");
    }

    #[test]
    fn field_weights_active() {
        let fw = FieldWeights(vec![
            WeightedField::new("title", 2.0),
            WeightedField::new("body", 0.0),
        ]);
        let active: Vec<_> = fw.active_fields().collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].field, "title");
    }

    #[test]
    fn server_connection_roundtrip() {
        let conn = ServerConnection::new("http://localhost:9200/idx");
        let json = serde_json::to_string(&conn).unwrap();
        let back: ServerConnection = serde_json::from_str(&json).unwrap();
        assert_eq!(conn, back);
        // user/password omitted when unset
        assert!(!json.contains("user"));
    }

    #[test]
    fn custom_handler_default_key() {
        let ch: CustomHandler = serde_json::from_str(r#"{"handler":"custom1"}"#).unwrap();
        assert_eq!(ch.query_key, "q");
    }
}
