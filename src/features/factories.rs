//! Feature factories: each owns the declared domain for one feature slot and
//! produces values from it. Factories never mutate their domain.
//!
//! The shared contract:
//! - `permute(max_size)` deterministically enumerates the domain, truncated.
//! - `random()` draws one value uniformly.
//! - `mutate(v, p, amplitude)` returns a perturbed value with probability `p`,
//!   otherwise an equal value. Amplitude scales the perturbation where that
//!   makes sense for the feature type.
//! - `crossover(a, b)` returns two fresh children; half the time the sides
//!   are swapped. Parents are never aliased.

use crate::error::{QuerytuneError, Result};
use crate::features::{CustomHandler, FieldWeights, ServerConnection, WeightedField};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Capability contract for one feature slot.
pub trait FeatureFactory<F: Clone + PartialEq> {
    fn permute(&self, max_size: usize) -> Vec<F>;
    fn random(&self) -> F;
    fn mutate(&self, value: &F, probability: f32, amplitude: f32) -> F;

    fn crossover(&self, a: &F, b: &F) -> (F, F) {
        coin_flip_pair(a, b)
    }
}

/// 50/50 inheritance: children are clones of the parents, possibly swapped.
pub(crate) fn coin_flip_pair<F: Clone>(a: &F, b: &F) -> (F, F) {
    if rand::thread_rng().gen::<f32>() < 0.5 {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Numeric feature slot over a declared list of candidate values.
///
/// Mutation shifts within the [min, max] bounds of the declared candidates,
/// scaled by amplitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatFeatureFactory {
    pub name: String,
    pub values: Vec<f32>,
}

impl FloatFeatureFactory {
    pub fn new(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    fn bounds(&self) -> (f32, f32) {
        let min = self.values.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = self
            .values
            .iter()
            .cloned()
            .fold(f32::NEG_INFINITY, f32::max);
        (min, max)
    }
}

impl FeatureFactory<f32> for FloatFeatureFactory {
    fn permute(&self, max_size: usize) -> Vec<f32> {
        self.values.iter().take(max_size).cloned().collect()
    }

    fn random(&self) -> f32 {
        let mut rng = rand::thread_rng();
        self.values[rng.gen_range(0..self.values.len())]
    }

    fn mutate(&self, value: &f32, probability: f32, amplitude: f32) -> f32 {
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() >= probability || self.values.len() < 2 {
            return *value;
        }
        let (min, max) = self.bounds();
        let range = max - min;
        for _ in 0..8 {
            let shift = rng.gen_range(-1.0f32..=1.0) * amplitude * range;
            let candidate = (value + shift).clamp(min, max);
            if candidate != *value {
                return candidate;
            }
        }
        // degenerate amplitude; fall back to a different declared value
        *self
            .values
            .iter()
            .find(|v| *v != value)
            .unwrap_or(value)
    }
}

/// Enum-like feature slot: one of a declared list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringFeatureFactory {
    pub name: String,
    pub values: Vec<String>,
}

impl StringFeatureFactory {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

impl FeatureFactory<String> for StringFeatureFactory {
    fn permute(&self, max_size: usize) -> Vec<String> {
        self.values.iter().take(max_size).cloned().collect()
    }

    fn random(&self) -> String {
        let mut rng = rand::thread_rng();
        self.values[rng.gen_range(0..self.values.len())].clone()
    }

    fn mutate(&self, value: &String, probability: f32, _amplitude: f32) -> String {
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() >= probability || self.values.len() < 2 {
            return value.clone();
        }
        for _ in 0..8 {
            let candidate = &self.values[rng.gen_range(0..self.values.len())];
            if candidate != value {
                return candidate.clone();
            }
        }
        // every declared value is the same; nothing to move to
        self.values
            .iter()
            .find(|v| *v != value)
            .unwrap_or(value)
            .clone()
    }
}

/// Weighted-field-list slot: every declared field may carry any of the
/// candidate weights, or be absent.
///
/// Mutation semantics (amplitude interpretation is a documented choice, not
/// inherited): each present entry re-rolls its weight with probability
/// `p`; additionally a random field is toggled in or out with probability
/// `p * amplitude`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWeightsFactory {
    pub name: String,
    pub fields: Vec<String>,
    pub weights: Vec<f32>,
}

impl FieldWeightsFactory {
    pub fn new(name: impl Into<String>, fields: Vec<String>, weights: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            fields,
            weights,
        }
    }

    /// Options per field: index 0 = absent, 1..=weights.len() = that weight.
    fn radix(&self) -> usize {
        self.weights.len() + 1
    }

    fn combination(&self, digits: &[usize]) -> FieldWeights {
        let mut wfs = Vec::new();
        for (field, &digit) in self.fields.iter().zip(digits) {
            if digit > 0 {
                wfs.push(WeightedField::new(field.clone(), self.weights[digit - 1]));
            }
        }
        FieldWeights(wfs)
    }
}

impl FeatureFactory<FieldWeights> for FieldWeightsFactory {
    fn permute(&self, max_size: usize) -> Vec<FieldWeights> {
        let mut out = Vec::new();
        if self.fields.is_empty() || self.weights.is_empty() {
            return out;
        }
        // mixed-radix counter over per-field options, skipping the all-absent row
        let mut digits = vec![0usize; self.fields.len()];
        loop {
            if digits.iter().any(|&d| d > 0) {
                out.push(self.combination(&digits));
                if out.len() >= max_size {
                    return out;
                }
            }
            let mut i = 0;
            loop {
                digits[i] += 1;
                if digits[i] < self.radix() {
                    break;
                }
                digits[i] = 0;
                i += 1;
                if i >= digits.len() {
                    return out;
                }
            }
        }
    }

    fn random(&self) -> FieldWeights {
        let mut rng = rand::thread_rng();
        let mut wfs = Vec::new();
        for field in &self.fields {
            let digit = rng.gen_range(0..self.radix());
            if digit > 0 {
                wfs.push(WeightedField::new(field.clone(), self.weights[digit - 1]));
            }
        }
        if wfs.is_empty() {
            let field = &self.fields[rng.gen_range(0..self.fields.len())];
            wfs.push(WeightedField::new(
                field.clone(),
                self.weights[rng.gen_range(0..self.weights.len())],
            ));
        }
        FieldWeights(wfs)
    }

    fn mutate(&self, value: &FieldWeights, probability: f32, amplitude: f32) -> FieldWeights {
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() >= probability {
            return value.clone();
        }
        let mut mutated = value.clone();
        for wf in mutated.0.iter_mut() {
            if rng.gen::<f32>() < probability && self.weights.len() > 1 {
                wf.weight = self.weights[rng.gen_range(0..self.weights.len())];
            }
        }
        if rng.gen::<f32>() < probability * amplitude && !self.fields.is_empty() {
            let field = &self.fields[rng.gen_range(0..self.fields.len())];
            if let Some(pos) = mutated.0.iter().position(|wf| &wf.field == field) {
                if mutated.0.len() > 1 {
                    mutated.0.remove(pos);
                }
            } else {
                mutated.0.push(WeightedField::new(
                    field.clone(),
                    self.weights[rng.gen_range(0..self.weights.len())],
                ));
            }
        }
        if mutated == *value && (self.weights.len() > 1 || self.fields.len() > 1) {
            // guarantee a visible change when mutation fired
            if let Some(wf) = mutated.0.first_mut() {
                if let Some(w) = self.weights.iter().find(|w| **w != wf.weight) {
                    wf.weight = *w;
                } else if let Some(f) = self.fields.iter().find(|f| **f != wf.field) {
                    wf.field = f.clone();
                }
            }
        }
        mutated
    }
}

/// Backend connection slot. Connections are reference features: mutation
/// leaves them unchanged (amplitude is inapplicable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerConnectionFeatureFactory {
    pub connections: Vec<ServerConnection>,
}

impl ServerConnectionFeatureFactory {
    pub fn new(connections: Vec<ServerConnection>) -> Self {
        Self { connections }
    }

    /// Some roles demand exactly one declared connection; more is a
    /// configuration mistake (e.g. duplicate URLs for a named role).
    pub fn single(&self) -> Result<&ServerConnection> {
        match self.connections.len() {
            1 => Ok(&self.connections[0]),
            n => Err(QuerytuneError::InvalidConfiguration(format!(
                "expected exactly one server connection, found {}",
                n
            ))),
        }
    }
}

impl FeatureFactory<ServerConnection> for ServerConnectionFeatureFactory {
    fn permute(&self, max_size: usize) -> Vec<ServerConnection> {
        self.connections.iter().take(max_size).cloned().collect()
    }

    fn random(&self) -> ServerConnection {
        let mut rng = rand::thread_rng();
        self.connections[rng.gen_range(0..self.connections.len())].clone()
    }

    fn mutate(
        &self,
        value: &ServerConnection,
        _probability: f32,
        _amplitude: f32,
    ) -> ServerConnection {
        value.clone()
    }
}

/// Custom request-handler slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomHandlerFactory {
    pub handlers: Vec<CustomHandler>,
}

impl CustomHandlerFactory {
    pub fn new(handlers: Vec<CustomHandler>) -> Self {
        Self { handlers }
    }
}

impl FeatureFactory<CustomHandler> for CustomHandlerFactory {
    fn permute(&self, max_size: usize) -> Vec<CustomHandler> {
        self.handlers.iter().take(max_size).cloned().collect()
    }

    fn random(&self) -> CustomHandler {
        let mut rng = rand::thread_rng();
        self.handlers[rng.gen_range(0..self.handlers.len())].clone()
    }

    fn mutate(&self, value: &CustomHandler, probability: f32, _amplitude: f32) -> CustomHandler {
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() >= probability || self.handlers.len() < 2 {
            return value.clone();
        }
        for _ in 0..8 {
            let candidate = &self.handlers[rng.gen_range(0..self.handlers.len())];
            if candidate != value {
                return candidate.clone();
            }
        }
        self.handlers
            .iter()
            .find(|h| *h != value)
            .unwrap_or(value)
            .clone()
    }
}
