//! Typed embedding vectors shared by the embedder and the vector stores.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reasons a list of numbers cannot be used as an embedding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorError {
    /// No components at all.
    #[error("embedding vector is empty")]
    Empty,
    /// Component count does not match the configured model dimension.
    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension {
        /// Dimension the store/model expects.
        expected: usize,
        /// Dimension that was supplied.
        actual: usize,
    },
    /// A component was NaN or infinite.
    #[error("embedding component {index} is not finite")]
    NonFinite {
        /// Position of the offending component.
        index: usize,
    },
    /// The JSON value was not an array.
    #[error("embedding vector must be a list of numbers")]
    NotAList,
    /// A JSON array element was not a number.
    #[error("embedding component {index} is not a number")]
    NotANumber {
        /// Position of the offending component.
        index: usize,
    },
}

/// Fixed-length embedding produced by the embedding model.
///
/// Construction validates the components once, so everything downstream can
/// assume a non-empty vector of finite floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Validates raw components.
    pub fn new(values: Vec<f32>) -> Result<Self, VectorError> {
        if values.is_empty() {
            return Err(VectorError::Empty);
        }
        if let Some(index) = values.iter().position(|value| !value.is_finite()) {
            return Err(VectorError::NonFinite { index });
        }
        Ok(Self(values))
    }

    /// Validates raw components and checks the dimension.
    pub fn with_dimension(values: Vec<f32>, expected: usize) -> Result<Self, VectorError> {
        let embedding = Self::new(values)?;
        embedding.ensure_dimension(expected)?;
        Ok(embedding)
    }

    /// Coerces a loosely typed JSON value (e.g. a provider response field).
    pub fn from_json(value: &Value) -> Result<Self, VectorError> {
        let Value::Array(items) = value else {
            return Err(VectorError::NotAList);
        };
        let mut values = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let number = item
                .as_f64()
                .ok_or(VectorError::NotANumber { index })?;
            values.push(number as f32);
        }
        Self::new(values)
    }

    /// Errors unless the vector has exactly `expected` components.
    pub fn ensure_dimension(&self, expected: usize) -> Result<(), VectorError> {
        if self.0.len() != expected {
            return Err(VectorError::Dimension {
                expected,
                actual: self.0.len(),
            });
        }
        Ok(())
    }

    /// Number of components.
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Borrowed components.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Owned components.
    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Cosine distance (`1 - cosine similarity`); lower is closer.
    ///
    /// Mismatched dimensions or a zero-norm side yield `1.0`, the distance of
    /// two orthogonal vectors.
    pub fn cosine_distance(&self, other: &Embedding) -> f64 {
        if self.0.len() != other.0.len() {
            return 1.0;
        }
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (&x, &y) in self.0.iter().zip(other.0.iter()) {
            let x = f64::from(x);
            let y = f64::from(y);
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom == 0.0 {
            return 1.0;
        }
        1.0 - (dot / denom)
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = VectorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.0
    }
}

impl From<Embedding> for pgvector::Vector {
    fn from(embedding: Embedding) -> Self {
        pgvector::Vector::from(embedding.0)
    }
}
