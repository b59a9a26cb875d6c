//! Core type definitions for training snapshots

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Training step counter
pub type Step = u64;

/// Nested mapping of named state values
pub type StateDict = BTreeMap<String, Value>;

/// Dense row-major `f32` tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape` exactly
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InvalidShape {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// 0-d tensor holding a single value
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// 1-d tensor over `data`
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// The value of a single-element tensor
    pub fn item(&self) -> Option<f32> {
        match self.data.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }
}

/// A leaf or branch of a state dict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Tensor(Tensor),
    List(Vec<Value>),
    Map(StateDict),
}

impl Value {
    /// Short type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Tensor(_) => "tensor",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; ints widen and single-element tensors unwrap
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Tensor(t) => t.item().map(f64::from),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&StateDict> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Whether the value is scalar-shaped: plain numbers, or tensors with
    /// zero dimensions or at most one element.
    pub fn is_scalar(&self) -> bool {
        match self {
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => true,
            Value::Tensor(t) => t.ndim() == 0 || t.numel() <= 1,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Value::Tensor(v)
    }
}

impl From<StateDict> for Value {
    fn from(v: StateDict) -> Self {
        Value::Map(v)
    }
}

/// Fetch a required nested map from a state dict
pub fn get_map<'a>(state: &'a StateDict, key: &str) -> Result<&'a StateDict> {
    let value = state.get(key).ok_or_else(|| Error::MissingKey {
        key: key.to_string(),
    })?;
    value.as_map().ok_or_else(|| Error::TypeMismatch {
        key: key.to_string(),
        expected: "map".to_string(),
        actual: value.type_name().to_string(),
    })
}

/// Read an optional step entry from a state dict
pub fn get_step(state: &StateDict) -> Result<Option<Step>> {
    match state.get("step") {
        None => Ok(None),
        Some(Value::Int(v)) if *v >= 0 => Ok(Some(*v as Step)),
        Some(Value::Tensor(t)) => match t.item() {
            Some(v) if v >= 0.0 => Ok(Some(v as Step)),
            _ => Err(Error::TypeMismatch {
                key: "step".to_string(),
                expected: "non-negative scalar".to_string(),
                actual: format!("tensor{:?}", t.shape()),
            }),
        },
        Some(other) => Err(Error::TypeMismatch {
            key: "step".to_string(),
            expected: "non-negative int".to_string(),
            actual: other.type_name().to_string(),
        }),
    }
}

/// Encode an unsigned counter as an `Int` leaf stored under `key`
pub fn counter_value(key: &str, value: u64) -> Result<Value> {
    i64::try_from(value)
        .map(Value::Int)
        .map_err(|_| Error::CounterOverflow {
            key: key.to_string(),
            value,
        })
}
