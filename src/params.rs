//! Run parameters.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::data::{Dataset, DatasetCollection};
use crate::error::UsageError;

/// A plain scalar parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Value of a single parameter.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Scalar(Scalar),
    Dataset(Dataset),
    Collection(DatasetCollection),
    /// Raw value passed through to a labelled workflow step.
    Step(serde_json::Value),
}

macro_rules! scalar_param {
    ($($t:ty),*) => {
        $(impl From<$t> for ParamValue {
            fn from(v: $t) -> Self {
                Self::Scalar(v.into())
            }
        })*
    };
}

scalar_param!(&str, String, bool, i32, i64, f64);

impl From<Scalar> for ParamValue {
    fn from(v: Scalar) -> Self {
        Self::Scalar(v)
    }
}

impl From<Dataset> for ParamValue {
    fn from(v: Dataset) -> Self {
        Self::Dataset(v)
    }
}

impl From<DatasetCollection> for ParamValue {
    fn from(v: DatasetCollection) -> Self {
        Self::Collection(v)
    }
}

/// Ordered mapping of parameter names to values.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    inputs: IndexMap<String, ParamValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input, replacing any previous value under the same name.
    pub fn add_input(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.inputs.insert(name.into(), value.into());
    }

    /// Builder-style [`add_input`](Self::add_input).
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.add_input(name, value);
        self
    }

    /// Add a raw value targeting a labelled workflow step.
    pub fn add_step_value(&mut self, label: impl Into<String>, value: serde_json::Value) {
        self.inputs.insert(label.into(), ParamValue::Step(value));
    }

    /// Replace the value of an existing input.
    pub fn change_input_value(
        &mut self,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<(), UsageError> {
        let slot = self
            .inputs
            .get_mut(name)
            .ok_or_else(|| UsageError::UnknownParameter {
                name: name.to_string(),
            })?;
        *slot = value.into();
        Ok(())
    }

    /// Remove an existing input, keeping the order of the rest.
    pub fn remove_input(&mut self, name: &str) -> Result<ParamValue, UsageError> {
        self.inputs
            .shift_remove(name)
            .ok_or_else(|| UsageError::UnknownParameter {
                name: name.to_string(),
            })
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.inputs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.inputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}
