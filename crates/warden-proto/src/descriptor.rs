//! Descriptor wire format.
//!
//! Callers compose queries as an ordered array of
//! `[operationName, expressionText, ...positionalArgs]` tuples:
//!
//! ```json
//! [["where", "x.Id > @0", 5], ["include", "Children"]]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::Value;

/// Operations accepted in a descriptor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorOp {
    Where,
    Select,
    OrderBy,
    OrderByDescending,
    ThenBy,
    ThenByDescending,
    Include,
    ThenInclude,
}

impl DescriptorOp {
    /// Wire name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorOp::Where => "where",
            DescriptorOp::Select => "select",
            DescriptorOp::OrderBy => "orderBy",
            DescriptorOp::OrderByDescending => "orderByDescending",
            DescriptorOp::ThenBy => "thenBy",
            DescriptorOp::ThenByDescending => "thenByDescending",
            DescriptorOp::Include => "include",
            DescriptorOp::ThenInclude => "thenInclude",
        }
    }
}

impl FromStr for DescriptorOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "where" => DescriptorOp::Where,
            "select" => DescriptorOp::Select,
            "orderBy" => DescriptorOp::OrderBy,
            "orderByDescending" => DescriptorOp::OrderByDescending,
            "thenBy" => DescriptorOp::ThenBy,
            "thenByDescending" => DescriptorOp::ThenByDescending,
            "include" => DescriptorOp::Include,
            "thenInclude" => DescriptorOp::ThenInclude,
            other => return Err(other.to_string()),
        };
        Ok(op)
    }
}

impl fmt::Display for DescriptorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One query step as sent by a caller.
///
/// The operation name is kept verbatim; validation happens in the compiler
/// so that unknown names are reported as request errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Operation name (`where`, `include`, ...).
    pub operation: String,
    /// Expression source text.
    pub expression: String,
    /// Positional values for `@0`, `@1`, ...
    pub parameters: Vec<Value>,
}

impl Descriptor {
    /// Create a descriptor.
    pub fn new(operation: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            expression: expression.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a positional parameter.
    pub fn with_param(mut self, value: impl Into<Value>) -> Self {
        self.parameters.push(value.into());
        self
    }

    /// Decode from a JSON tuple `[op, text, ...args]`.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, Error> {
        let items = json.as_array().ok_or_else(|| {
            Error::InvalidDescriptor(format!("expected an array, found {}", json))
        })?;
        let operation = items
            .first()
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::InvalidDescriptor("missing operation name".to_string()))?;
        let expression = items
            .get(1)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                Error::InvalidDescriptor(format!("missing expression text for '{}'", operation))
            })?;
        Ok(Self {
            operation: operation.to_string(),
            expression: expression.to_string(),
            parameters: items[2..].iter().map(Value::from_json).collect(),
        })
    }

    /// Parse the operation name.
    pub fn op(&self) -> Result<DescriptorOp, String> {
        self.operation.parse()
    }
}

impl<'de> Deserialize<'de> for Descriptor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Descriptor::from_json(&raw).map_err(de::Error::custom)
    }
}

impl Serialize for Descriptor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2 + self.parameters.len()))?;
        seq.serialize_element(&self.operation)?;
        seq.serialize_element(&self.expression)?;
        for param in &self.parameters {
            seq.serialize_element(&param.to_json())?;
        }
        seq.end()
    }
}

/// A complete query request: root type, descriptor list, paging, include mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Root entity type.
    pub entity: String,
    /// Ordered query steps.
    #[serde(default)]
    pub descriptors: Vec<Descriptor>,
    /// First row to return when paging.
    #[serde(default)]
    pub start: Option<usize>,
    /// Page size; absent means no paging and no total count.
    #[serde(default)]
    pub size: Option<usize>,
    /// Load includes level by level in batched queries.
    #[serde(default)]
    pub split_includes: bool,
}

impl QueryRequest {
    /// Create a request with no descriptors.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            descriptors: Vec::new(),
            start: None,
            size: None,
            split_includes: false,
        }
    }

    /// Append a descriptor.
    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Request a page.
    pub fn with_page(mut self, start: usize, size: usize) -> Self {
        self.start = Some(start);
        self.size = Some(size);
        self
    }

    /// Enable batched include loading.
    pub fn with_split_includes(mut self) -> Self {
        self.split_includes = true;
        self
    }

    /// Decode from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }

    /// All positional parameters, concatenated in descriptor order.
    pub fn parameters(&self) -> Vec<Value> {
        self.descriptors
            .iter()
            .flat_map(|d| d.parameters.iter().cloned())
            .collect()
    }
}
