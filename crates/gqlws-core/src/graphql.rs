//! GraphQL payload objects carried inside protocol messages.
//!
//! The engines never look inside a query; these types only fix the JSON
//! shape of what travels in `start`, `data` and `error` payloads.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// JSON object payload (`connection_init`, `connection_ack`, variables, ...).
pub type Payload = Map<String, Value>;

/// A GraphQL operation request, the payload of a `start` message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    /// Query document text.
    pub query: String,
    /// Variable values, keyed by variable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Payload>,
    /// Operation to run when the document defines several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    /// Request with only a query document.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    /// Attach variable values.
    #[must_use]
    pub fn with_variables(mut self, variables: Payload) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Select an operation by name.
    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// Line/column position inside the query document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

/// A single GraphQL error object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// Human-readable description.
    pub message: String,
    /// Locations in the query document the error refers to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<SourceLocation>,
    /// Response path (field names and list indices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Implementation-specific extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Payload>,
}

impl GraphQLError {
    /// Error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
        }
    }
}

/// Result of executing one operation, or one item of a subscription stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResult {
    /// Response data. `Some(Value::Null)` is an explicit `"data": null`,
    /// `None` omits the field.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
    /// Field errors raised while producing `data`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

/// Keep an explicit `null` as `Some(Value::Null)`; absence stays `None`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl GraphQLResult {
    /// Successful result.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Result with errors and no data.
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self { data: None, errors }
    }

    /// Whether the result carries no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}
