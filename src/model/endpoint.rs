//! Typed model of one remote-callable function, loosely following the
//! OpenAPI v3.0 vocabulary the orchestrator speaks.
//!
//! The descriptor arrives as open-ended JSON; everything is parsed into these
//! variants at the deployment boundary so the rest of the core only ever sees
//! validated shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema type of a request parameter or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Integer,
    String,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaFormat {
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<SchemaFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, Value>>,
}

impl Schema {
    /// Whether a value of this schema can cross the WebAssembly boundary as a
    /// primitive. Only integers qualify; everything else needs a file mount.
    pub fn is_wasm_primitive(&self) -> bool {
        matches!(self.schema_type, SchemaType::Integer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingObject {
    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Media type plus schema, used both for request bodies and responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaTypeObject {
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<HashMap<String, EncodingObject>>,
}

pub type EndpointResponse = MediaTypeObject;

/// One declared query parameter of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointRequest {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<MediaTypeObject>,
}

/// The HTTP projection of a module function: where it lives and what its
/// request and response look like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub path: String,
    pub method: String,
    pub request: EndpointRequest,
    pub response: EndpointResponse,
}
