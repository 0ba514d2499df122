//! Endpoint extraction from an OpenAPI 3 or Swagger 2 document.
//!
//! Works on an already-parsed `serde_json::Value` so the same code serves JSON
//! and YAML inputs. Missing or oddly shaped sections are skipped rather than
//! rejected; a document without `paths` yields an empty schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const METHODS: [&str; 7] = ["get", "post", "put", "patch", "delete", "options", "head"];

/// A declared parameter (`in` is kept verbatim, defaulting to `query`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub location: String,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// A top-level property of the request body schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyField {
    pub name: String,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// One operation (path + method).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub path: String,
    /// Upper-cased HTTP method.
    pub method: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub body_fields: Vec<BodyField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSchema {
    pub title: String,
    pub version: String,
    pub operations: Vec<OperationSpec>,
}

impl ApiSchema {
    pub fn from_document(doc: &Value) -> Self {
        let info = doc.get("info");
        let title = str_field(info, "title");
        let version = str_field(info, "version");

        let mut operations = Vec::new();
        if let Some(paths) = doc.get("paths").and_then(Value::as_object) {
            for (path, item) in paths {
                let Some(item) = item.as_object() else {
                    continue;
                };
                let shared = item.get("parameters");
                for method in METHODS {
                    if let Some(op) = item.get(method).and_then(Value::as_object) {
                        operations.push(parse_operation(doc, path, method, op, shared));
                    }
                }
            }
        }

        Self {
            title,
            version,
            operations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

fn parse_operation(
    doc: &Value,
    path: &str,
    method: &str,
    op: &Map<String, Value>,
    shared: Option<&Value>,
) -> OperationSpec {
    let summary = op
        .get("summary")
        .or_else(|| op.get("operationId"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut parameters: Vec<ParameterSpec> = Vec::new();
    let mut body_fields = Vec::new();
    let declared = shared
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .chain(op.get("parameters").and_then(Value::as_array).into_iter().flatten());
    for raw in declared {
        let raw = resolve_ref(doc, raw);
        let location = raw.get("in").and_then(Value::as_str).unwrap_or("query");
        if location == "body" {
            if let Some(schema) = raw.get("schema") {
                body_fields = parse_body_schema(doc, schema);
            }
            continue;
        }
        let Some(name) = raw.get("name").and_then(Value::as_str) else {
            continue;
        };
        let param = ParameterSpec {
            name: name.to_string(),
            location: location.to_string(),
            required: raw
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(location == "path"),
            description: raw
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        // Operation-level parameters override path-level ones.
        parameters.retain(|p| !(p.name == param.name && p.location == param.location));
        parameters.push(param);
    }

    if let Some(schema) = op
        .get("requestBody")
        .map(|body| resolve_ref(doc, body))
        .and_then(|body| body.get("content"))
        .and_then(Value::as_object)
        .and_then(|content| content.values().next())
        .and_then(|media| media.get("schema"))
    {
        body_fields = parse_body_schema(doc, schema);
    }

    OperationSpec {
        path: path.to_string(),
        method: method.to_ascii_uppercase(),
        summary,
        parameters,
        body_fields,
    }
}

fn parse_body_schema(doc: &Value, schema: &Value) -> Vec<BodyField> {
    let schema = resolve_ref(doc, schema);
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    properties
        .iter()
        .map(|(name, prop)| BodyField {
            name: name.clone(),
            required: required.contains(&name.as_str()),
            description: resolve_ref(doc, prop)
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
        .collect()
}

/// Follow a local `$ref` one level; anything else is returned unchanged.
fn resolve_ref<'a>(doc: &'a Value, value: &'a Value) -> &'a Value {
    let Some(reference) = value.get("$ref").and_then(Value::as_str) else {
        return value;
    };
    reference
        .strip_prefix('#')
        .and_then(|pointer| doc.pointer(pointer))
        .unwrap_or(value)
}

fn str_field(parent: Option<&Value>, key: &str) -> String {
    parent
        .and_then(|v| v.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Verifies OpenAPI 3 operations keep document order and resolve body refs.
    #[test]
    fn parses_openapi3_document() {
        let doc = json!({
            "openapi": "3.0.0",
            "info": {"title": "Shop", "version": "1.2"},
            "paths": {
                "/orders": {
                    "post": {
                        "summary": "Create order",
                        "requestBody": {"content": {"application/json": {
                            "schema": {"$ref": "#/components/schemas/NewOrder"}
                        }}}
                    },
                    "get": {"summary": "List orders",
                        "parameters": [{"name": "page", "in": "query"}]}
                },
                "/orders/{orderId}": {
                    "parameters": [{"name": "orderId", "in": "path", "required": true}],
                    "get": {"summary": "Get order"}
                }
            },
            "components": {"schemas": {"NewOrder": {
                "type": "object",
                "required": ["customerId"],
                "properties": {
                    "customerId": {"type": "string", "description": "buyer"},
                    "note": {"type": "string"}
                }
            }}}
        });

        let schema = ApiSchema::from_document(&doc);
        assert_eq!(schema.title, "Shop");
        assert_eq!(schema.version, "1.2");
        let keys: Vec<_> = schema
            .operations
            .iter()
            .map(|op| format!("{} {}", op.method, op.path))
            .collect();
        assert_eq!(
            keys,
            vec!["GET /orders", "POST /orders", "GET /orders/{orderId}"]
        );

        let create = &schema.operations[1];
        assert_eq!(create.body_fields.len(), 2);
        let customer = create
            .body_fields
            .iter()
            .find(|f| f.name == "customerId")
            .expect("customerId");
        assert!(customer.required);
        assert_eq!(customer.description, "buyer");

        let list = &schema.operations[0];
        assert_eq!(list.parameters[0].location, "query");
        assert!(!list.parameters[0].required);

        let get = &schema.operations[2];
        assert_eq!(get.parameters[0].name, "orderId");
        assert_eq!(get.parameters[0].location, "path");
    }

    /// Verifies Swagger 2 body parameters become body fields.
    #[test]
    fn parses_swagger2_body_parameter() {
        let doc = json!({
            "swagger": "2.0",
            "paths": {"/users": {"post": {"parameters": [
                {"name": "payload", "in": "body", "schema": {"$ref": "#/definitions/User"}}
            ]}}},
            "definitions": {"User": {"properties": {"user_no": {}}, "required": ["user_no"]}}
        });
        let schema = ApiSchema::from_document(&doc);
        let op = &schema.operations[0];
        assert!(op.parameters.is_empty());
        assert_eq!(op.body_fields[0].name, "user_no");
        assert!(op.body_fields[0].required);
    }

    /// Verifies a document without paths is an empty schema, not an error.
    #[test]
    fn missing_paths_is_empty() {
        let schema = ApiSchema::from_document(&json!({"info": {"title": "x"}}));
        assert!(schema.is_empty());
        assert!(ApiSchema::from_document(&json!("nonsense")).is_empty());
    }
}
