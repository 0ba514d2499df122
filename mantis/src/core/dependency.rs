//! Static dependency analysis over API operations.
//!
//! Infers resources from paths, links id-like fields to the operations that can
//! produce them, and orders operations so producers come before consumers.
//!
//! The analysis is pure: it never fails and never touches the filesystem. An
//! empty schema yields an empty result.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::schema::{ApiSchema, OperationSpec};

/// Default cap on the number of dependency links kept per analysis.
pub const DEFAULT_MAX_DEPENDENCIES: usize = 200;

/// Default number of entries per section in [`DependencyAnalysisResult::to_prompt_block`].
pub const DEFAULT_PROMPT_LIMIT: usize = 8;

const ID_HINTS: [&str; 7] = ["id", "pk", "key", "code", "uuid", "no", "num"];
const ID_PREFIXES: [&str; 3] = ["pk", "id", "uuid"];
const PRODUCER_METHODS: [&str; 4] = ["POST", "PUT", "PATCH", "GET"];
const UNKNOWN_METHOD_PRIORITY: u8 = 99;

/// An operation; identity is `(path, method)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub summary: String,
}

impl Endpoint {
    pub fn same_operation(&self, other: &Endpoint) -> bool {
        self.path == other.path && self.method.eq_ignore_ascii_case(&other.method)
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

impl From<&OperationSpec> for Endpoint {
    fn from(op: &OperationSpec) -> Self {
        Self {
            path: op.path.clone(),
            method: op.method.to_ascii_uppercase(),
            summary: op.summary.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldLocation {
    Path,
    Query,
    Body,
}

impl FieldLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Body => "body",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub name: String,
    pub location: FieldLocation,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub primary_keys: BTreeSet<String>,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLink {
    pub consumer: Endpoint,
    pub field: FieldRef,
    pub producers: Vec<Endpoint>,
    pub normalized_id: String,
    pub confidence: Confidence,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyAnalysisResult {
    pub resources: Vec<Resource>,
    pub dependencies: Vec<DependencyLink>,
    pub sorted_endpoints: Vec<Endpoint>,
    /// Set when links were dropped because of the configured cap.
    #[serde(default)]
    pub truncated: bool,
}

/// Analyzer configuration.
#[derive(Debug, Clone, Copy)]
pub struct DependencyAnalyzer {
    pub max_dependencies: usize,
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self {
            max_dependencies: DEFAULT_MAX_DEPENDENCIES,
        }
    }
}

impl DependencyAnalyzer {
    pub fn new(max_dependencies: usize) -> Self {
        Self { max_dependencies }
    }

    pub fn analyze(&self, schema: &ApiSchema) -> DependencyAnalysisResult {
        let endpoints: Vec<Endpoint> = schema.operations.iter().map(Endpoint::from).collect();
        let fields: Vec<Vec<FieldRef>> = schema.operations.iter().map(extract_fields).collect();

        // Pass 1: resources and their primary keys over the whole schema, so the
        // links below do not depend on where producers appear in the document.
        let mut resources: Vec<Resource> = Vec::new();
        let mut resource_of = Vec::with_capacity(endpoints.len());
        for (endpoint, endpoint_fields) in endpoints.iter().zip(&fields) {
            let name = infer_resource_name(&endpoint.path);
            let index = match resources.iter().position(|r| r.name == name) {
                Some(index) => index,
                None => {
                    resources.push(Resource {
                        name,
                        primary_keys: BTreeSet::new(),
                        endpoints: Vec::new(),
                    });
                    resources.len() - 1
                }
            };
            let resource = &mut resources[index];
            resource.endpoints.push(endpoint.clone());
            for field in endpoint_fields {
                if field.location == FieldLocation::Path && is_id_like(&field.name) {
                    resource.primary_keys.insert(normalize_id(&field.name));
                }
            }
            resource_of.push(index);
        }

        // Pass 2: one link per id-like field.
        let mut dependencies = Vec::new();
        let mut truncated = false;
        'endpoints: for ((endpoint, endpoint_fields), resource_index) in
            endpoints.iter().zip(&fields).zip(&resource_of)
        {
            for field in endpoint_fields.iter().filter(|f| is_id_like(&f.name)) {
                if dependencies.len() >= self.max_dependencies {
                    warn!(
                        max_dependencies = self.max_dependencies,
                        "dependency limit reached, truncating"
                    );
                    truncated = true;
                    break 'endpoints;
                }
                let normalized_id = normalize_id(&field.name);
                dependencies.push(DependencyLink {
                    consumer: endpoint.clone(),
                    producers: find_producers(&resources, &normalized_id),
                    normalized_id,
                    confidence: confidence_for(field),
                    reason: reason_for(field, &resources[*resource_index].name),
                    field: field.clone(),
                });
            }
        }

        let sorted_endpoints = topological_sort(&endpoints, &dependencies);
        debug!(
            resources = resources.len(),
            dependencies = dependencies.len(),
            endpoints = sorted_endpoints.len(),
            "dependency analysis finished"
        );

        DependencyAnalysisResult {
            resources,
            dependencies,
            sorted_endpoints,
            truncated,
        }
    }
}

impl DependencyAnalysisResult {
    /// Markdown summary embedded into planning and generation prompts.
    pub fn to_prompt_block(&self, limit: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "- resources: {}, dependencies: {}, endpoints: {}",
            self.resources.len(),
            self.dependencies.len(),
            self.sorted_endpoints.len()
        );

        if !self.sorted_endpoints.is_empty() {
            out.push_str("### Endpoints in dependency order\n");
            for (i, ep) in self.sorted_endpoints.iter().take(limit).enumerate() {
                let _ = write!(out, "{}. {}", i + 1, ep.label());
                if !ep.summary.is_empty() {
                    let _ = write!(out, " - {}", ep.summary);
                }
                out.push('\n');
            }
            if self.sorted_endpoints.len() > limit {
                let _ = writeln!(out, "   ... {} endpoints total", self.sorted_endpoints.len());
            }
        }

        if !self.resources.is_empty() {
            out.push_str("### Resources and primary keys\n");
            for resource in self.resources.iter().take(limit) {
                let keys = if resource.primary_keys.is_empty() {
                    "unknown".to_string()
                } else {
                    resource
                        .primary_keys
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                let _ = writeln!(out, "- {}: {}", resource.name, keys);
            }
        }

        if !self.dependencies.is_empty() {
            out.push_str("### Dependencies\n");
            for link in self.dependencies.iter().take(limit) {
                let producers = if link.producers.is_empty() {
                    "unknown".to_string()
                } else {
                    link.producers
                        .iter()
                        .map(Endpoint::label)
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                let _ = writeln!(
                    out,
                    "- {} needs {} <- {} ({})",
                    link.consumer.label(),
                    link.normalized_id,
                    producers,
                    link.confidence.as_str()
                );
            }
        }

        out.trim_end().to_string()
    }
}

/// Sort priority for an HTTP method; unknown methods sort last.
pub fn method_priority(method: &str) -> u8 {
    match method.to_ascii_uppercase().as_str() {
        "GET" => 1,
        "POST" => 2,
        "PUT" => 3,
        "PATCH" => 4,
        "DELETE" => 5,
        "OPTIONS" => 6,
        "HEAD" => 7,
        _ => UNKNOWN_METHOD_PRIORITY,
    }
}

/// True if the field name contains one of the id hints (case-insensitive).
pub fn is_id_like(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ID_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Canonical id name used to match producers and consumers.
///
/// Drops separators, strips a leading `pk`/`id`/`uuid` (each at most once, in
/// that order), canonicalizes the suffix to `Id` and lower-cases the first
/// character: `order_id`, `orderId` and `pkOrderID` all become `orderId`.
pub fn normalize_id(name: &str) -> String {
    let mut base: String = name.chars().filter(|c| *c != '_' && *c != '-').collect();
    for prefix in ID_PREFIXES {
        if base
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        {
            base.drain(..prefix.len());
        }
    }
    if base.len() >= 2
        && base
            .get(base.len() - 2..)
            .is_some_and(|tail| tail.eq_ignore_ascii_case("id"))
    {
        base.truncate(base.len() - 2);
    }
    base.push_str("Id");

    let mut chars = base.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => base,
    }
}

/// Last non-parameter path segment, `-` replaced by `_`; `root` if none.
pub fn infer_resource_name(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && !segment.starts_with('{'))
        .next_back()
        .map(|segment| segment.replace('-', "_"))
        .unwrap_or_else(|| "root".to_string())
}

fn extract_fields(op: &OperationSpec) -> Vec<FieldRef> {
    let params = op.parameters.iter().filter_map(|param| {
        // Header and cookie parameters never carry resource ids.
        let location = match param.location.as_str() {
            "path" => FieldLocation::Path,
            "query" => FieldLocation::Query,
            _ => return None,
        };
        Some(FieldRef {
            name: param.name.clone(),
            location,
            required: param.required,
            description: param.description.clone(),
        })
    });
    let body = op.body_fields.iter().map(|field| FieldRef {
        name: field.name.clone(),
        location: FieldLocation::Body,
        required: field.required,
        description: field.description.clone(),
    });
    params.chain(body).collect()
}

fn find_producers(resources: &[Resource], normalized_id: &str) -> Vec<Endpoint> {
    resources
        .iter()
        .filter(|r| r.primary_keys.contains(normalized_id))
        .flat_map(|r| r.endpoints.iter())
        .filter(|ep| PRODUCER_METHODS.contains(&ep.method.as_str()))
        .cloned()
        .collect()
}

fn confidence_for(field: &FieldRef) -> Confidence {
    if field.location == FieldLocation::Path {
        Confidence::High
    } else if field.required {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

fn reason_for(field: &FieldRef, resource: &str) -> String {
    if field.location == FieldLocation::Path {
        format!("path parameter of {resource}")
    } else if field.required {
        format!("required field {}", field.name)
    } else {
        format!("optional field {}", field.name)
    }
}

/// Kahn's algorithm over producer -> consumer edges.
///
/// The ready queue is kept in method-priority order (stable, so ties keep
/// insertion order). Nodes left over by a cycle are appended by priority, so
/// every input endpoint appears exactly once.
fn topological_sort(endpoints: &[Endpoint], links: &[DependencyLink]) -> Vec<Endpoint> {
    let n = endpoints.len();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];

    let indices_of = |target: &Endpoint| -> Vec<usize> {
        endpoints
            .iter()
            .enumerate()
            .filter(|(_, ep)| ep.same_operation(target))
            .map(|(i, _)| i)
            .collect()
    };

    for link in links {
        let consumers = indices_of(&link.consumer);
        for producer in &link.producers {
            for p in indices_of(producer) {
                for &c in &consumers {
                    if p != c && !adjacency[p].contains(&c) {
                        adjacency[p].push(c);
                        in_degree[c] += 1;
                    }
                }
            }
        }
    }

    let priority = |i: &usize| method_priority(&endpoints[*i].method);
    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    ready.sort_by_key(priority);

    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while !ready.is_empty() {
        let current = ready.remove(0);
        if visited[current] {
            continue;
        }
        visited[current] = true;
        order.push(current);
        for &next in &adjacency[current] {
            if visited[next] {
                continue;
            }
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(next);
            }
        }
        ready.sort_by_key(priority);
    }

    if order.len() < n {
        let mut remaining: Vec<usize> = (0..n).filter(|&i| !visited[i]).collect();
        warn!(
            remaining = remaining.len(),
            "dependency cycle detected, appending remaining endpoints"
        );
        remaining.sort_by_key(priority);
        order.extend(remaining);
    }

    order.into_iter().map(|i| endpoints[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{BodyField, ParameterSpec};

    fn op(method: &str, path: &str) -> OperationSpec {
        OperationSpec {
            path: path.to_string(),
            method: method.to_string(),
            summary: String::new(),
            parameters: Vec::new(),
            body_fields: Vec::new(),
        }
    }

    fn with_param(mut op: OperationSpec, name: &str, location: &str, required: bool) -> OperationSpec {
        op.parameters.push(ParameterSpec {
            name: name.to_string(),
            location: location.to_string(),
            required,
            description: String::new(),
        });
        op
    }

    fn with_body(mut op: OperationSpec, name: &str, required: bool) -> OperationSpec {
        op.body_fields.push(BodyField {
            name: name.to_string(),
            required,
            description: String::new(),
        });
        op
    }

    fn schema(operations: Vec<OperationSpec>) -> ApiSchema {
        ApiSchema {
            operations,
            ..ApiSchema::default()
        }
    }

    fn labels(result: &DependencyAnalysisResult) -> Vec<String> {
        result.sorted_endpoints.iter().map(Endpoint::label).collect()
    }

    /// Verifies the producer of a path id is ordered before its consumer.
    #[test]
    fn create_precedes_read_by_id() {
        let schema = schema(vec![
            op("POST", "/orders"),
            with_param(op("GET", "/orders/{orderId}"), "orderId", "path", true),
        ]);
        let result = DependencyAnalyzer::default().analyze(&schema);

        assert_eq!(result.resources.len(), 1);
        assert_eq!(result.resources[0].name, "orders");
        assert!(result.resources[0].primary_keys.contains("orderId"));
        assert_eq!(labels(&result), vec!["POST /orders", "GET /orders/{orderId}"]);

        let link = &result.dependencies[0];
        assert_eq!(link.confidence, Confidence::High);
        assert_eq!(link.reason, "path parameter of orders");
        assert_eq!(link.producers.len(), 2);
    }

    /// Verifies ordering does not depend on where the producer is declared.
    #[test]
    fn producer_declared_later_still_comes_first() {
        let schema = schema(vec![
            with_param(op("DELETE", "/orders/{orderId}"), "orderId", "path", true),
            with_param(op("GET", "/orders/{orderId}"), "orderId", "path", true),
            op("POST", "/orders"),
        ]);
        let result = DependencyAnalyzer::default().analyze(&schema);
        let order = labels(&result);
        let post = order.iter().position(|l| l == "POST /orders").expect("post");
        let delete = order
            .iter()
            .position(|l| l == "DELETE /orders/{orderId}")
            .expect("delete");
        assert!(post < delete, "{order:?}");
    }

    /// Verifies endpoints without edges are ordered by method priority alone.
    #[test]
    fn tie_break_uses_method_priority() {
        let schema = schema(vec![
            op("HEAD", "/ping"),
            op("POST", "/ping"),
            op("DELETE", "/ping"),
            op("GET", "/ping"),
            op("TRACE", "/ping"),
        ]);
        let result = DependencyAnalyzer::default().analyze(&schema);
        assert!(result.dependencies.is_empty());
        assert_eq!(
            labels(&result),
            vec![
                "GET /ping",
                "POST /ping",
                "DELETE /ping",
                "HEAD /ping",
                "TRACE /ping"
            ]
        );
    }

    /// Verifies cycles keep every endpoint exactly once.
    #[test]
    fn cycles_keep_all_endpoints() {
        // PUT and GET both produce and consume orderId.
        let schema = schema(vec![
            with_param(op("PUT", "/orders/{orderId}"), "orderId", "path", true),
            with_param(op("GET", "/orders/{orderId}"), "orderId", "path", true),
            op("POST", "/status"),
        ]);
        let result = DependencyAnalyzer::default().analyze(&schema);
        assert_eq!(
            labels(&result),
            vec!["POST /status", "GET /orders/{orderId}", "PUT /orders/{orderId}"]
        );
    }

    /// Verifies body fields link to producers with medium or low confidence.
    #[test]
    fn body_fields_link_across_resources() {
        let schema = schema(vec![
            with_body(with_body(op("POST", "/payments"), "order_id", true), "coupon_code", false),
            with_param(op("GET", "/orders/{orderId}"), "orderId", "path", true),
            op("POST", "/orders"),
        ]);
        let result = DependencyAnalyzer::default().analyze(&schema);

        let order_link = result
            .dependencies
            .iter()
            .find(|l| l.field.name == "order_id")
            .expect("order link");
        assert_eq!(order_link.normalized_id, "orderId");
        assert_eq!(order_link.confidence, Confidence::Medium);
        assert_eq!(order_link.reason, "required field order_id");

        let coupon = result
            .dependencies
            .iter()
            .find(|l| l.field.name == "coupon_code")
            .expect("coupon link");
        assert_eq!(coupon.confidence, Confidence::Low);
        assert!(coupon.producers.is_empty());

        let order = labels(&result);
        let create = order.iter().position(|l| l == "POST /orders").expect("create");
        let pay = order.iter().position(|l| l == "POST /payments").expect("pay");
        assert!(create < pay, "{order:?}");
    }

    /// Verifies the link cap truncates and flags the result.
    #[test]
    fn dependency_cap_truncates() {
        let ops = (0..5)
            .map(|i| with_param(op("GET", &format!("/r{i}/{{id}}")), "id", "path", true))
            .collect();
        let result = DependencyAnalyzer::new(3).analyze(&schema(ops));
        assert_eq!(result.dependencies.len(), 3);
        assert!(result.truncated);
        assert_eq!(result.sorted_endpoints.len(), 5);
    }

    /// Verifies an empty schema is an empty result.
    #[test]
    fn empty_schema_is_empty_result() {
        let result = DependencyAnalyzer::default().analyze(&ApiSchema::default());
        assert_eq!(result, DependencyAnalysisResult::default());
    }

    /// Verifies id normalization across naming styles.
    #[test]
    fn normalize_id_styles() {
        assert_eq!(normalize_id("orderId"), "orderId");
        assert_eq!(normalize_id("order_id"), "orderId");
        assert_eq!(normalize_id("OrderID"), "orderId");
        assert_eq!(normalize_id("pkOrderId"), "orderId");
        assert_eq!(normalize_id("id"), "id");
        assert_eq!(normalize_id("uuid"), "id");
        assert_eq!(normalize_id("user_no"), "usernoId");
    }

    /// Verifies id hints and resource inference.
    #[test]
    fn id_hints_and_resource_names() {
        assert!(is_id_like("userId"));
        assert!(is_id_like("ORDER_NO"));
        assert!(is_id_like("promoCode"));
        assert!(!is_id_like("name"));
        assert_eq!(infer_resource_name("/api/line-items/{itemId}"), "line_items");
        assert_eq!(infer_resource_name("/{tenant}"), "root");
        assert_eq!(infer_resource_name("/"), "root");
        assert_eq!(method_priority("get"), 1);
        assert_eq!(method_priority("TRACE"), 99);
    }

    /// Verifies the prompt block lists order, keys and links.
    #[test]
    fn prompt_block_summarizes() {
        let schema = schema(vec![
            op("POST", "/orders"),
            with_param(op("GET", "/orders/{orderId}"), "orderId", "path", true),
        ]);
        let block = DependencyAnalyzer::default()
            .analyze(&schema)
            .to_prompt_block(DEFAULT_PROMPT_LIMIT);
        assert!(block.contains("1. POST /orders"));
        assert!(block.contains("- orders: orderId"));
        assert!(block.contains("GET /orders/{orderId} needs orderId <- POST /orders, GET /orders/{orderId} (high)"));
    }
}
