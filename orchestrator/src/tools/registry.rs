//! Closed tool registry.
//!
//! Tools are registered once at startup; each entry carries its
//! parameter schema and approval flag as data, checked at registration
//! time rather than re-derived per call. The underlying operations are
//! pluggable [`ToolOp`] implementations dispatched by id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

/// Parameter kinds a tool schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    fn type_name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamField {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

impl ParamField {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: description.into(),
        }
    }
}

/// Declared parameter schema for one tool.
#[derive(Debug, Clone, Default)]
pub struct ParamsSchema {
    pub fields: Vec<ParamField>,
}

impl ParamsSchema {
    pub fn new(fields: Vec<ParamField>) -> Self {
        Self { fields }
    }

    /// Check `params` against the declared fields. Unknown keys are
    /// rejected; a tool only ever sees parameters it declared.
    pub fn validate(&self, params: &Value) -> Result<(), String> {
        let Some(object) = params.as_object() else {
            return Err("parameters must be a JSON object".into());
        };
        for field in &self.fields {
            match object.get(&field.name) {
                None if field.required => {
                    return Err(format!("missing required parameter '{}'", field.name));
                }
                Some(value) if !field.kind.matches(value) => {
                    return Err(format!(
                        "parameter '{}' must be of type {}",
                        field.name,
                        field.kind.type_name()
                    ));
                }
                _ => {}
            }
        }
        for key in object.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                return Err(format!("unknown parameter '{key}'"));
            }
        }
        Ok(())
    }

    /// JSON Schema rendering, for capability manifests and prompts.
    pub fn as_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|f| {
                (
                    f.name.clone(),
                    json!({ "type": f.kind.type_name(), "description": f.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        json!({ "type": "object", "properties": properties, "required": required })
    }
}

/// The operation behind a tool. Pluggable seam: the orchestrator
/// dispatches to it but does not know what it does.
#[async_trait]
pub trait ToolOp: Send + Sync {
    async fn run(&self, params: &Value) -> anyhow::Result<Value>;
}

/// One registered tool: identity, schema, approval flag, deadline, op.
#[derive(Clone)]
pub struct ToolSpec {
    pub id: String,
    pub description: String,
    pub params: ParamsSchema,
    /// Risky tools block on the approval gate before executing.
    pub requires_approval: bool,
    pub timeout: Duration,
    pub op: Arc<dyn ToolOp>,
}

impl ToolSpec {
    pub fn new(
        id: &str,
        description: &str,
        params: ParamsSchema,
        requires_approval: bool,
        timeout: Duration,
        op: Arc<dyn ToolOp>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            params,
            requires_approval,
            timeout,
            op,
        }
    }
}

/// Registry of every tool the orchestrator can dispatch. Built once at
/// startup; closed thereafter.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails on a duplicate id or an empty schema
    /// field name, so a bad registration is caught at startup rather
    /// than on first call.
    pub fn register(&mut self, spec: ToolSpec) -> anyhow::Result<()> {
        if spec.id.trim().is_empty() {
            anyhow::bail!("tool id cannot be empty");
        }
        if self.tools.contains_key(&spec.id) {
            anyhow::bail!("tool '{}' is already registered", spec.id);
        }
        if spec.params.fields.iter().any(|f| f.name.trim().is_empty()) {
            anyhow::bail!("tool '{}' declares a parameter with an empty name", spec.id);
        }
        self.tools.insert(spec.id.clone(), spec);
        Ok(())
    }

    /// Build a registry from a list of specs, failing on the first bad
    /// one.
    pub fn with_tools(specs: Vec<ToolSpec>) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolSpec> {
        self.tools.get(tool_id)
    }

    pub fn tool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// Built-in ops
// ============================================================================

/// Reads a file under a fixed root directory. Path containment is
/// enforced; requests outside the root are refused.
pub struct ContextReadOp {
    root: PathBuf,
}

impl ContextReadOp {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ToolOp for ContextReadOp {
    async fn run(&self, params: &Value) -> anyhow::Result<Value> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'path' parameter"))?;

        let resolved = self.root.join(path);
        let canonical = tokio::fs::canonicalize(&resolved)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read '{path}': {e}"))?;
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| anyhow::anyhow!("context root unavailable: {e}"))?;
        if !canonical.starts_with(&root) {
            anyhow::bail!("cannot read files outside the context root");
        }

        let content = tokio::fs::read_to_string(&canonical).await?;
        Ok(json!({ "path": path, "content": content }))
    }
}

/// Schema for [`ContextReadOp`].
pub fn context_read_schema() -> ParamsSchema {
    ParamsSchema::new(vec![ParamField::required(
        "path",
        ParamKind::String,
        "Path of the context file to read, relative to the context root",
    )])
}

/// Placeholder op for tools whose real operation lives in the embedder.
/// Declaring the id and schema up front keeps the capability surface
/// stable; running one is an error until the embedder wires it.
pub struct UnwiredOp {
    tool_id: String,
}

impl UnwiredOp {
    pub fn new(tool_id: &str) -> Self {
        Self {
            tool_id: tool_id.into(),
        }
    }
}

#[async_trait]
impl ToolOp for UnwiredOp {
    async fn run(&self, _params: &Value) -> anyhow::Result<Value> {
        anyhow::bail!("no operation is wired for '{}'", self.tool_id)
    }
}

/// The stock tool set. `context.read` is fully wired against
/// `context_root`; the rest declare their schemas and approval flags
/// here and take their operations from the embedder. The `pipeline.*`
/// tools mutate repository state and require approval.
pub fn standard_tools(context_root: impl Into<PathBuf>, timeout: Duration) -> Vec<ToolSpec> {
    let entity_schema = ParamsSchema::new(vec![ParamField::required(
        "entity_id",
        ParamKind::String,
        "Identifier of the entity",
    )]);
    let pipeline_schema = ParamsSchema::new(vec![ParamField::optional(
        "target",
        ParamKind::String,
        "Pipeline target to operate on; defaults to the whole repository",
    )]);
    let unwired = |id: &str, description: &str, params: ParamsSchema, approval: bool| {
        ToolSpec::new(
            id,
            description,
            params,
            approval,
            timeout,
            Arc::new(UnwiredOp::new(id)),
        )
    };

    vec![
        ToolSpec::new(
            "context.read",
            "Read one context file",
            context_read_schema(),
            false,
            timeout,
            Arc::new(ContextReadOp::new(context_root)),
        ),
        unwired(
            "context.search",
            "Search the context repository",
            ParamsSchema::new(vec![
                ParamField::required("query", ParamKind::String, "Search query"),
                ParamField::optional("limit", ParamKind::Integer, "Maximum number of results"),
            ]),
            false,
        ),
        unwired(
            "entity.details",
            "Fetch details for one entity",
            entity_schema.clone(),
            false,
        ),
        unwired(
            "entity.similar",
            "Find entities similar to the given one",
            entity_schema,
            false,
        ),
        unwired(
            "pipeline.validate",
            "Validate the repository pipeline",
            pipeline_schema.clone(),
            true,
        ),
        unwired(
            "pipeline.build-graph",
            "Build the repository dependency graph",
            pipeline_schema.clone(),
            true,
        ),
        unwired(
            "pipeline.impact",
            "Compute the impact of pending changes",
            pipeline_schema.clone(),
            true,
        ),
        unwired(
            "pipeline.generate",
            "Generate derived artifacts from the pipeline",
            pipeline_schema,
            true,
        ),
    ]
}
