use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::errors::AgentResult;
use crate::models::content::ImageContent;
use crate::models::tool::Tool;
use crate::providers::utils::sanitize_function_name;

/// Identity of the run a tool call belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    pub correlation_id: String,
}

impl ToolContext {
    pub fn new<S: Into<String>>(correlation_id: S) -> Self {
        Self {
            correlation_id: correlation_id.into(),
        }
    }
}

/// What a handler hands back: a structured value for the model, plus any
/// images that have to be delivered as ordinary message parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    pub images: Vec<ImageContent>,
}

impl ToolOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            images: Vec::new(),
        }
    }

    pub fn with_image<S: Into<String>, T: Into<String>>(mut self, data: S, mime_type: T) -> Self {
        self.images.push(ImageContent::new(data, mime_type));
        self
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        ToolOutput::new(value)
    }
}

/// An application capability the model can invoke
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, ctx: ToolContext) -> AgentResult<ToolOutput>;
}

/// Adapts an async closure into a [`ToolHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = AgentResult<ToolOutput>> + Send,
{
    async fn call(&self, arguments: Value, ctx: ToolContext) -> AgentResult<ToolOutput> {
        (self.f)(arguments, ctx).await
    }
}

/// Tool definitions and their handlers, keyed by name. Built at startup and
/// shared read-only between runs.
///
/// Backends only accept names matching `[a-zA-Z0-9_-]+`, so a tool is
/// advertised under its sanitized name and calls come back under that name.
/// Lookups resolve both forms.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    /// sanitized name -> registered name, for names that differ
    aliases: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the tool's name, replacing any earlier one
    pub fn register<H: ToolHandler + 'static>(&mut self, tool: Tool, handler: H) {
        if self.handlers.contains_key(&tool.name) {
            tracing::warn!(tool = %tool.name, "replacing previously registered tool");
            self.tools.retain(|t| t.name != tool.name);
        }

        let sanitized = sanitize_function_name(&tool.name);
        if sanitized != tool.name {
            match self.aliases.get(&sanitized) {
                Some(existing) if *existing != tool.name => {
                    tracing::warn!(
                        tool = %tool.name,
                        other = %existing,
                        "sanitized tool name collides, keeping the first"
                    );
                }
                _ => {
                    self.aliases.insert(sanitized, tool.name.clone());
                }
            }
        }

        self.handlers.insert(tool.name.clone(), Arc::new(handler));
        self.tools.push(tool);
    }

    pub fn register_fn<F, Fut>(&mut self, tool: Tool, f: F)
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AgentResult<ToolOutput>> + Send + 'static,
    {
        self.register(tool, FnHandler { f });
    }

    /// Find a handler by its registered name or by the sanitized name it
    /// was advertised under
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers
            .get(name)
            .or_else(|| {
                self.aliases
                    .get(name)
                    .and_then(|registered| self.handlers.get(registered))
            })
            .cloned()
    }

    /// Definitions in registration order, as offered to the model
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentError;
    use serde_json::json;

    fn rename_tool() -> Tool {
        Tool::new(
            "renameBoard",
            "Renames the board",
            json!({"type": "object", "properties": {"name": {"type": "string"}}}),
        )
    }

    #[tokio::test]
    async fn test_register_fn_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(rename_tool(), |args, ctx| async move {
            let name = args["name"]
                .as_str()
                .ok_or_else(|| AgentError::InvalidParameters("name is required".into()))?;
            Ok(ToolOutput::new(json!({"renamed": name, "by": ctx.correlation_id})))
        });

        let handler = registry.lookup("renameBoard").unwrap();
        let output = handler
            .call(json!({"name": "Roadmap"}), ToolContext::new("run-1"))
            .await
            .unwrap();
        assert_eq!(output.value, json!({"renamed": "Roadmap", "by": "run-1"}));

        let err = handler
            .call(json!({}), ToolContext::new("run-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidParameters(_)));
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn test_reregistering_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(rename_tool(), |_, _| async { Ok(json!(1).into()) });
        registry.register_fn(rename_tool(), |_, _| async { Ok(json!(2).into()) });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tools()[0].name, "renameBoard");
    }

    #[tokio::test]
    async fn test_lookup_by_advertised_name() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            Tool::new("board.add", "Adds a shape", json!({"type": "object"})),
            |_, _| async { Ok(ToolOutput::new(json!("added"))) },
        );

        let advertised = sanitize_function_name("board.add");
        assert_eq!(advertised, "board_add");
        let handler = registry.lookup(&advertised).unwrap();
        let output = handler.call(json!({}), ToolContext::new("run")).await.unwrap();
        assert_eq!(output.value, json!("added"));
        assert!(registry.lookup("board.add").is_some());
    }

    #[test]
    fn test_exact_name_wins_over_alias() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            Tool::new("board.add", "Adds a shape", json!({"type": "object"})),
            |_, _| async { Ok(ToolOutput::new(json!("dotted"))) },
        );
        registry.register_fn(
            Tool::new("board_add", "Adds a shape", json!({"type": "object"})),
            |_, _| async { Ok(ToolOutput::new(json!("plain"))) },
        );
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup("board_add").is_some());
        assert!(registry.lookup("board.add").is_some());
    }

    #[test]
    fn test_tool_output_images() {
        let output = ToolOutput::new(json!("rendered")).with_image("aGk=", "image/png");
        assert_eq!(output.images.len(), 1);
        assert_eq!(output.images[0].mime_type, "image/png");
    }
}
