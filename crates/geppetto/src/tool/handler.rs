//! Tool handlers, the [`Toolbox`] seam, and the default registry.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use super::{ToolDefinition, ToolError};
use crate::context::InferenceContext;

/// A boxed, sendable tool execution.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// Executes tools by name. This is what the tool loop talks to.
///
/// [`ToolRegistry`] is the standard implementation; implement this
/// directly to route calls elsewhere (a remote tool server, a sandbox).
pub trait Toolbox: Send + Sync {
    /// Runs `name` with `arguments`.
    ///
    /// `ctx` is cancelled when the per-call timeout elapses or the
    /// surrounding inference is cancelled.
    fn execute_tool<'a>(
        &'a self,
        ctx: &'a InferenceContext,
        name: &'a str,
        arguments: Value,
    ) -> ToolFuture<'a>;

    /// Every tool this toolbox can run.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;
}

/// A single tool.
///
/// The trait is object-safe (boxed futures) so handlers can be stored
/// as `Arc<dyn ToolHandler>`. For simple tools use [`tool_fn`].
pub trait ToolHandler: Send + Sync {
    /// Name, description and parameter schema.
    fn definition(&self) -> ToolDefinition;

    /// Runs the tool with parsed JSON arguments.
    fn execute<'a>(&'a self, ctx: &'a InferenceContext, input: Value) -> ToolFuture<'a>;
}

/// A tool handler backed by an async closure. Created by [`tool_fn`].
pub struct FnToolHandler<F> {
    definition: ToolDefinition,
    handler: F,
}

impl<F> std::fmt::Debug for FnToolHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnToolHandler")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}

impl<F, Fut, O> ToolHandler for FnToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<Value> + Send + 'static,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn execute<'a>(&'a self, _ctx: &'a InferenceContext, input: Value) -> ToolFuture<'a> {
        let fut = (self.handler)(input);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}

/// Creates a [`ToolHandler`] from an async closure.
///
/// The closure receives the parsed arguments and returns anything that
/// converts into a JSON value.
///
/// ```rust
/// use geppetto::tool::{ToolDefinition, ToolError, ToolRegistry, tool_fn};
/// use serde_json::{Value, json};
///
/// let mut registry = ToolRegistry::new();
/// registry.register(tool_fn(
///     ToolDefinition::new("add", "Add two numbers"),
///     |input: Value| async move {
///         let a = input["a"].as_f64().unwrap_or(0.0);
///         let b = input["b"].as_f64().unwrap_or(0.0);
///         Ok::<_, ToolError>(json!(a + b))
///     },
/// ));
/// assert!(registry.contains("add"));
/// ```
pub fn tool_fn<F, Fut, O>(definition: ToolDefinition, handler: F) -> FnToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    O: Into<Value> + Send + 'static,
{
    FnToolHandler {
        definition,
        handler,
    }
}

/// Tools by name.
///
/// Cloning is cheap; handlers are shared.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any tool with the same name.
    pub fn register(&mut self, handler: impl ToolHandler + 'static) -> &mut Self {
        self.register_shared(Arc::new(handler))
    }

    /// Registers a shared handler.
    pub fn register_shared(&mut self, handler: Arc<dyn ToolHandler>) -> &mut Self {
        let name = handler.definition().name;
        debug!(tool = %name, "registering tool");
        self.handlers.insert(name, handler);
        self
    }

    /// The handler for `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.get(name)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Definitions of all tools, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.handlers.values().map(|h| h.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of tools.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// A registry with only the named tools.
    #[must_use]
    pub fn only<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Self {
        let include: HashSet<&str> = names.into_iter().collect();
        self.filtered(|name| include.contains(name))
    }

    /// A registry without the named tools.
    #[must_use]
    pub fn without<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Self {
        let exclude: HashSet<&str> = names.into_iter().collect();
        self.filtered(|name| !exclude.contains(name))
    }

    fn filtered(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self {
            handlers: self
                .handlers
                .iter()
                .filter(|(name, _)| keep(name))
                .map(|(name, h)| (name.clone(), Arc::clone(h)))
                .collect(),
        }
    }
}

impl Toolbox for ToolRegistry {
    #[instrument(skip_all, fields(tool = %name))]
    fn execute_tool<'a>(
        &'a self,
        ctx: &'a InferenceContext,
        name: &'a str,
        arguments: Value,
    ) -> ToolFuture<'a> {
        let Some(handler) = self.handlers.get(name) else {
            return Box::pin(std::future::ready(Err(ToolError::NotFound(name.to_string()))));
        };
        #[cfg(feature = "schema")]
        if let Err(e) = handler.definition().validate_arguments(&arguments) {
            debug!(error = %e, "rejecting tool arguments");
            return Box::pin(std::future::ready(Err(e)));
        }
        handler.execute(ctx, arguments)
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.definitions()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(tool_fn(ToolDefinition::new("echo", "Echo"), |input: Value| async move {
                Ok::<_, ToolError>(input)
            }))
            .register(tool_fn(ToolDefinition::new("fail", "Fails"), |_input: Value| async move {
                Err::<Value, _>(ToolError::new("boom"))
            }));
        registry
    }

    #[tokio::test]
    async fn test_execute_registered_tool() {
        let ctx = InferenceContext::new();
        let out = registry()
            .execute_tool(&ctx, "echo", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let ctx = InferenceContext::new();
        let err = registry()
            .execute_tool(&ctx, "nope", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::NotFound("nope".into()));
        assert_eq!(err.result_text(), "Error: tool not found");
    }

    #[tokio::test]
    async fn test_tool_error_passes_through() {
        let ctx = InferenceContext::new();
        let err = registry()
            .execute_tool(&ctx, "fail", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_definitions_sorted() {
        let names: Vec<_> = registry().definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo", "fail"]);
    }

    #[test]
    fn test_only_and_without() {
        let r = registry();
        assert_eq!(r.only(["echo"]).names(), vec!["echo"]);
        assert_eq!(r.without(["echo"]).names(), vec!["fail"]);
        assert_eq!(r.len(), 2);
    }
}
