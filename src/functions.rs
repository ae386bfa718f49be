//! Local functions that pilots can reference by fully-qualified name.
//!
//! Application code populates a [`FunctionRegistry`] once at startup:
//! functions are grouped into [`ToolType`]s (a namespace plus a type name)
//! and types into [`ToolModule`]s.  Pilot configuration then refers to a
//! function purely by its dotted name, e.g. `Acme.Weather.Forecast.GetWeather`,
//! and [`FunctionRegistry::resolve`] binds that name to a callable.
//!
//! Type lookup mirrors a loader search: the exact type name among loaded
//! modules first, then the single loaded module whose name starts with one of
//! the requested namespace prefixes, then a lazily-built module registered
//! under one of those prefixes.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

// ── Function trait ──────────────────────────────────────────

/// A locally invocable function.
#[async_trait]
pub trait ToolFunction: Send + Sync {
    /// JSON Schema object describing the arguments.
    fn parameters(&self) -> Value;

    /// Default description advertised when the pilot does not supply one.
    fn description(&self) -> Option<String> {
        None
    }

    /// Number of declared parameters; used to prefer the simplest overload.
    fn arity(&self) -> usize {
        self.parameters()
            .get("properties")
            .and_then(Value::as_object)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// Invoke with already-parsed JSON arguments.
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

/// Argument type for functions that take nothing.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoArgs {}

/// Adapts a typed async closure into a [`ToolFunction`].
///
/// Arguments are decoded from JSON into `A` (so parameters bind by field
/// name) and the schema is derived from `A` with `schemars`.
pub struct TypedFunction<A, R, F> {
    handler: F,
    description: Option<String>,
    _sig: PhantomData<fn(A) -> R>,
}

/// Wrap `handler` as a [`ToolFunction`].
pub fn typed<A, R, F, Fut>(handler: F) -> TypedFunction<A, R, F>
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    TypedFunction {
        handler,
        description: None,
        _sig: PhantomData,
    }
}

impl<A, R, F> TypedFunction<A, R, F> {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[async_trait]
impl<A, R, F, Fut> ToolFunction for TypedFunction<A, R, F>
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    fn parameters(&self) -> Value {
        let mut schema = serde_json::to_value(schemars::schema_for!(A))
            .unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
            obj.entry("properties")
                .or_insert_with(|| serde_json::json!({}));
        }
        schema
    }

    fn description(&self) -> Option<String> {
        self.description.clone()
    }

    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let args: A = serde_json::from_value(args).context("invalid arguments")?;
        let out = (self.handler)(args).await?;
        Ok(serde_json::to_value(out)?)
    }
}

// ── Types and modules ───────────────────────────────────────

type InstanceFactory = Arc<dyn Fn() -> Arc<dyn ToolFunction> + Send + Sync>;

#[derive(Clone)]
enum Binding {
    /// Shared callable, no per-resolution state.
    Static(Arc<dyn ToolFunction>),
    /// A fresh instance is built for every resolution.
    Instance(InstanceFactory),
}

#[derive(Clone)]
struct MethodEntry {
    name: String,
    arity: usize,
    binding: Binding,
}

/// A named group of functions: the unit a dotted name resolves a type to.
#[derive(Clone)]
pub struct ToolType {
    namespace: String,
    name: String,
    methods: Vec<MethodEntry>,
}

impl ToolType {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// `namespace.Name`, or just `Name` when the namespace is empty.
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Register a function shared by every resolution.
    pub fn with_static(mut self, name: impl Into<String>, function: impl ToolFunction + 'static) -> Self {
        let function: Arc<dyn ToolFunction> = Arc::new(function);
        self.methods.push(MethodEntry {
            name: name.into(),
            arity: function.arity(),
            binding: Binding::Static(function),
        });
        self
    }

    /// Register a function whose receiver is built fresh (via `make`) each
    /// time the name is resolved.
    pub fn with_instance<T, M>(mut self, name: impl Into<String>, make: M) -> Self
    where
        T: ToolFunction + 'static,
        M: Fn() -> T + Send + Sync + 'static,
    {
        let arity = make().arity();
        self.methods.push(MethodEntry {
            name: name.into(),
            arity,
            binding: Binding::Instance(Arc::new(move || Arc::new(make()) as Arc<dyn ToolFunction>)),
        });
        self
    }

    fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods
            .iter()
            .filter(|m| m.name == name)
            .min_by_key(|m| m.arity)
    }
}

/// A named collection of [`ToolType`]s.
#[derive(Clone)]
pub struct ToolModule {
    name: String,
    types: Vec<ToolType>,
}

impl ToolModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
        }
    }

    pub fn with_type(mut self, tool_type: ToolType) -> Self {
        self.types.push(tool_type);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn find_type(&self, full_name: &str) -> Option<&ToolType> {
        self.types.iter().find(|t| t.full_name() == full_name)
    }
}

type ModuleLoader = Box<dyn Fn() -> ToolModule + Send + Sync>;

struct LazyModule {
    name: String,
    load: ModuleLoader,
    loaded: OnceLock<ToolModule>,
}

impl LazyModule {
    fn get(&self) -> &ToolModule {
        self.loaded.get_or_init(|| {
            debug!(module = %self.name, "loading function module");
            (self.load)()
        })
    }
}

// ── Resolution ──────────────────────────────────────────────

/// A dotted method name split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPath {
    pub namespace: String,
    pub type_name: String,
    pub method: String,
}

impl MethodPath {
    /// Split `namespace.Type.Method`.  The namespace may be empty but the
    /// type and method may not.
    pub fn parse(full_name: &str) -> Result<Self> {
        let mut parts: Vec<&str> = full_name.split('.').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::TypeResolution(format!(
                "'{full_name}' is not a fully-qualified method name (expected Namespace.Type.Method)"
            )));
        }
        let method = parts.pop().unwrap_or_default().to_string();
        let type_name = parts.pop().unwrap_or_default().to_string();
        Ok(Self {
            namespace: parts.join("."),
            type_name,
            method,
        })
    }

    pub fn type_full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}.{}", self.namespace, self.type_name)
        }
    }

    /// Cumulative namespace prefixes, shortest first: `A`, `A.B`, `A.B.C`.
    pub fn namespace_layers(&self) -> Vec<String> {
        if self.namespace.is_empty() {
            return Vec::new();
        }
        let mut layers: Vec<String> = Vec::new();
        for segment in self.namespace.split('.') {
            let next = match layers.last() {
                Some(prev) => format!("{prev}.{segment}"),
                None => segment.to_string(),
            };
            layers.push(next);
        }
        layers
    }
}

/// A function bound and ready to invoke.
#[derive(Clone)]
pub struct ResolvedFunction {
    /// The dotted name it was resolved from.
    pub full_name: String,
    /// The bare method name.
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
    /// `false` when the callable was built fresh for this resolution.
    pub is_static: bool,
    pub callable: Arc<dyn ToolFunction>,
}

impl std::fmt::Debug for ResolvedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedFunction")
            .field("full_name", &self.full_name)
            .field("name", &self.name)
            .field("is_static", &self.is_static)
            .finish()
    }
}

/// Every function the process makes available to pilots.
#[derive(Default)]
pub struct FunctionRegistry {
    modules: Vec<ToolModule>,
    lazy: Vec<LazyModule>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&mut self, module: ToolModule) -> &mut Self {
        self.modules.push(module);
        self
    }

    /// Register a single type in a module named after its namespace.
    pub fn register_type(&mut self, tool_type: ToolType) -> &mut Self {
        let module_name = tool_type.namespace.clone();
        match self.modules.iter_mut().find(|m| m.name == module_name) {
            Some(module) => module.types.push(tool_type),
            None => self
                .modules
                .push(ToolModule::new(module_name).with_type(tool_type)),
        }
        self
    }

    /// Register a module that is only built the first time a name under
    /// `name` fails to resolve against the loaded modules.
    pub fn register_lazy_module<F>(&mut self, name: impl Into<String>, load: F) -> &mut Self
    where
        F: Fn() -> ToolModule + Send + Sync + 'static,
    {
        self.lazy.push(LazyModule {
            name: name.into(),
            load: Box::new(load),
            loaded: OnceLock::new(),
        });
        self
    }

    /// Bind a dotted method name to a callable.
    pub fn resolve(&self, full_name: &str) -> Result<ResolvedFunction> {
        let path = MethodPath::parse(full_name)?;
        let tool_type = self.find_type(&path)?;
        let method = tool_type
            .method(&path.method)
            .ok_or_else(|| Error::MethodResolution {
                type_name: tool_type.full_name(),
                method: path.method.clone(),
            })?;

        let (callable, is_static) = match &method.binding {
            Binding::Static(f) => (f.clone(), true),
            Binding::Instance(make) => (make(), false),
        };
        debug!(function = %full_name, is_static, "resolved function");

        Ok(ResolvedFunction {
            full_name: full_name.to_string(),
            name: method.name.clone(),
            description: callable.description(),
            parameters: callable.parameters(),
            is_static,
            callable,
        })
    }

    fn find_type(&self, path: &MethodPath) -> Result<&ToolType> {
        let type_full_name = path.type_full_name();

        if let Some(t) = self.modules.iter().find_map(|m| m.find_type(&type_full_name)) {
            return Ok(t);
        }

        let layers = path.namespace_layers();
        let module = layers
            .iter()
            .rev()
            .find_map(|layer| {
                let mut candidates = self.modules.iter().filter(|m| m.name.starts_with(layer.as_str()));
                match (candidates.next(), candidates.next()) {
                    (Some(only), None) => Some(only),
                    _ => None,
                }
            })
            .or_else(|| {
                layers.iter().rev().find_map(|layer| {
                    self.lazy
                        .iter()
                        .find(|l| l.name == *layer)
                        .map(LazyModule::get)
                })
            })
            .ok_or_else(|| {
                Error::TypeResolution(format!(
                    "no module was found that points to the namespace '{}'",
                    path.namespace
                ))
            })?;

        module.find_type(&type_full_name).ok_or_else(|| {
            Error::TypeResolution(format!(
                "the type {type_full_name} could not be found in module {}",
                module.name
            ))
        })
    }
}
