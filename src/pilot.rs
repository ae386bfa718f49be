//! Pilot definitions: named behavioural profiles an assistant is built from.

use serde::{Deserialize, Serialize};

use crate::api::{FileSearchResources, ToolResources};
use crate::error::Result;
use crate::tools::{ToolDispatcher, ToolSpec};

/// Model used when a pilot does not name one.
pub const DEFAULT_MODEL: &str = "gpt-4o";

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PilotResponseFormat {
    #[default]
    Text,
    Json,
}

/// Tools the remote service provides itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinTool {
    FileSearch,
    CodeInterpreter,
}

impl From<BuiltinTool> for ToolSpec {
    fn from(tool: BuiltinTool) -> Self {
        match tool {
            BuiltinTool::FileSearch => ToolSpec::FileSearch,
            BuiltinTool::CodeInterpreter => ToolSpec::CodeInterpreter,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    #[default]
    Function,
    FileSearch,
    CodeInterpreter,
}

/// A reference to a local function by its dotted name
/// (`Namespace.Type.Method`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionRef {
    #[serde(rename = "method", default)]
    pub method_full_name: String,
    /// Overrides the description the function itself provides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: FunctionKind,
}

impl FunctionRef {
    pub fn function(method_full_name: impl Into<String>) -> Self {
        Self {
            method_full_name: method_full_name.into(),
            description: None,
            kind: FunctionKind::Function,
        }
    }

    pub fn builtin(kind: FunctionKind) -> Self {
        Self {
            method_full_name: String::new(),
            description: None,
            kind,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PilotDefinition {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub response_format: PilotResponseFormat,
    #[serde(default, rename = "tools")]
    pub builtin_tools: Vec<BuiltinTool>,
    #[serde(default)]
    pub functions: Vec<FunctionRef>,
    #[serde(default)]
    pub vector_store_ids: Vec<String>,
    /// Descriptors produced by [`compile_tools`](Self::compile_tools).
    #[serde(skip)]
    compiled: Vec<ToolSpec>,
}

impl PilotDefinition {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            description: description.into(),
            model: default_model(),
            response_format: PilotResponseFormat::Text,
            builtin_tools: Vec::new(),
            functions: Vec::new(),
            vector_store_ids: Vec::new(),
            compiled: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_json_responses(mut self) -> Self {
        self.response_format = PilotResponseFormat::Json;
        self
    }

    pub fn with_tool(mut self, tool: BuiltinTool) -> Self {
        self.builtin_tools.push(tool);
        self
    }

    pub fn with_function(mut self, function: FunctionRef) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_vector_store(mut self, id: impl Into<String>) -> Self {
        self.vector_store_ids.push(id.into());
        self
    }

    pub fn is_json(&self) -> bool {
        self.response_format == PilotResponseFormat::Json
    }

    /// Resolve every function reference and rebuild the tool list.
    ///
    /// Duplicate descriptors (e.g. `file_search` listed both as a built-in
    /// tool and as a function kind) are collapsed.
    pub fn compile_tools(&mut self, dispatcher: &ToolDispatcher) -> Result<()> {
        let mut tools: Vec<ToolSpec> = Vec::new();
        let builtins = self.builtin_tools.iter().map(|t| Ok(ToolSpec::from(*t)));
        let functions = self.functions.iter().map(|f| dispatcher.build_tool(f));
        for spec in builtins.chain(functions) {
            let spec = spec?;
            if !tools.contains(&spec) {
                tools.push(spec);
            }
        }
        self.compiled = tools;
        Ok(())
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.compiled
    }

    /// `file_search` resources, or `None` when the pilot has no vector stores.
    pub fn tool_resources(&self) -> Option<ToolResources> {
        if self.vector_store_ids.is_empty() {
            return None;
        }
        Some(ToolResources {
            file_search: Some(FileSearchResources {
                vector_store_ids: self.vector_store_ids.clone(),
            }),
        })
    }

    pub fn to_description(&self) -> PilotDescription {
        PilotDescription {
            name: self.name.clone(),
            description: self.description.clone(),
            instructions: self.instructions.clone(),
            model: self.model.clone(),
            function_descriptions: self
                .compiled
                .iter()
                .filter_map(|t| match t {
                    ToolSpec::Function { function } => Some(FunctionDescription {
                        name: function.name.clone(),
                        description: function.description.clone().unwrap_or_default(),
                    }),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// Summary of a pilot handed to the dispatcher assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PilotDescription {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub model: String,
    pub function_descriptions: Vec<FunctionDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionDescription {
    pub name: String,
    pub description: String,
}
