use crate::args::ToolInvocation;
use crate::error::DispatchError;
use ip_llm::{FunctionCall, ToolDefinition};

pub const LIST_ISSUES: &str = "list_issues";
pub const CREATE_ISSUE_DIALOG: &str = "create_issue_dialog";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub r#type: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// Declaration order is preserved in the generated schema.
    pub parameters: Vec<ParameterSpec>,
    pub required: Vec<String>,
}

impl ToolDeclaration {
    fn new(name: &str, description: &str, parameters: &[(&str, &str)]) -> Self {
        let parameters: Vec<ParameterSpec> = parameters
            .iter()
            .map(|(name, description)| ParameterSpec {
                name: name.to_string(),
                r#type: "string".to_string(),
                description: description.to_string(),
            })
            .collect();
        let required = parameters.iter().map(|p| p.name.clone()).collect();
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            required,
        }
    }

    /// JSON Schema for the declared parameters.
    pub fn parameters_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                serde_json::json!({
                    "type": p.r#type,
                    "description": p.description,
                }),
            );
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }
}

pub fn to_llm_tool_def(declaration: &ToolDeclaration) -> ToolDefinition {
    ToolDefinition {
        name: declaration.name.clone(),
        description: declaration.description.clone(),
        parameters: declaration.parameters_schema(),
    }
}

/// The immutable set of tools offered to the model. Built once at startup and
/// shared by reference with every request.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    declarations: Vec<ToolDeclaration>,
    definitions: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn builtin() -> Self {
        let declarations = vec![
            ToolDeclaration::new(
                LIST_ISSUES,
                "Will return a list of issues in the repository.",
                &[
                    ("repository_owner", "The owner of the repository."),
                    ("repository_name", "The name of the repository."),
                ],
            ),
            ToolDeclaration::new(
                CREATE_ISSUE_DIALOG,
                "Creates a confirmation dialog in which the user can interact with in order to create an issue on a GitHub repository.",
                &[
                    ("repository_owner", "The owner of the repository."),
                    ("repository_name", "The name of the repository."),
                    ("issue_title", "The title of the issue being created."),
                    ("issue_body", "The content of the issue being created."),
                ],
            ),
        ];
        let definitions = declarations.iter().map(to_llm_tool_def).collect();
        Self {
            declarations,
            definitions,
        }
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.declarations
    }

    /// Declarations in the shape the completion gateway expects.
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&ToolDeclaration> {
        self.declarations.iter().find(|d| d.name == name)
    }

    /// Resolve a function call against the registry and decode its arguments.
    pub fn decode(&self, call: &FunctionCall) -> Result<ToolInvocation, DispatchError> {
        let Some(declaration) = self.get(&call.name) else {
            return Err(DispatchError::UnknownTool(call.name.clone()));
        };
        ToolInvocation::decode(&declaration.name, &call.arguments)
    }
}
