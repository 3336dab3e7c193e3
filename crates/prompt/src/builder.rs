//! Prompt builder for rendering templates.

use crate::types::{BuiltPrompt, BuiltPromptMetadata, PromptDefinition};
use handlebars::Handlebars;
use sift_core::{AppError, AppResult};
use std::collections::HashMap;

/// Build a prompt from a definition and input variables.
///
/// Renders the template with Handlebars (HTML escaping disabled) and carries
/// the definition's system message through unchanged.
///
/// # Example
/// ```no_run
/// use sift_prompt::{build_prompt, PromptDefinition};
/// use std::collections::HashMap;
///
/// # fn example(def: PromptDefinition) -> Result<(), Box<dyn std::error::Error>> {
/// let mut vars = HashMap::new();
/// vars.insert("query".to_string(), "Which laptop has the longest battery life?".to_string());
///
/// let built = build_prompt(&def, vars)?;
/// println!("User prompt: {}", built.user);
/// # Ok(())
/// # }
/// ```
pub fn build_prompt(
    definition: &PromptDefinition,
    variables: HashMap<String, String>,
) -> AppResult<BuiltPrompt> {
    tracing::debug!("Building prompt: {}", definition.id);

    let user = render_template(&definition.template, &variables)?;

    Ok(BuiltPrompt {
        system: definition.system.clone(),
        user,
        metadata: BuiltPromptMetadata {
            source_prompt_id: definition.id.clone(),
            output_format: definition.output.format.clone(),
            resolved_variables: variables,
        },
    })
}

/// Render a Handlebars template with variables.
fn render_template(template: &str, variables: &HashMap<String, String>) -> AppResult<String> {
    let mut handlebars = Handlebars::new();

    // Prompts are plain text
    handlebars.register_escape_fn(handlebars::no_escape);

    handlebars
        .register_template_string("prompt", template)
        .map_err(|e| AppError::Prompt(format!("Failed to register template: {}", e)))?;

    handlebars
        .render("prompt", variables)
        .map_err(|e| AppError::Prompt(format!("Failed to render template: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{builtin_prompt, ANALYSIS_PROMPT_ID, GENERATION_PROMPT_ID};
    use crate::types::{PromptBehavior, PromptOutputSpec};

    fn create_test_definition(template: &str) -> PromptDefinition {
        PromptDefinition {
            id: "test.prompt".to_string(),
            title: "Test".to_string(),
            api_version: "1.0".to_string(),
            created_by: "test".to_string(),
            behavior: PromptBehavior::default(),
            system: Some("System message".to_string()),
            template: template.to_string(),
            output: PromptOutputSpec {
                format: "markdown".to_string(),
            },
        }
    }

    #[test]
    fn test_render_does_not_escape() {
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), "<X> & \"Y\"".to_string());

        let result = render_template("Question: {{query}}", &vars).unwrap();
        assert_eq!(result, "Question: <X> & \"Y\"");
    }

    #[test]
    fn test_build_prompt_carries_system() {
        let def = create_test_definition("Question: {{query}}");
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), "Test question".to_string());

        let built = build_prompt(&def, vars).unwrap();
        assert_eq!(built.user, "Question: Test question");
        assert_eq!(built.system.as_deref(), Some("System message"));
        assert_eq!(built.metadata.source_prompt_id, "test.prompt");
        assert_eq!(built.metadata.output_format, "markdown");
    }

    #[test]
    fn test_invalid_template_is_prompt_error() {
        let def = create_test_definition("{{#if query}}unclosed");
        let result = build_prompt(&def, HashMap::new());
        assert!(matches!(result, Err(AppError::Prompt(_))));
    }

    #[test]
    fn test_builtin_analysis_prompt_omits_empty_vocabulary() {
        let def = builtin_prompt(ANALYSIS_PROMPT_ID).unwrap();
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), "compare A and B".to_string());
        vars.insert("vocabulary".to_string(), String::new());

        let built = build_prompt(&def, vars).unwrap();
        assert!(built.user.contains("Question: compare A and B"));
        assert!(!built.user.contains("Known entity names"));
    }

    #[test]
    fn test_builtin_generation_prompt_renders_context() {
        let def = builtin_prompt(GENERATION_PROMPT_ID).unwrap();
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), "What is A?".to_string());
        vars.insert("context".to_string(), "[1] A: price=10".to_string());
        vars.insert("language".to_string(), "en".to_string());

        let built = build_prompt(&def, vars).unwrap();
        assert!(built.user.contains("[1] A: price=10"));
        assert!(!built.user.contains("No matching records"));
    }
}
