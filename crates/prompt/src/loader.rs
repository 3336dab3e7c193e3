//! Prompt loader for YAML prompt definitions.
//!
//! Workspace definitions in `.sift/prompts/<id>.yml` take precedence over the
//! built-in definitions compiled into the binary.

use crate::types::{PromptDefinition, PromptSource};
use sift_core::{AppError, AppResult};
use std::path::Path;

/// Prompt used by the query analyzer's model strategy.
pub const ANALYSIS_PROMPT_ID: &str = "analysis.extract";

/// Prompt used by the streaming generator.
pub const GENERATION_PROMPT_ID: &str = "generation.answer";

const BUILTIN_PROMPTS: &[(&str, &str)] = &[
    (
        ANALYSIS_PROMPT_ID,
        include_str!("../prompts/analysis.extract.yml"),
    ),
    (
        GENERATION_PROMPT_ID,
        include_str!("../prompts/generation.answer.yml"),
    ),
];

/// Load a prompt definition by ID.
///
/// Searches `<workspace>/.sift/prompts/<id>.yml` first and falls back to the
/// built-in definition with the same ID.
///
/// # Example
/// ```no_run
/// use sift_prompt::load_prompt;
/// use std::path::Path;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (prompt, _source) = load_prompt(Path::new("."), "generation.answer")?;
/// println!("Loaded prompt: {}", prompt.title);
/// # Ok(())
/// # }
/// ```
pub fn load_prompt(
    workspace_path: &Path,
    prompt_id: &str,
) -> AppResult<(PromptDefinition, PromptSource)> {
    let prompt_file = prompts_dir(workspace_path).join(format!("{}.yml", prompt_id));

    if prompt_file.exists() {
        tracing::debug!("Loading prompt from: {:?}", prompt_file);

        let contents = std::fs::read_to_string(&prompt_file).map_err(|e| {
            AppError::Prompt(format!(
                "Failed to read prompt file {:?}: {}",
                prompt_file, e
            ))
        })?;
        let definition = parse_prompt(&contents)
            .map_err(|e| AppError::Prompt(format!("{:?}: {}", prompt_file, e)))?;

        tracing::info!("Loaded prompt: {} ({})", definition.id, definition.title);
        return Ok((definition, PromptSource::Workspace));
    }

    builtin_prompt(prompt_id)
        .map(|def| (def, PromptSource::Builtin))
        .ok_or_else(|| AppError::Prompt(format!("Prompt not found: {}", prompt_id)))
}

/// Parse and validate a built-in definition.
pub fn builtin_prompt(prompt_id: &str) -> Option<PromptDefinition> {
    BUILTIN_PROMPTS
        .iter()
        .find(|(id, _)| *id == prompt_id)
        .and_then(|(id, yaml)| match parse_prompt(yaml) {
            Ok(def) => Some(def),
            Err(e) => {
                tracing::error!("Built-in prompt {} is invalid: {}", id, e);
                None
            }
        })
}

/// List all available prompt IDs with their source, sorted by ID.
///
/// A workspace file shadows the built-in prompt of the same ID.
pub fn list_prompts(workspace_path: &Path) -> AppResult<Vec<(String, PromptSource)>> {
    let mut prompts: Vec<(String, PromptSource)> = Vec::new();
    let dir = prompts_dir(workspace_path);

    if dir.exists() {
        for entry in walkdir::WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("yml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    prompts.push((stem.to_string(), PromptSource::Workspace));
                }
            }
        }
    }

    for (id, _) in BUILTIN_PROMPTS {
        if !prompts.iter().any(|(existing, _)| existing == id) {
            prompts.push((id.to_string(), PromptSource::Builtin));
        }
    }

    prompts.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(prompts)
}

fn prompts_dir(workspace_path: &Path) -> std::path::PathBuf {
    workspace_path.join(".sift/prompts")
}

fn parse_prompt(contents: &str) -> AppResult<PromptDefinition> {
    let definition: PromptDefinition = serde_yaml::from_str(contents)
        .map_err(|e| AppError::Prompt(format!("Failed to parse prompt YAML: {}", e)))?;
    validate_prompt(&definition)?;
    Ok(definition)
}

/// Validate a prompt definition.
fn validate_prompt(def: &PromptDefinition) -> AppResult<()> {
    if def.id.is_empty() {
        return Err(AppError::Prompt("Prompt ID cannot be empty".to_string()));
    }

    if def.title.is_empty() {
        return Err(AppError::Prompt("Prompt title cannot be empty".to_string()));
    }

    if def.template.trim().is_empty() {
        return Err(AppError::Prompt(
            "Prompt template cannot be empty".to_string(),
        ));
    }

    if !def.api_version.contains('.') {
        return Err(AppError::Prompt(format!(
            "Invalid apiVersion format: {}. Expected format: 'x.y'",
            def.api_version
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_prompt(dir: &Path, id: &str, valid: bool) -> PathBuf {
        let prompts_dir = dir.join(".sift/prompts");
        fs::create_dir_all(&prompts_dir).unwrap();

        let content = if valid {
            format!(
                r#"
id: {}
title: "Test Prompt"
apiVersion: "1.0"
createdBy: test
template: "Test template: {{{{query}}}}"
output:
  format: markdown
"#,
                id
            )
        } else {
            "invalid: yaml: content:".to_string()
        };

        let file_path = prompts_dir.join(format!("{}.yml", id));
        fs::write(&file_path, content).unwrap();
        file_path
    }

    #[test]
    fn test_load_workspace_prompt() {
        let temp_dir = TempDir::new().unwrap();
        create_test_prompt(temp_dir.path(), "test.prompt", true);

        let (prompt, source) = load_prompt(temp_dir.path(), "test.prompt").unwrap();
        assert_eq!(prompt.id, "test.prompt");
        assert_eq!(prompt.title, "Test Prompt");
        assert_eq!(source, PromptSource::Workspace);
    }

    #[test]
    fn test_builtin_fallback() {
        let temp_dir = TempDir::new().unwrap();
        let (prompt, source) = load_prompt(temp_dir.path(), GENERATION_PROMPT_ID).unwrap();
        assert_eq!(prompt.id, GENERATION_PROMPT_ID);
        assert_eq!(source, PromptSource::Builtin);
    }

    #[test]
    fn test_builtins_are_valid() {
        for (id, _) in BUILTIN_PROMPTS {
            let def = builtin_prompt(id).unwrap();
            assert_eq!(&def.id, id);
        }
        assert!(builtin_prompt(ANALYSIS_PROMPT_ID)
            .unwrap()
            .template
            .contains("single JSON object"));
    }

    #[test]
    fn test_load_nonexistent_prompt() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_prompt(temp_dir.path(), "nonexistent").is_err());
    }

    #[test]
    fn test_load_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        create_test_prompt(temp_dir.path(), "invalid", false);
        assert!(load_prompt(temp_dir.path(), "invalid").is_err());
    }

    #[test]
    fn test_list_prompts_shadows_builtins() {
        let temp_dir = TempDir::new().unwrap();
        create_test_prompt(temp_dir.path(), "custom", true);
        create_test_prompt(temp_dir.path(), GENERATION_PROMPT_ID, true);

        let prompts = list_prompts(temp_dir.path()).unwrap();
        assert_eq!(
            prompts,
            vec![
                (ANALYSIS_PROMPT_ID.to_string(), PromptSource::Builtin),
                ("custom".to_string(), PromptSource::Workspace),
                (GENERATION_PROMPT_ID.to_string(), PromptSource::Workspace),
            ]
        );
    }
}
