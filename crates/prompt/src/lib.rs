//! Prompt system for sift.
//!
//! This crate provides structured prompt management with:
//! - YAML-based prompt definitions (workspace overrides + built-ins)
//! - Handlebars template rendering

pub mod builder;
pub mod loader;
pub mod types;

// Re-export main types
pub use builder::build_prompt;
pub use loader::{
    builtin_prompt, list_prompts, load_prompt, ANALYSIS_PROMPT_ID, GENERATION_PROMPT_ID,
};
pub use types::{
    BuiltPrompt, BuiltPromptMetadata, PromptBehavior, PromptDefinition, PromptOutputSpec,
    PromptSource,
};
