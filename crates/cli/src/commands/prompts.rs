//! Prompts command handler.

use clap::Args;
use sift_core::config::AppConfig;
use sift_prompt::{list_prompts, PromptSource};

/// List available prompt definitions
#[derive(Args, Debug)]
pub struct PromptsCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl PromptsCommand {
    pub fn execute(&self, config: &AppConfig) -> anyhow::Result<()> {
        tracing::info!("Executing prompts command");

        let prompts = list_prompts(&config.workspace)?;

        if self.json {
            let output: Vec<_> = prompts
                .iter()
                .map(|(id, source)| serde_json::json!({ "id": id, "source": source }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            for (id, source) in &prompts {
                let origin = match source {
                    PromptSource::Workspace => "workspace",
                    PromptSource::Builtin => "built-in",
                };
                println!("{:<24} {}", id, origin);
            }
        }

        Ok(())
    }
}
