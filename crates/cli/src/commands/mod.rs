//! Command handlers for the sift CLI.
//!
//! This module organizes all CLI commands into separate submodules.

pub mod ask;
pub mod prompts;
pub mod render;

// Re-export command types for convenience
pub use ask::AskCommand;
pub use prompts::PromptsCommand;
pub use render::RenderCommand;
