//! Provider identifiers.

use serde::{Deserialize, Serialize};

/// Provider type enum for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Ollama,
    Scripted,
}

impl ProviderType {
    /// Parse provider type from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "scripted" | "offline" => Some(Self::Scripted),
            _ => None,
        }
    }

    /// Get the canonical provider name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Scripted => "scripted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_parsing() {
        assert_eq!(ProviderType::parse("ollama"), Some(ProviderType::Ollama));
        assert_eq!(ProviderType::parse(" OLLAMA "), Some(ProviderType::Ollama));
        assert_eq!(ProviderType::parse("offline"), Some(ProviderType::Scripted));
        assert_eq!(ProviderType::parse("openai"), None);
    }

    #[test]
    fn test_as_str_round_trips() {
        for p in [ProviderType::Ollama, ProviderType::Scripted] {
            assert_eq!(ProviderType::parse(p.as_str()), Some(p));
        }
    }
}
