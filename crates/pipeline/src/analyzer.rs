//! Phase 1: query analysis.
//!
//! Strategies run in order and the first one that accepts the query wins:
//! a deterministic pattern matcher over the known entity vocabulary, then a
//! single structured-extraction model call. When neither accepts, a
//! conservative default is returned, so analysis never fails.

use crate::cache::{normalize_query, normalize_terms, PhaseCache};
use crate::types::{Analysis, Complexity, Confidence, Intent};
use futures::StreamExt;
use serde::Deserialize;
use sift_core::{AppError, AppResult};
use sift_llm::{LlmClient, LlmRequest};
use sift_prompt::{build_prompt, PromptDefinition};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

const COMPARE_CUES: &[&str] = &[
    "compare",
    "comparison",
    " vs ",
    " vs. ",
    "versus",
    "difference between",
    "differences between",
    "better than",
    "which is better",
];

const RECOMMEND_CUES: &[&str] = &[
    "recommend",
    "suggest",
    "should i buy",
    "should i get",
    "best ",
    "looking for",
    "good for",
];

const SPEC_CUES: &[&str] = &[
    "spec",
    "specification",
    "how much",
    "how long",
    "how heavy",
    "how big",
    "what is the",
    "what's the",
    "does it have",
];

/// Attributes recognized as key features, with the words that signal them.
const FEATURE_CUES: &[(&str, &[&str])] = &[
    ("price", &["price", "cost", "cheap", "expensive", "budget"]),
    ("battery", &["battery", "runtime"]),
    ("weight", &["weight", "heavy", "light", "weigh"]),
    ("display", &["display", "screen", "resolution"]),
    ("storage", &["storage", "ssd", "disk"]),
    ("memory", &["memory", "ram"]),
    ("performance", &["performance", "fast", "speed", "cpu", "processor"]),
    ("camera", &["camera", "photo"]),
    ("warranty", &["warranty", "guarantee"]),
    ("size", &["size", "dimensions"]),
];

/// One way of producing an `Analysis`.
#[async_trait::async_trait]
pub trait AnalysisStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Some` when the strategy is confident enough to stop the chain.
    async fn analyze(&self, query: &str, vocabulary: &[String]) -> Option<Analysis>;
}

/// Keyword and vocabulary matcher. Accepts only high-confidence results.
#[derive(Debug, Default)]
pub struct PatternMatcher;

impl PatternMatcher {
    /// Analyze without the acceptance threshold.
    pub fn inspect(&self, query: &str, vocabulary: &[String]) -> Analysis {
        let lower = format!(" {} ", query.to_lowercase());
        let entities = find_entities(&lower, vocabulary);

        let intent = if contains_any(&lower, COMPARE_CUES) {
            Intent::Compare
        } else if contains_any(&lower, RECOMMEND_CUES) {
            Intent::Recommend
        } else if contains_any(&lower, SPEC_CUES) {
            Intent::SpecQuery
        } else {
            Intent::General
        };

        let key_features: BTreeSet<String> = FEATURE_CUES
            .iter()
            .filter(|(_, cues)| cues.iter().any(|c| contains_word(&lower, c)))
            .map(|(feature, _)| feature.to_string())
            .collect();

        let word_count = query.split_whitespace().count();
        let complexity = if entities.len() >= 3 || word_count > 25 {
            Complexity::Complex
        } else if entities.len() == 2 || key_features.len() >= 2 {
            Complexity::Medium
        } else {
            Complexity::Simple
        };

        let confidence = match (intent, entities.len()) {
            (Intent::Compare, n) if n >= 2 => Confidence::High,
            (Intent::Compare, _) => Confidence::Medium,
            (Intent::General, 0) => Confidence::Low,
            (Intent::General, _) => Confidence::Medium,
            (_, n) if n >= 1 => Confidence::High,
            _ => Confidence::Medium,
        };

        let focus = if key_features.is_empty() {
            query.trim().to_string()
        } else {
            key_features
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };

        Analysis {
            intent,
            entities,
            key_features,
            focus,
            complexity,
            confidence,
            from_cache: false,
            strategy: self.name().to_string(),
        }
    }
}

#[async_trait::async_trait]
impl AnalysisStrategy for PatternMatcher {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn analyze(&self, query: &str, vocabulary: &[String]) -> Option<Analysis> {
        let analysis = self.inspect(query, vocabulary);
        (analysis.confidence == Confidence::High).then_some(analysis)
    }
}

/// Structured extraction through one model call.
pub struct LlmExtractor {
    client: Arc<dyn LlmClient>,
    model: String,
    prompt: PromptDefinition,
    timeout: Duration,
}

impl LlmExtractor {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
        prompt: PromptDefinition,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            prompt,
            timeout,
        }
    }

    async fn extract(&self, query: &str, vocabulary: &[String]) -> AppResult<Analysis> {
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), query.to_string());
        vars.insert("vocabulary".to_string(), vocabulary.join(", "));
        let built = build_prompt(&self.prompt, vars)?;

        let mut request = LlmRequest::new(built.user, self.model.clone()).with_temperature(0.0);
        if let Some(system) = built.system {
            request = request.with_system(system);
        }

        let text = tokio::time::timeout(self.timeout, complete_text(self.client.clone(), request))
            .await
            .map_err(|_| AppError::Timeout("analysis model call".to_string()))??;

        parse_analysis(&text, query)
    }
}

#[async_trait::async_trait]
impl AnalysisStrategy for LlmExtractor {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn analyze(&self, query: &str, vocabulary: &[String]) -> Option<Analysis> {
        match self.extract(query, vocabulary).await {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                tracing::warn!("LLM analysis unavailable: {}", e);
                None
            }
        }
    }
}

/// Get a whole completion through whichever call shape the client offers.
async fn complete_text(client: Arc<dyn LlmClient>, request: LlmRequest) -> AppResult<String> {
    let caps = client.capabilities();
    if caps.completion {
        return Ok(client.complete(&request).await?.content);
    }
    if caps.blocking {
        let response = tokio::task::spawn_blocking(move || client.complete_blocking(&request))
            .await
            .map_err(|e| AppError::Llm(format!("blocking completion panicked: {}", e)))??;
        return Ok(response.content);
    }
    if caps.streaming {
        let mut stream = client.stream(&request).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            text.push_str(&chunk.content);
            if chunk.done {
                break;
            }
        }
        return Ok(text);
    }
    Err(AppError::Unsupported(format!(
        "{} offers no completion call",
        client.provider_name()
    )))
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    intent: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    key_features: Vec<String>,
    #[serde(default)]
    focus: Option<String>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
}

/// Parse a model reply into an `Analysis`.
///
/// The reply may wrap the JSON object in prose or a code fence; the outermost
/// braces are used. An object without `intent` is rejected.
pub fn parse_analysis(text: &str, query: &str) -> AppResult<Analysis> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => {
            return Err(AppError::Analysis(
                "model reply contains no JSON object".to_string(),
            ))
        }
    };

    let raw: RawAnalysis = serde_json::from_str(json)
        .map_err(|e| AppError::Analysis(format!("invalid analysis JSON: {}", e)))?;
    let intent = raw
        .intent
        .as_deref()
        .map(Intent::parse)
        .ok_or_else(|| AppError::Analysis("analysis JSON has no intent".to_string()))?;

    let mut entities: Vec<String> = Vec::new();
    for entity in raw.entities {
        let entity = entity.trim().to_string();
        if !entity.is_empty() && !entities.iter().any(|e| e.eq_ignore_ascii_case(&entity)) {
            entities.push(entity);
        }
    }

    Ok(Analysis {
        intent,
        entities,
        key_features: raw
            .key_features
            .into_iter()
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect(),
        focus: raw
            .focus
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| query.trim().to_string()),
        complexity: raw
            .complexity
            .as_deref()
            .and_then(Complexity::parse)
            .unwrap_or(Complexity::Medium),
        confidence: raw
            .confidence
            .as_deref()
            .and_then(Confidence::parse)
            .unwrap_or(Confidence::Medium),
        from_cache: false,
        strategy: "llm".to_string(),
    })
}

/// Phase 1 entry point.
pub struct QueryAnalyzer {
    strategies: Vec<Box<dyn AnalysisStrategy>>,
    cache: PhaseCache,
}

impl QueryAnalyzer {
    pub fn new(strategies: Vec<Box<dyn AnalysisStrategy>>, cache: PhaseCache) -> Self {
        Self { strategies, cache }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Analyze a query. Never fails.
    ///
    /// `vocabulary` is scoped to `document_ids`, so the scope is part of the
    /// cache key.
    pub async fn analyze(
        &self,
        query: &str,
        document_ids: &BTreeSet<String>,
        vocabulary: &[String],
        use_cache: bool,
    ) -> Analysis {
        let key = self
            .cache
            .key(&[&normalize_query(query), &normalize_terms(document_ids)]);

        if use_cache {
            if let Some(mut cached) = self.cache.get::<Analysis>(&key).await {
                cached.from_cache = true;
                return cached;
            }
        }

        for strategy in &self.strategies {
            if let Some(analysis) = strategy.analyze(query, vocabulary).await {
                tracing::debug!(strategy = strategy.name(), intent = analysis.intent.as_str(), "query analyzed");
                if use_cache {
                    self.cache.put(key, &analysis).await;
                }
                return analysis;
            }
        }

        // Not cached: a later request may reach a working model.
        tracing::info!("no analysis strategy accepted the query, using fallback");
        Analysis::fallback(query)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// `needle` appears in `haystack` delimited by non-alphanumeric characters.
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(i, _)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + needle.len()..].chars().next();
        !before.is_some_and(|c| c.is_alphanumeric()) && !after.is_some_and(|c| c.is_alphanumeric())
    })
}

/// Vocabulary terms mentioned in the (lowercased) query, by first position.
fn find_entities(lower_query: &str, vocabulary: &[String]) -> Vec<String> {
    let mut found: Vec<(usize, &String)> = Vec::new();
    for term in vocabulary {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let position = lower_query.match_indices(&needle).find_map(|(i, _)| {
            let before = lower_query[..i].chars().next_back();
            let after = lower_query[i + needle.len()..].chars().next();
            let bounded = !before.is_some_and(|c| c.is_alphanumeric())
                && !after.is_some_and(|c| c.is_alphanumeric());
            bounded.then_some(i)
        });
        if let Some(position) = position {
            if !found.iter().any(|(_, t)| t.eq_ignore_ascii_case(term)) {
                found.push((position, term));
            }
        }
    }
    // Stable: a longer term listed first wins ties at the same position.
    found.sort_by_key(|(position, _)| *position);
    found.into_iter().map(|(_, t)| t.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use sift_llm::{LlmCapabilities, ScriptedClient};
    use sift_prompt::{builtin_prompt, ANALYSIS_PROMPT_ID};

    fn vocab() -> Vec<String> {
        vec!["Zephyr X1".to_string(), "Nimbus 7".to_string()]
    }

    fn cache() -> PhaseCache {
        PhaseCache::new(Arc::new(TtlCache::new()), "analysis", Duration::from_secs(60))
    }

    fn extractor(client: ScriptedClient) -> Box<dyn AnalysisStrategy> {
        Box::new(LlmExtractor::new(
            Arc::new(client),
            "m",
            builtin_prompt(ANALYSIS_PROMPT_ID).unwrap(),
            Duration::from_secs(5),
        ))
    }

    #[test]
    fn test_pattern_compare_with_two_entities_is_high() {
        let analysis = PatternMatcher.inspect("Compare nimbus 7 and Zephyr X1 battery", &vocab());
        assert_eq!(analysis.intent, Intent::Compare);
        assert_eq!(analysis.entities, vec!["Nimbus 7", "Zephyr X1"]);
        assert!(analysis.key_features.contains("battery"));
        assert_eq!(analysis.confidence, Confidence::High);
        assert_eq!(analysis.complexity, Complexity::Medium);
    }

    #[test]
    fn test_pattern_requires_word_boundaries() {
        let analysis = PatternMatcher.inspect("tell me about nimbus 70", &vocab());
        assert!(analysis.entities.is_empty());
        assert_eq!(analysis.confidence, Confidence::Low);
    }

    #[test]
    fn test_pattern_spec_query() {
        let analysis = PatternMatcher.inspect("How much does the Zephyr X1 weigh?", &vocab());
        assert_eq!(analysis.intent, Intent::SpecQuery);
        assert_eq!(analysis.confidence, Confidence::High);
        assert!(analysis.key_features.contains("weight"));
    }

    #[test]
    fn test_parse_analysis_from_fenced_reply() {
        let reply = "Sure:\n```json\n{\"intent\":\"recommend\",\"entities\":[\"A\",\"a\",\"B\"],\"key_features\":[\"Price\"],\"confidence\":\"high\"}\n```";
        let analysis = parse_analysis(reply, "q").unwrap();
        assert_eq!(analysis.intent, Intent::Recommend);
        assert_eq!(analysis.entities, vec!["A", "B"]);
        assert!(analysis.key_features.contains("price"));
        assert_eq!(analysis.focus, "q");
        assert_eq!(analysis.complexity, Complexity::Medium);
    }

    #[test]
    fn test_parse_analysis_rejects_empty_object() {
        assert!(parse_analysis("{}", "q").is_err());
        assert!(parse_analysis("no json here", "q").is_err());
    }

    #[tokio::test]
    async fn test_high_confidence_pattern_skips_model() {
        let client = ScriptedClient::new(r#"{"intent":"general"}"#);
        let analyzer = QueryAnalyzer::new(
            vec![Box::new(PatternMatcher), extractor(client.clone())],
            cache(),
        );

        let analysis = analyzer
            .analyze("compare Zephyr X1 vs Nimbus 7", &BTreeSet::new(), &vocab(), true)
            .await;
        assert_eq!(analysis.strategy, "pattern");
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_model_used_when_pattern_is_unsure() {
        let client = ScriptedClient::new(
            r#"{"intent":"recommend","entities":["Zephyr X1"],"confidence":"medium"}"#,
        );
        let analyzer = QueryAnalyzer::new(
            vec![Box::new(PatternMatcher), extractor(client.clone())],
            cache(),
        );

        let analysis = analyzer
            .analyze("something for travel", &BTreeSet::new(), &vocab(), true)
            .await;
        assert_eq!(analysis.strategy, "llm");
        assert_eq!(analysis.intent, Intent::Recommend);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_when_model_fails() {
        let client = ScriptedClient::new("x").failing("offline");
        let analyzer = QueryAnalyzer::new(
            vec![Box::new(PatternMatcher), extractor(client)],
            cache(),
        );

        let analysis = analyzer
            .analyze("hello there", &BTreeSet::new(), &vocab(), true)
            .await;
        assert_eq!(analysis, Analysis::fallback("hello there"));
    }

    #[tokio::test]
    async fn test_fallback_when_model_supports_nothing() {
        let client = ScriptedClient::new("{}").with_capabilities(LlmCapabilities::none());
        let analyzer = QueryAnalyzer::new(vec![extractor(client)], cache());
        let analysis = analyzer.analyze("hello", &BTreeSet::new(), &[], true).await;
        assert_eq!(analysis.confidence, Confidence::Low);
        assert_eq!(analysis.intent, Intent::General);
    }

    #[tokio::test]
    async fn test_stream_only_client_still_extracts() {
        let client = ScriptedClient::new(r#"{"intent":"compare","entities":["A","B"]}"#)
            .with_capabilities(LlmCapabilities {
                streaming: true,
                completion: false,
                blocking: false,
            })
            .with_chunk_chars(5);
        let analyzer = QueryAnalyzer::new(vec![extractor(client)], cache());
        let analysis = analyzer.analyze("a or b", &BTreeSet::new(), &[], true).await;
        assert_eq!(analysis.intent, Intent::Compare);
        assert_eq!(analysis.entities, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_second_call_hits_cache_despite_formatting() {
        let client = ScriptedClient::new(r#"{"intent":"general","entities":[]}"#);
        let analyzer = QueryAnalyzer::new(vec![extractor(client.clone())], cache());

        let first = analyzer.analyze("What is new?", &BTreeSet::new(), &[], true).await;
        let second = analyzer
            .analyze("  what is   NEW ", &BTreeSet::new(), &[], true)
            .await;

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_is_scoped_by_documents() {
        let client = ScriptedClient::new(r#"{"intent":"general","entities":["A"]}"#);
        let analyzer = QueryAnalyzer::new(vec![extractor(client.clone())], cache());
        let manuals: BTreeSet<String> = ["manuals".to_string()].into_iter().collect();
        let reviews: BTreeSet<String> = ["reviews".to_string()].into_iter().collect();

        analyzer.analyze("what is new", &manuals, &[], true).await;
        let other_scope = analyzer.analyze("what is new", &reviews, &[], true).await;
        let same_scope = analyzer.analyze("what is new", &manuals, &[], true).await;

        assert!(!other_scope.from_cache);
        assert!(same_scope.from_cache);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_is_not_cached() {
        let client = ScriptedClient::new("not json");
        let analyzer = QueryAnalyzer::new(vec![extractor(client.clone())], cache());

        analyzer.analyze("q", &BTreeSet::new(), &[], true).await;
        let again = analyzer.analyze("q", &BTreeSet::new(), &[], true).await;
        assert!(!again.from_cache);
        assert_eq!(client.calls(), 2);
    }
}
