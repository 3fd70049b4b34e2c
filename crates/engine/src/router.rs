//! Conditional routing of a single request to an execution profile.
//!
//! Rules are tried in configuration order and the first match wins. The
//! router keeps no state between calls, so the same request always lands
//! on the same profile.

use conductor_config::{RouteRule, RouteTarget, RouterConfig};
use conductor_core::{ClassificationError, CompletionProfile};

/// The input the router classifies.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub text: &'a str,
    pub target: Option<RouteTarget>,
}

impl<'a> RouteRequest<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, target: None }
    }

    pub fn with_target(mut self, target: RouteTarget) -> Self {
        self.target = Some(target);
        self
    }
}

/// Which profile was picked, and by which rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub profile: CompletionProfile,
    /// `None` when the default profile was used
    pub rule: Option<String>,
}

pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Pick a profile for the request.
    pub fn route(&self, request: &RouteRequest<'_>) -> Result<RouteDecision, ClassificationError> {
        let lowered = request.text.to_lowercase();
        let words = request.text.split_whitespace().count();

        for rule in &self.config.rules {
            if rule_matches(rule, &lowered, words, request.target) {
                let profile = self.lookup(&rule.profile)?;
                return Ok(RouteDecision {
                    profile,
                    rule: Some(rule.name.clone()),
                });
            }
        }

        match &self.config.default_profile {
            Some(name) => Ok(RouteDecision {
                profile: self.lookup(name)?,
                rule: None,
            }),
            None => Err(ClassificationError::NoMatch),
        }
    }

    fn lookup(&self, name: &str) -> Result<CompletionProfile, ClassificationError> {
        self.config
            .profile(name)
            .cloned()
            .ok_or_else(|| ClassificationError::UnknownProfile(name.to_string()))
    }
}

fn rule_matches(rule: &RouteRule, lowered: &str, words: usize, target: Option<RouteTarget>) -> bool {
    if let Some(target) = target {
        if rule.targets.contains(&target) {
            return true;
        }
    }
    if rule
        .keywords
        .iter()
        .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
    {
        return true;
    }
    if rule.min_words.is_some_and(|min| words >= min) {
        return true;
    }
    rule.max_words.is_some_and(|max| words <= max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::BackendTier;

    fn router() -> Router {
        Router::new(RouterConfig::default())
    }

    fn profile_for(text: &str) -> String {
        router().route(&RouteRequest::new(text)).unwrap().profile.name
    }

    #[test]
    fn complexity_indicators_go_to_smart() {
        assert_eq!(profile_for("Explain in detail how TCP congestion control works"), "smart");
        assert_eq!(profile_for("Walk me through it step by step"), "smart");
    }

    #[test]
    fn brevity_indicators_go_to_fast() {
        assert_eq!(profile_for("Give me a quick overview of Rust"), "fast");
        assert_eq!(profile_for("tldr of the meeting"), "fast");
    }

    #[test]
    fn complexity_wins_over_brevity_by_rule_order() {
        assert_eq!(profile_for("A brief but comprehensive answer please"), "smart");
    }

    #[test]
    fn analysis_verbs_and_long_requests_go_to_smart() {
        assert_eq!(profile_for("Compare these two designs"), "smart");
        let long = "word ".repeat(21);
        assert_eq!(profile_for(&long), "smart");
        let short = "word ".repeat(20);
        assert_eq!(profile_for(&short), "fast");
    }

    #[test]
    fn default_profile_when_nothing_matches() {
        let decision = router().route(&RouteRequest::new("What is the capital of France?")).unwrap();
        assert_eq!(decision.profile.name, "fast");
        assert!(decision.rule.is_none());
    }

    #[test]
    fn explicit_target_overrides_heuristics() {
        let r = router();
        let d = r
            .route(&RouteRequest::new("hello").with_target(RouteTarget::HighQuality))
            .unwrap();
        assert_eq!(d.profile.name, "smart");
        assert_eq!(d.rule.as_deref(), Some("explicit-quality"));

        let d = r
            .route(&RouteRequest::new("Explain in detail").with_target(RouteTarget::LowCost))
            .unwrap();
        assert_eq!(d.profile.name, "fast");
    }

    #[test]
    fn routing_is_deterministic() {
        let r = router();
        let text = "Evaluate the proposal";
        let first = r.route(&RouteRequest::new(text)).unwrap();
        for _ in 0..10 {
            assert_eq!(r.route(&RouteRequest::new(text)).unwrap(), first);
        }
    }

    #[test]
    fn no_match_without_default_is_an_error() {
        let config = RouterConfig {
            default_profile: None,
            profiles: vec![CompletionProfile::new("only", BackendTier::Standard, "m")],
            rules: vec![],
        };
        let err = Router::new(config).route(&RouteRequest::new("anything")).unwrap_err();
        assert!(matches!(err, ClassificationError::NoMatch));
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let config = RouterConfig {
            default_profile: Some("ghost".into()),
            profiles: vec![],
            rules: vec![],
        };
        let err = Router::new(config).route(&RouteRequest::new("anything")).unwrap_err();
        assert!(matches!(err, ClassificationError::UnknownProfile(name) if name == "ghost"));
    }

    #[test]
    fn max_words_rule() {
        let config = RouterConfig {
            default_profile: Some("big".into()),
            profiles: vec![
                CompletionProfile::new("tiny", BackendTier::Fast, "t"),
                CompletionProfile::new("big", BackendTier::Advanced, "b"),
            ],
            rules: vec![RouteRule {
                name: "short".into(),
                profile: "tiny".into(),
                keywords: vec![],
                min_words: None,
                max_words: Some(3),
                targets: vec![],
            }],
        };
        let r = Router::new(config);
        assert_eq!(r.route(&RouteRequest::new("one two three")).unwrap().profile.name, "tiny");
        assert_eq!(r.route(&RouteRequest::new("one two three four")).unwrap().profile.name, "big");
    }
}
