//! Replies to chat messages sent over the observer channel.

use policy_proof_server_models::AnalysisContext;

/// Produces a reply to a chat message.
pub trait ChatResponder: Send + Sync {
    /// Replies to `message`, optionally using the analysis the client is
    /// looking at.
    fn reply(&self, message: &str, context: Option<&AnalysisContext>) -> String;
}

const BOUNDARY_REPLY: &str =
    "Draw a boundary on the map and click Analyze to run the SRD analysis.";
const ANALYZE_REPLY: &str = "Use the Analyze button after selecting a boundary. The chart will show any discontinuity at the border.";
const EARTH_ENGINE_REPLY: &str = "The map displays Google Earth Engine tiles. You can compare embeddings and similarity layers.";
const DEFAULT_REPLY: &str = "I can help you evaluate policy impact near borders using SRD. What policy or area are you interested in?";

/// Keyword-driven responder.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedResponder;

impl RuleBasedResponder {
    fn describe(context: &AnalysisContext) -> Option<String> {
        let score = context.impact_score()?;
        let policy = context
            .policy()
            .map_or_else(String::new, |p| format!(" for {p}"));
        let points = context
            .point_count()
            .map_or_else(String::new, |n| format!(" across {n} sampled distances"));
        let direction = if score > 0.0 {
            "higher inside the boundary"
        } else if score < 0.0 {
            "lower inside the boundary"
        } else {
            "unchanged across the boundary"
        };

        Some(format!(
            "The last analysis{policy} estimated an impact score of {score:.2}{points}: activity is {direction}."
        ))
    }
}

impl ChatResponder for RuleBasedResponder {
    fn reply(&self, message: &str, context: Option<&AnalysisContext>) -> String {
        let low = message.to_lowercase();

        if low.contains("boundary") || low.contains("polygon") {
            return BOUNDARY_REPLY.to_string();
        }
        if low.contains("analyz") || low.contains("impact") || low.contains("result") {
            return context
                .and_then(Self::describe)
                .unwrap_or_else(|| ANALYZE_REPLY.to_string());
        }
        if low.contains("earth engine") || low.contains("gee") {
            return EARTH_ENGINE_REPLY.to_string();
        }
        DEFAULT_REPLY.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keyword_replies() {
        let responder = RuleBasedResponder;
        assert_eq!(responder.reply("How do I draw a Polygon?", None), BOUNDARY_REPLY);
        assert_eq!(responder.reply("what is the impact", None), ANALYZE_REPLY);
        assert_eq!(responder.reply("Is this GEE data?", None), EARTH_ENGINE_REPLY);
        assert_eq!(responder.reply("hello", None), DEFAULT_REPLY);
    }

    #[test]
    fn impact_question_uses_context() {
        let context = AnalysisContext::new(json!({
            "policy": "Low emission zone",
            "impact_score": 12.5,
            "points": [{ "distance_km": -0.05 }, { "distance_km": 0.05 }]
        }));

        let reply = RuleBasedResponder.reply("Explain the impact", Some(&context));
        assert!(reply.contains("Low emission zone"));
        assert!(reply.contains("12.50"));
        assert!(reply.contains("2 sampled distances"));
        assert!(reply.contains("higher inside"));
    }

    #[test]
    fn context_without_score_falls_back_to_guidance() {
        let context = AnalysisContext::new(json!({ "policy": "x" }));
        assert_eq!(
            RuleBasedResponder.reply("analyze it", Some(&context)),
            ANALYZE_REPLY
        );
    }
}
