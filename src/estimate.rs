// Token-savings estimation for cache writes.
use serde_json::Value;

/// Estimates how many tokens a cache hit saves a caller.
pub trait TokenEstimator: Send + Sync {
    fn estimate_saved(&self, content: &str, result: &Value) -> u64;
}

/// Fixed characters-per-token model: the full content estimate plus half of
/// the serialized result estimate.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    pub chars_per_token: usize,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl CharRatioEstimator {
    fn tokens(&self, chars: usize) -> u64 {
        (chars / self.chars_per_token.max(1)) as u64
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate_saved(&self, content: &str, result: &Value) -> u64 {
        let result_chars = serde_json::to_string(result)
            .map(|s| s.chars().count())
            .unwrap_or(0);
        self.tokens(content.chars().count()) + self.tokens(result_chars) / 2
    }
}

impl<F> TokenEstimator for F
where
    F: Fn(&str, &Value) -> u64 + Send + Sync,
{
    fn estimate_saved(&self, content: &str, result: &Value) -> u64 {
        self(content, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_plus_half_result() {
        let est = CharRatioEstimator::default();
        let content = "x".repeat(400); // 100 tokens
        let result = Value::String("y".repeat(78)); // 80 chars serialized → 20 tokens → 10
        assert_eq!(est.estimate_saved(&content, &result), 110);
    }

    #[test]
    fn empty_inputs_save_nothing() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate_saved("", &json!(null)), 0);
    }

    #[test]
    fn closures_are_estimators() {
        let flat = |_: &str, _: &Value| 7u64;
        assert_eq!(flat.estimate_saved("abc", &json!({})), 7);
    }
}
