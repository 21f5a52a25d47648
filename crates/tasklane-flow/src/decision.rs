use serde::{Deserialize, Serialize};

use crate::predicate::Predicate;

/// How a decision node picks one of its choices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionPolicy {
    /// Decide locally without a model call: the first choice when the
    /// predicate holds, otherwise the second.
    LocalPredicate { predicate: Predicate },
    /// Ask the model to answer with one of the choices.
    #[default]
    ModelChoice,
}

impl DecisionPolicy {
    pub fn local(predicate: Predicate) -> Self {
        Self::LocalPredicate { predicate }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalPredicate { .. })
    }
}

pub fn default_choices() -> Vec<String> {
    vec!["YES".to_string(), "NO".to_string()]
}

/// Choice for a local predicate outcome. A single-choice node always
/// returns that choice.
pub fn local_choice(holds: bool, choices: &[String]) -> String {
    let index = if holds { 0 } else { 1 };
    choices
        .get(index)
        .or_else(|| choices.first())
        .cloned()
        .unwrap_or_default()
}

/// Match a free-text model answer against the allowed choices.
///
/// The answer is upper-cased and the first choice it contains wins. When
/// nothing matches, the first choice is returned.
pub fn match_choice(response: &str, choices: &[String]) -> (String, bool) {
    let answer = response.to_uppercase();
    match choices
        .iter()
        .find(|choice| answer.contains(&choice.to_uppercase()))
    {
        Some(choice) => (choice.clone(), true),
        None => (choices.first().cloned().unwrap_or_default(), false),
    }
}

/// Prompt asking the model to pick exactly one choice.
pub fn choice_prompt(question: &str, choices: &[String]) -> String {
    format!(
        "{}\n\nRespond with exactly one of: {}. Do not add anything else.",
        question,
        choices.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choices(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_match_is_case_insensitive_substring() {
        let c = choices(&["PASS", "FAIL"]);
        assert_eq!(match_choice("the step fails? no: fail.", &c), ("FAIL".to_string(), true));
        assert_eq!(match_choice("Verdict: Pass", &c), ("PASS".to_string(), true));
    }

    #[test]
    fn test_match_falls_back_to_first_choice() {
        let c = choices(&["PASS", "FAIL"]);
        assert_eq!(match_choice("unsure", &c), ("PASS".to_string(), false));
        assert_eq!(match_choice("anything", &[]), (String::new(), false));
    }

    #[test]
    fn test_earlier_choice_wins_when_both_present() {
        let c = choices(&["YES", "NO"]);
        assert_eq!(match_choice("NO... actually YES", &c).0, "YES");
    }

    #[test]
    fn test_local_choice() {
        let c = default_choices();
        assert_eq!(local_choice(true, &c), "YES");
        assert_eq!(local_choice(false, &c), "NO");
        assert_eq!(local_choice(false, &choices(&["ONLY"])), "ONLY");
    }

    #[test]
    fn test_policy_serde() {
        let policy = DecisionPolicy::local(Predicate::HasCurrentStep);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["type"], "local_predicate");
        assert_eq!(json["predicate"], "hasCurrentStep");

        let parsed: DecisionPolicy = serde_json::from_str(r#"{"type":"model_choice"}"#).unwrap();
        assert_eq!(parsed, DecisionPolicy::ModelChoice);
        assert!(!parsed.is_local());
    }

    #[test]
    fn test_choice_prompt_lists_choices() {
        let prompt = choice_prompt("Did it pass?", &choices(&["PASS", "FAIL"]));
        assert!(prompt.starts_with("Did it pass?"));
        assert!(prompt.contains("PASS, FAIL"));
    }
}
