use std::sync::OnceLock;

use regex::Regex;

use tasklane_core::chain::StepDef;
use tasklane_core::error::{Result, TasklaneError};

/// Appended to a task node's prompt.
pub const PLAN_INSTRUCTION: &str = "Respond with a JSON array of 3 to 6 steps inside a fenced \
code block. Each step is an object with a short \"name\" and a one-sentence \"description\":\n\
```json\n[{\"name\": \"...\", \"description\": \"...\"}]\n```";

pub fn planning_prompt(prompt: &str) -> String {
    format!("{}\n\n{}", prompt, PLAN_INSTRUCTION)
}

/// Body of the first fenced code block in `text`, language tag dropped.
pub fn extract_fenced_block(text: &str) -> Option<&str> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let re = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
    });
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Parse a model's plan response into step definitions.
///
/// Fails when there is no fenced block, the block is not a JSON array of
/// `{name, description}` objects, or the array is empty.
pub fn parse_plan(response: &str) -> Result<Vec<StepDef>> {
    let block = extract_fenced_block(response)
        .ok_or_else(|| TasklaneError::LlmParse("no fenced code block in plan".into()))?;

    let steps: Vec<StepDef> = serde_json::from_str(block)
        .map_err(|e| TasklaneError::LlmParse(format!("plan is not a step array: {}", e)))?;

    if steps.is_empty() {
        return Err(TasklaneError::LlmParse("plan contains no steps".into()));
    }
    Ok(steps)
}

/// Used when the model's plan can't be parsed.
pub fn default_plan() -> Vec<StepDef> {
    vec![
        StepDef::new("Analyze", "Understand the request and the relevant code"),
        StepDef::new("Implement", "Make the required changes"),
        StepDef::new("Verify", "Check that the changes work"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_with_language_tag() {
        let text = "Here you go:\n```json\n[1, 2]\n```\nand more\n```\nlater\n```";
        assert_eq!(extract_fenced_block(text), Some("[1, 2]"));
    }

    #[test]
    fn test_extract_without_tag() {
        assert_eq!(extract_fenced_block("```\n{}\n```"), Some("{}"));
        assert_eq!(extract_fenced_block("no fences here"), None);
    }

    #[test]
    fn test_parse_plan() {
        let response = r#"Plan:
```json
[
  {"name": "Scaffold", "description": "Create the crate"},
  {"name": "Parser"},
  {"name": "Tests", "description": "Cover edge cases"}
]
```"#;
        let steps = parse_plan(response).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].name, "Scaffold");
        assert_eq!(steps[1].description, "");
    }

    #[test]
    fn test_parse_plan_failures() {
        for bad in [
            "just prose, no code block",
            "```json\n{\"name\": \"not an array\"}\n```",
            "```json\n[]\n```",
            "```json\n[{\"description\": \"missing name\"}]\n```",
            "```\n[{\"name\": \"unterminated\"\n```",
        ] {
            assert!(
                matches!(parse_plan(bad), Err(TasklaneError::LlmParse(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_default_plan_order() {
        let names: Vec<String> = default_plan().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Analyze", "Implement", "Verify"]);
    }

    #[test]
    fn test_planning_prompt_appends_instruction() {
        let prompt = planning_prompt("Build a todo app");
        assert!(prompt.starts_with("Build a todo app"));
        assert!(prompt.contains("JSON array"));
    }
}
