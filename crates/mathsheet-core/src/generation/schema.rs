//! Structured-output schemas sent with generation and feedback requests.

use serde_json::{json, Value};

use crate::domain::Difficulty;

pub const PROBLEM_SET_SCHEMA_NAME: &str = "problem_set";
pub const FEEDBACK_SET_SCHEMA_NAME: &str = "feedback_set";

/// Strict JSON schema for a [`ProblemBatch`](crate::domain::ProblemBatch).
pub fn problem_set_schema() -> Value {
    let levels: Vec<&str> = Difficulty::ALL.iter().map(|d| d.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "problems": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "stem_latex": { "type": "string" },
                        "answer_latex": { "type": "string" },
                        "explanation_latex": { "type": "string" },
                        "unit_id": { "type": "string" },
                        "difficulty": { "type": "string", "enum": levels }
                    },
                    "required": ["stem_latex", "answer_latex", "explanation_latex", "unit_id", "difficulty"],
                    "additionalProperties": false
                }
            },
            "intent": { "type": "string" },
            "point_review_latex": { "type": "string" }
        },
        "required": ["problems", "intent", "point_review_latex"],
        "additionalProperties": false
    })
}

/// Strict JSON schema for a [`FeedbackSet`](crate::domain::FeedbackSet).
pub fn feedback_set_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "question_id": { "type": "string" },
                        "explanation_latex": { "type": "string" },
                        "hint_latex": { "type": "string" },
                        "common_mistake_latex": { "type": "string" }
                    },
                    "required": ["question_id", "explanation_latex", "hint_latex", "common_mistake_latex"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["items"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lists_every_difficulty() {
        let schema = problem_set_schema();
        let levels = &schema["properties"]["problems"]["items"]["properties"]["difficulty"]["enum"];
        assert_eq!(levels.as_array().unwrap().len(), 5);
        assert_eq!(schema["additionalProperties"], Value::Bool(false));
    }

    #[test]
    fn test_feedback_schema_requires_every_field() {
        let schema = feedback_set_schema();
        let item = &schema["properties"]["items"]["items"];
        let required = item["required"].as_array().unwrap();
        assert_eq!(required.len(), 4);
        assert!(required.contains(&Value::from("hint_latex")));
        assert_eq!(item["additionalProperties"], Value::Bool(false));
    }
}
