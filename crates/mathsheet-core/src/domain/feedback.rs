//! Tutor feedback for a single problem: explanation, hint, common mistake.

use serde::{Deserialize, Serialize};

/// Feedback for one problem, keyed by the id sent with the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub question_id: String,

    #[serde(rename = "explanation_latex", default)]
    pub explanation_text: String,

    #[serde(rename = "hint_latex", default)]
    pub hint_text: String,

    #[serde(rename = "common_mistake_latex", default)]
    pub common_mistake_text: String,
}

impl FeedbackItem {
    /// Non-empty markup fields, labelled by name.
    pub fn text_fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("explanation", self.explanation_text.as_str()),
            ("hint", self.hint_text.as_str()),
            ("common_mistake", self.common_mistake_text.as_str()),
        ]
        .into_iter()
        .filter(|(_, text)| !text.trim().is_empty())
        .collect()
    }

    pub fn text_fields_mut(&mut self) -> [(&'static str, &mut String); 3] {
        [
            ("explanation", &mut self.explanation_text),
            ("hint", &mut self.hint_text),
            ("common_mistake", &mut self.common_mistake_text),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.text_fields().is_empty()
    }
}

/// One structured feedback response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackSet {
    pub items: Vec<FeedbackItem>,
}

impl FeedbackSet {
    /// The entry for `question_id`, else the first entry.
    pub fn take_for(self, question_id: &str) -> Option<FeedbackItem> {
        let mut items = self.items;
        match items.iter().position(|f| f.question_id == question_id) {
            Some(idx) => Some(items.swap_remove(idx)),
            None => items.into_iter().next(),
        }
    }
}
