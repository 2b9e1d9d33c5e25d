//! Candidate and verified problem items.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::feedback::FeedbackItem;

/// Difficulty tier of a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    L1,
    L2,
    L3,
    L4,
    L5,
}

impl Difficulty {
    pub const ALL: [Difficulty; 5] = [
        Difficulty::L1,
        Difficulty::L2,
        Difficulty::L3,
        Difficulty::L4,
        Difficulty::L5,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::L1 => "L1",
            Difficulty::L2 => "L2",
            Difficulty::L3 => "L3",
            Difficulty::L4 => "L4",
            Difficulty::L5 => "L5",
        }
    }

    /// Label printed in sheet headers.
    pub fn label_ja(&self) -> &'static str {
        match self {
            Difficulty::L1 => "基礎",
            Difficulty::L2 => "標準",
            Difficulty::L3 => "発展",
            Difficulty::L4 => "難関",
            Difficulty::L5 => "最難関",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Difficulty::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown difficulty '{}', expected one of L1..L5", s))
    }
}

/// One candidate problem as produced by a generator.
///
/// Field names on the wire follow the generation-service schema
/// (`stem_latex`, `answer_latex`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedItem {
    #[serde(rename = "stem_latex")]
    pub stem_text: String,

    #[serde(rename = "answer_latex")]
    pub answer_text: String,

    /// May be empty.
    #[serde(rename = "explanation_latex", default)]
    pub explanation_text: String,

    /// Filled by the feedback step; may be empty.
    #[serde(rename = "hint_latex", default, skip_serializing_if = "String::is_empty")]
    pub hint_text: String,

    #[serde(rename = "common_mistake_latex", default, skip_serializing_if = "String::is_empty")]
    pub common_mistake_text: String,

    #[serde(rename = "difficulty")]
    pub difficulty: Difficulty,

    #[serde(rename = "unit_id", default)]
    pub unit_id: String,
}

impl GeneratedItem {
    pub fn new(
        stem_text: impl Into<String>,
        answer_text: impl Into<String>,
        difficulty: Difficulty,
    ) -> Self {
        Self {
            stem_text: stem_text.into(),
            answer_text: answer_text.into(),
            explanation_text: String::new(),
            hint_text: String::new(),
            common_mistake_text: String::new(),
            difficulty,
            unit_id: String::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation_text = explanation.into();
        self
    }

    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = unit_id.into();
        self
    }

    pub fn has_explanation(&self) -> bool {
        !self.explanation_text.is_empty()
    }

    pub fn has_hint(&self) -> bool {
        !self.hint_text.is_empty()
    }

    pub fn has_common_mistake(&self) -> bool {
        !self.common_mistake_text.is_empty()
    }

    /// Copy hint and common mistake from `feedback`. The explanation is only
    /// filled when the item has none.
    pub fn apply_feedback(&mut self, feedback: &FeedbackItem) {
        if !self.has_explanation() && !feedback.explanation_text.trim().is_empty() {
            self.explanation_text = feedback.explanation_text.clone();
        }
        if !feedback.hint_text.trim().is_empty() {
            self.hint_text = feedback.hint_text.clone();
        }
        if !feedback.common_mistake_text.trim().is_empty() {
            self.common_mistake_text = feedback.common_mistake_text.clone();
        }
    }

    /// Mutable access to the three problem fields, labelled by name.
    pub fn text_fields_mut(&mut self) -> [(&'static str, &mut String); 3] {
        [
            ("stem", &mut self.stem_text),
            ("answer", &mut self.answer_text),
            ("explanation", &mut self.explanation_text),
        ]
    }

    /// SHA-256 over stem, answer and explanation, hex-encoded. Hint and
    /// common mistake do not take part.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.stem_text.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.answer_text.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.explanation_text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A candidate that passed every verification stage. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedItem {
    #[serde(flatten)]
    item: GeneratedItem,
    fingerprint: String,
    verified_at: DateTime<Utc>,
}

impl VerifiedItem {
    /// Promote a candidate. Only the verification stages should call this.
    pub(crate) fn promote(item: GeneratedItem) -> Self {
        let fingerprint = item.fingerprint();
        Self {
            item,
            fingerprint,
            verified_at: Utc::now(),
        }
    }

    pub fn item(&self) -> &GeneratedItem {
        &self.item
    }

    pub fn into_item(self) -> GeneratedItem {
        self.item
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }
}

/// One structured response from the generation service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemBatch {
    #[serde(rename = "problems")]
    pub items: Vec<GeneratedItem>,

    #[serde(default)]
    pub intent: Option<String>,

    #[serde(rename = "point_review_latex", default)]
    pub summary_notes: Option<String>,
}

impl ProblemBatch {
    pub fn new(items: Vec<GeneratedItem>) -> Self {
        Self {
            items,
            intent: None,
            summary_notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_parse() {
        assert_eq!("L3".parse::<Difficulty>().unwrap(), Difficulty::L3);
        assert_eq!(" l2 ".parse::<Difficulty>().unwrap(), Difficulty::L2);
        assert!("L9".parse::<Difficulty>().is_err());
        assert_eq!(Difficulty::L5.label_ja(), "最難関");
    }

    #[test]
    fn test_item_wire_names() {
        let json = r#"{
            "stem_latex": "$x^2=4$ を解け。",
            "answer_latex": "$x=\\pm 2$",
            "difficulty": "L2",
            "unit_id": "math1_quadratic",
            "graph": null
        }"#;
        let item: GeneratedItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.difficulty, Difficulty::L2);
        assert!(item.explanation_text.is_empty());
        assert!(!item.has_explanation());
        assert_eq!(item.unit_id, "math1_quadratic");
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let json = r#"{"answer_latex": "1", "difficulty": "L1"}"#;
        assert!(serde_json::from_str::<GeneratedItem>(json).is_err());
    }

    #[test]
    fn test_fingerprint_separates_fields() {
        let a = GeneratedItem::new("ab", "c", Difficulty::L1);
        let b = GeneratedItem::new("a", "bc", Difficulty::L1);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_apply_feedback_keeps_existing_explanation() {
        let feedback = FeedbackItem {
            question_id: "q1".to_string(),
            explanation_text: "新しい解説".to_string(),
            hint_text: "因数分解".to_string(),
            common_mistake_text: String::new(),
        };

        let mut explained = GeneratedItem::new("abcde", "1", Difficulty::L1).with_explanation("元の解説");
        let before = explained.fingerprint();
        explained.apply_feedback(&feedback);
        assert_eq!(explained.explanation_text, "元の解説");
        assert_eq!(explained.hint_text, "因数分解");
        assert!(!explained.has_common_mistake());
        assert_eq!(explained.fingerprint(), before);

        let mut bare = GeneratedItem::new("abcde", "1", Difficulty::L1);
        bare.apply_feedback(&feedback);
        assert_eq!(bare.explanation_text, "新しい解説");
        assert!(bare.has_hint());
    }

    #[test]
    fn test_feedback_fields_on_the_wire() {
        let plain = serde_json::to_value(GeneratedItem::new("abcde", "1", Difficulty::L1)).unwrap();
        assert!(plain.get("hint_latex").is_none());

        let json = r#"{"stem_latex": "abcde", "answer_latex": "1", "difficulty": "L1",
            "hint_latex": "図を描く", "common_mistake_latex": "単位"}"#;
        let item: GeneratedItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.hint_text, "図を描く");
        assert_eq!(item.common_mistake_text, "単位");
    }

    #[test]
    fn test_verified_item_flattens_candidate() {
        let verified = VerifiedItem::promote(GeneratedItem::new("$1+1$ を計算せよ。", "$2$", Difficulty::L1));
        let value = serde_json::to_value(&verified).unwrap();
        assert_eq!(value["stem_latex"], "$1+1$ を計算せよ。");
        assert!(value["fingerprint"].is_string());
    }

    #[test]
    fn test_batch_decodes_point_review() {
        let json = r#"{"problems": [], "intent": "復習", "point_review_latex": "公式"}"#;
        let batch: ProblemBatch = serde_json::from_str(json).unwrap();
        assert!(batch.items.is_empty());
        assert_eq!(batch.summary_notes.as_deref(), Some("公式"));
    }
}
