//! Best-effort insertion of missing math-mode delimiters.
//!
//! Generators often emit `x^2+1` where `$x^2+1$` is required, which only
//! shows up later as a compile failure. This pass rewrites such text before
//! any check runs. It is a heuristic: in mixed Japanese/formula text the
//! token boundaries are a guess, and rewrites whose wrapped tokens are
//! themselves unbalanced are reported as ambiguous.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Tokens that only make sense inside math mode.
pub const MATH_MARKERS: &[&str] = &[
    "^", "_", "\\frac", "\\dfrac", "\\sqrt", "\\sin", "\\cos", "\\tan", "\\log", "=", "\\pi",
    "π",
];

/// Math-mode openers; any of these means the text was already delimited.
pub const MATH_DELIMITERS: &[&str] = &["$", "\\(", "\\["];

/// What the repair pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairAction {
    Unchanged,
    WrappedWhole,
    WrappedTokens { count: usize },
}

/// Repaired text plus what happened to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub text: String,
    pub action: RepairAction,
    pub ambiguous: bool,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        self.action != RepairAction::Unchanged
    }

    fn unchanged(text: &str) -> Self {
        Self {
            text: text.to_string(),
            action: RepairAction::Unchanged,
            ambiguous: false,
        }
    }
}

/// Repair `text`, discarding the report.
pub fn repair(text: &str) -> String {
    repair_with_report(text).text
}

/// Repair `text` and describe the rewrite.
pub fn repair_with_report(text: &str) -> RepairReport {
    if has_delimiter(text) || !has_marker(text) {
        return RepairReport::unchanged(text);
    }

    if !text.chars().any(is_japanese) {
        let (lead, core, trail) = split_padding(text, char::is_whitespace);
        return RepairReport {
            text: format!("{}${}${}", lead, core, trail),
            action: RepairAction::WrappedWhole,
            ambiguous: false,
        };
    }

    let mut count = 0usize;
    let mut ambiguous = false;
    let rewritten = formula_run_regex().replace_all(text, |caps: &Captures| {
        let run = &caps[0];
        if !has_marker(run) {
            return run.to_string();
        }
        let (lead, core, trail) =
            split_padding(run, |c: char| c.is_whitespace() || c == ',' || c == '.');
        if core.is_empty() {
            return run.to_string();
        }
        count += 1;
        if !groups_balanced(core) {
            ambiguous = true;
        }
        format!("{}${}${}", lead, core, trail)
    });

    if count == 0 {
        return RepairReport::unchanged(text);
    }

    RepairReport {
        text: rewritten.into_owned(),
        action: RepairAction::WrappedTokens { count },
        ambiguous,
    }
}

pub fn has_delimiter(text: &str) -> bool {
    MATH_DELIMITERS.iter().any(|d| text.contains(d))
}

pub fn has_marker(text: &str) -> bool {
    MATH_MARKERS.iter().any(|m| text.contains(m))
}

/// Hiragana, katakana, CJK ideographs, CJK punctuation and full-width forms.
pub fn is_japanese(c: char) -> bool {
    matches!(
        c,
        '\u{3000}'..='\u{303F}'
            | '\u{3040}'..='\u{309F}'
            | '\u{30A0}'..='\u{30FF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{4E00}'..='\u{9FFF}'
            | '\u{FF00}'..='\u{FFEF}'
    )
}

/// Runs of ASCII formula characters (plus `π`), including inner spaces.
fn formula_run_regex() -> &'static Regex {
    static RUN: OnceLock<Regex> = OnceLock::new();
    RUN.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9\\^_{}()\[\]+\-*/=<>.,'|!:;π ]+")
            .expect("formula run pattern is a valid regex")
    })
}

fn split_padding(text: &str, is_pad: impl Fn(char) -> bool + Copy) -> (&str, &str, &str) {
    let start = text.len() - text.trim_start_matches(is_pad).len();
    let end = text.trim_end_matches(is_pad).len().max(start);
    (&text[..start], &text[start..end], &text[end..])
}

fn groups_balanced(text: &str) -> bool {
    let count = |c: char| text.chars().filter(|&x| x == c).count();
    count('{') == count('}') && count('(') == count(')') && count('[') == count(']')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_pure_formula() {
        assert_eq!(repair("x^2+1"), "$x^2+1$");
    }

    #[test]
    fn test_keeps_outer_whitespace() {
        assert_eq!(repair("  \\frac{1}{2}\n"), "  $\\frac{1}{2}$\n");
    }

    #[test]
    fn test_noop_when_delimited() {
        let text = "$x^2$ in Japanese text";
        assert_eq!(repair(text), text);
        let text = "\\[ y = x^2 \\] のグラフ";
        assert_eq!(repair(text), text);
    }

    #[test]
    fn test_noop_without_markers() {
        let report = repair_with_report("次の数を答えよ。 12");
        assert_eq!(report.action, RepairAction::Unchanged);
        assert_eq!(report.text, "次の数を答えよ。 12");
    }

    #[test]
    fn test_wraps_tokens_in_mixed_text() {
        let report = repair_with_report("方程式 x^2-4=0 を解け。");
        assert_eq!(report.text, "方程式 $x^2-4=0$ を解け。");
        assert_eq!(report.action, RepairAction::WrappedTokens { count: 1 });
        assert!(!report.ambiguous);
    }

    #[test]
    fn test_leaves_plain_ascii_runs_in_mixed_text() {
        let report = repair_with_report("ABC の面積は S=12 である。");
        assert_eq!(report.text, "ABC の面積は $S=12$ である。");
    }

    #[test]
    fn test_trailing_punctuation_stays_outside() {
        assert_eq!(repair("答えは x=3. です"), "答えは $x=3$. です");
    }

    #[test]
    fn test_flags_unbalanced_token() {
        let report = repair_with_report("\\frac{1}{2つ目}");
        assert!(report.changed());
        assert!(report.ambiguous);
    }

    #[test]
    fn test_pi_symbol_is_a_marker() {
        assert_eq!(repair("2π"), "$2π$");
        assert_eq!(repair("円周は 2πr である"), "円周は $2πr$ である");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "",
            "x^2+1",
            "方程式 x^2-4=0 を解け。",
            "$x$",
            "答えは x=3. です",
            "\\frac{1}{2つ目}",
            "a_1, a_2, a_3 の和",
            "plain words",
            "   ",
            "= 全角＝",
        ];
        for s in samples {
            let once = repair(s);
            assert_eq!(repair(&once), once, "not idempotent for {:?}", s);
        }
    }
}
