//! Forbidden-construct denylist and brace balance check.
//!
//! Rejects content that could execute code, touch the filesystem, or change
//! how the engine parses the rest of the document. The balance rule is a
//! count comparison, not a parser: `}{` passes.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::{FailureKind, VerificationResult};

/// One denylist entry.
#[derive(Debug)]
pub struct DenyRule {
    pub name: &'static str,
    pub pattern: &'static str,
    /// Minimal input that triggers the rule.
    pub sample: &'static str,
    regex: Regex,
}

const RULES: &[(&str, &str, &str)] = &[
    ("write", r"\\write\d*", r"\write18"),
    ("input", r"\\input", r"\input"),
    ("include", r"\\include", r"\include"),
    ("directlua", r"\\directlua", r"\directlua"),
    ("usepackage", r"\\usepackage", r"\usepackage"),
    ("newcommand", r"\\newcommand", r"\newcommand"),
    ("renewcommand", r"\\renewcommand", r"\renewcommand"),
    ("def", r"\\[gex]?def", r"\def"),
    ("catcode", r"\\catcode", r"\catcode"),
    ("openout", r"\\openout", r"\openout"),
    ("openin", r"\\openin", r"\openin"),
    ("newwrite", r"\\newwrite", r"\newwrite"),
    ("immediate", r"\\immediate", r"\immediate"),
    ("shellescape", r"\\ShellEscape", r"\ShellEscape"),
];

/// The fixed denylist, compiled once.
pub fn denylist() -> &'static [DenyRule] {
    static DENYLIST: OnceLock<Vec<DenyRule>> = OnceLock::new();
    DENYLIST.get_or_init(|| {
        RULES
            .iter()
            .map(|&(name, pattern, sample)| DenyRule {
                name,
                pattern,
                sample,
                regex: Regex::new(pattern).expect("denylist patterns are valid regexes"),
            })
            .collect()
    })
}

/// Check `text` against the denylist and the brace balance rule.
pub fn sanitize(text: &str) -> VerificationResult {
    if text.is_empty() {
        return VerificationResult::failed(FailureKind::SchemaFailed, "Empty latex");
    }

    if let Some(rule) = denylist().iter().find(|rule| rule.regex.is_match(text)) {
        return VerificationResult::failed(
            FailureKind::SanitizeFailed,
            format!("Forbidden pattern detected: {}", rule.pattern),
        );
    }

    let (open, close) = brace_counts(text);
    if open != close {
        return VerificationResult::failed(
            FailureKind::SanitizeFailed,
            format!("Unbalanced braces: {{={}, }}={}", open, close),
        );
    }

    VerificationResult::Passed
}

fn brace_counts(text: &str) -> (usize, usize) {
    text.bytes().fold((0, 0), |(open, close), b| match b {
        b'{' => (open + 1, close),
        b'}' => (open, close + 1),
        _ => (open, close),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(text: &str) -> Option<FailureKind> {
        sanitize(text).code()
    }

    #[test]
    fn test_empty_is_schema_failure() {
        assert_eq!(code(""), Some(FailureKind::SchemaFailed));
    }

    #[test]
    fn test_balance_is_a_count_rule() {
        assert!(sanitize("{a}{b}").is_passed());
        assert_eq!(code("{a"), Some(FailureKind::SanitizeFailed));
        assert!(sanitize("}{").is_passed());
    }

    #[test]
    fn test_every_rule_rejects_its_sample() {
        for rule in denylist() {
            let result = sanitize(rule.sample);
            assert_eq!(
                result.code(),
                Some(FailureKind::SanitizeFailed),
                "rule {} did not reject {}",
                rule.name,
                rule.sample
            );
            assert!(result.reason().unwrap().contains("Forbidden pattern"));
        }
    }

    #[test]
    fn test_macro_definition_variants() {
        assert_eq!(code(r"\gdef\x{1}"), Some(FailureKind::SanitizeFailed));
        assert_eq!(code(r"\edef\x{1}"), Some(FailureKind::SanitizeFailed));
        assert_eq!(code(r"\write12{x}"), Some(FailureKind::SanitizeFailed));
    }

    #[test]
    fn test_clean_math_passes() {
        let text = r"$\frac{1}{2} + \sqrt{x^2+1} = \sin\theta$ を計算せよ。";
        assert!(sanitize(text).is_passed());
    }

    #[test]
    fn test_denylist_wins_over_balance() {
        let result = sanitize(r"\input{secret");
        assert!(result.reason().unwrap().contains("Forbidden"));
    }

    #[test]
    fn test_huge_input_terminates() {
        let text = "x^2 + ".repeat(40_000);
        assert!(text.len() > 100_000);
        assert!(sanitize(&text).is_passed());
    }

    #[test]
    fn test_deeply_nested_input_terminates() {
        let depth = 200_000;
        let mut text = "{".repeat(depth);
        text.push_str(&"}".repeat(depth));
        assert!(sanitize(&text).is_passed());

        text.push('{');
        assert_eq!(code(&text), Some(FailureKind::SanitizeFailed));
    }

    #[test]
    fn test_arbitrary_bytes_never_panic() {
        let inputs = [
            "\u{0}\u{1}\u{7f}",
            "\\",
            "\\\\\\",
            "$$$$",
            "🙂{🙂}",
            "\u{FEFF}{",
        ];
        for input in inputs {
            let _ = sanitize(input);
        }
    }
}
