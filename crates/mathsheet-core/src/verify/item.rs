//! Per-item verification chain.

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::compile::CompileVerifier;
use super::repair::repair_with_report;
use super::sanitize::sanitize;
use super::structural::check_content;
use crate::domain::{GeneratedItem, VerificationResult};
use crate::layout::CompileContext;
use crate::obs;

/// How the compile checks of one item's fields are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileFanout {
    /// Stem, then answer, then explanation; stop at the first failure.
    #[default]
    Sequential,
    /// All fields at once; the first failure in field order is reported.
    Parallel,
}

/// Runs repair, sanitize, structural and compile stages on one candidate.
#[derive(Clone)]
pub struct ItemVerifier {
    compile: CompileVerifier,
    fanout: CompileFanout,
}

impl ItemVerifier {
    pub fn new(compile: CompileVerifier, fanout: CompileFanout) -> Self {
        Self { compile, fanout }
    }

    /// Repair every text field of `item` in place.
    ///
    /// Idempotent, so calling it before [`verify_item`](Self::verify_item) is
    /// harmless.
    pub fn repair_fields(item: &mut GeneratedItem) {
        for (field, text) in item.text_fields_mut() {
            let report = repair_with_report(text);
            if report.ambiguous {
                obs::emit_repair_ambiguous(field, &report.text);
            }
            if report.changed() {
                *text = report.text;
            }
        }
    }

    /// Verify `item`, repairing it in place first. Short-circuits on the
    /// first failing stage; compile checks run only after every cheap stage
    /// has passed.
    pub async fn verify_item(&self, item: &mut GeneratedItem) -> VerificationResult {
        Self::repair_fields(item);

        let result = self.check_static(item);
        if !result.is_passed() {
            return result;
        }

        let mut jobs = vec![
            (item.stem_text.as_str(), CompileContext::Stem),
            (item.answer_text.as_str(), CompileContext::Answer),
        ];
        if item.has_explanation() {
            jobs.push((item.explanation_text.as_str(), CompileContext::Answer));
        }

        match self.fanout {
            CompileFanout::Sequential => {
                for (fragment, context) in jobs {
                    let result = self.compile.check_compilation(fragment, context).await;
                    if !result.is_passed() {
                        return result;
                    }
                }
                VerificationResult::Passed
            }
            CompileFanout::Parallel => {
                let results = join_all(
                    jobs.into_iter()
                        .map(|(fragment, context)| self.compile.check_compilation(fragment, context)),
                )
                .await;
                results
                    .into_iter()
                    .find(|r| !r.is_passed())
                    .unwrap_or(VerificationResult::Passed)
            }
        }
    }

    /// Repair, sanitize and compile one standalone fragment, as used for
    /// feedback text.
    pub async fn verify_fragment(&self, text: &mut String, context: CompileContext) -> VerificationResult {
        let report = repair_with_report(text);
        if report.changed() {
            *text = report.text;
        }
        let result = sanitize(text);
        if !result.is_passed() {
            return result;
        }
        self.compile.check_compilation(text, context).await
    }

    /// Sanitize and structural stages only, in field order. Returns at the
    /// first failure.
    pub fn check_static(&self, item: &GeneratedItem) -> VerificationResult {
        let explanation = item
            .has_explanation()
            .then_some(item.explanation_text.as_str());
        let hint = item.has_hint().then_some(item.hint_text.as_str());
        let mistake = item
            .has_common_mistake()
            .then_some(item.common_mistake_text.as_str());
        let fields = [
            Some(item.stem_text.as_str()),
            Some(item.answer_text.as_str()),
            explanation,
            hint,
            mistake,
        ];
        for text in fields.into_iter().flatten() {
            let result = sanitize(text);
            if !result.is_passed() {
                return result;
            }
        }
        check_content(item)
    }
}
