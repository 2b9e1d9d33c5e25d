//! End-to-end runs of the verified generation pipeline against scripted
//! collaborators.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mathsheet_core::fakes::{ScriptedCompiler, ScriptedGenerator};
use mathsheet_core::{
    CompileFanout, CompileVerifier, ConcurrencyGate, Difficulty, FailureKind, GeneratedItem,
    GenerationError, GenerationPipeline, GenerationRequest, ItemVerifier, PipelineConfig,
    PipelineError, ProblemBatch, RunHooks, SheetLayout, UserContent,
};
use tokio_util::sync::CancellationToken;

fn valid(n: usize) -> GeneratedItem {
    GeneratedItem::new(
        format!("$x + {} = {}$ を解け。", n, n + 3),
        "$x = 3$",
        Difficulty::L1,
    )
}

fn broken(n: usize) -> GeneratedItem {
    GeneratedItem::new(format!("$\\badmacro{{{}}}$ を求めよ。", n), "$1$", Difficulty::L1)
}

fn batch(items: Vec<GeneratedItem>) -> ProblemBatch {
    ProblemBatch::new(items)
}

fn config(max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        max_retries,
        ..PipelineConfig::default()
    }
}

fn pipeline(
    generator: &Arc<ScriptedGenerator>,
    compiler: &Arc<ScriptedCompiler>,
    config: PipelineConfig,
) -> GenerationPipeline {
    let verifier = ItemVerifier::new(
        CompileVerifier::new(compiler.clone(), SheetLayout::default(), config.verify_timeout()),
        config.compile_fanout,
    );
    GenerationPipeline::new(generator.clone(), verifier, config)
}

fn user_text(generator: &ScriptedGenerator, call: usize) -> String {
    generator.calls()[call].user_content.text_summary()
}

#[tokio::test]
async fn scenario_a_single_batch_fills_target() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch((0..5).map(valid).collect())));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(2));

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("一次方程式", 5, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 5);
    assert_eq!(generator.call_count(), 1);
    assert_eq!(outcome.metadata.attempts, 1);
    assert!(outcome.metadata.complete);
    assert!(outcome.metadata.rejections.is_empty());
    assert!(user_text(&generator, 0).contains("Count: 8"));
    assert!(user_text(&generator, 0).contains("Unit: 一次方程式"));
}

#[tokio::test]
async fn scenario_b_backfills_remaining_items() {
    let first = vec![valid(1), broken(1), valid(2), broken(2), broken(3)];
    let second = vec![valid(3), valid(4), valid(5), valid(6)];
    let generator = Arc::new(ScriptedGenerator::from_batches(vec![
        Ok(batch(first)),
        Ok(batch(second)),
    ]));
    let compiler = Arc::new(ScriptedCompiler::rejecting_containing("\\badmacro"));
    let pipeline = pipeline(&generator, &compiler, config(2));

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("一次方程式", 5, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 5);
    assert_eq!(outcome.metadata.attempts, 2);
    assert_eq!(generator.call_count(), 2);
    assert!(user_text(&generator, 1).contains("Count: 4"));
    assert_eq!(
        outcome.metadata.rejections,
        BTreeMap::from([(FailureKind::CompileFailed, 3)])
    );

    let stems: Vec<&str> = outcome.items.iter().map(|v| v.item().stem_text.as_str()).collect();
    assert_eq!(stems[0], valid(1).stem_text);
    assert_eq!(stems[1], valid(2).stem_text);
    assert_eq!(stems[4], valid(5).stem_text);
}

#[tokio::test]
async fn scenario_c_sanitizer_exhausts_retries() {
    let poisoned = GeneratedItem::new("\\input{/etc/passwd} を表示せよ。", "$0$", Difficulty::L1);
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![poisoned; 3])));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(2));

    let err = pipeline
        .generate_verified(
            &GenerationRequest::new("集合", 3, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap_err();

    match err {
        PipelineError::Exhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.starts_with("SANITIZE_FAILED"), "{}", last_error);
        }
        other => panic!("expected Exhausted, got {:?}", other),
    }
    assert_eq!(generator.call_count(), 3);
    assert_eq!(compiler.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_hanging_compiler_is_reported() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1), valid(2)])));
    let compiler = Arc::new(ScriptedCompiler::hanging(Duration::from_secs(3600)));
    let pipeline = pipeline(
        &generator,
        &compiler,
        PipelineConfig {
            max_retries: 0,
            verify_timeout_secs: 60,
            ..PipelineConfig::default()
        },
    );

    let err = pipeline
        .generate_verified(
            &GenerationRequest::new("関数", 2, Difficulty::L2),
            RunHooks::default(),
        )
        .await
        .unwrap_err();

    match err {
        PipelineError::Exhausted { last_error, .. } => {
            assert!(last_error.starts_with("COMPILE_FAILED"), "{}", last_error);
            assert!(last_error.contains("timed out after 60s"), "{}", last_error);
        }
        other => panic!("expected Exhausted, got {:?}", other),
    }
    assert_eq!(compiler.call_count(), 2);
}

#[tokio::test]
async fn scenario_d_engine_timeout_is_reported() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1)])));
    let compiler = Arc::new(ScriptedCompiler::timing_out(60));
    let pipeline = pipeline(&generator, &compiler, config(1));

    let err = pipeline
        .generate_verified(
            &GenerationRequest::new("関数", 1, Difficulty::L2),
            RunHooks::default(),
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("COMPILE_FAILED: compilation timed out after 60s"));
    assert_eq!(generator.call_count(), 2);
}

#[tokio::test]
async fn service_calls_are_bounded_by_retry_budget() {
    for max_retries in 0..=4 {
        let generator = Arc::new(ScriptedGenerator::new(|_| {
            Err(GenerationError::Other("upstream unavailable".to_string()))
        }));
        let compiler = Arc::new(ScriptedCompiler::accepting());
        let pipeline = pipeline(&generator, &compiler, config(max_retries));

        let err = pipeline
            .generate_verified(
                &GenerationRequest::new("数列", 4, Difficulty::L3),
                RunHooks::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(generator.call_count(), max_retries as usize + 1);
        assert!(err.to_string().contains("UNKNOWN: generation failed: upstream unavailable"));
    }
}

#[tokio::test]
async fn progress_is_monotonic_and_matches_result() {
    let generator = Arc::new(ScriptedGenerator::from_batches(vec![
        Ok(batch(vec![valid(1), broken(1), valid(2)])),
        Ok(batch(vec![broken(2), valid(3), valid(4)])),
    ]));
    let compiler = Arc::new(ScriptedCompiler::rejecting_containing("\\badmacro"));
    let pipeline = pipeline(&generator, &compiler, config(2));

    let seen = Mutex::new(Vec::new());
    let on_progress = |accepted: usize, target: usize| seen.lock().unwrap().push((accepted, target));

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("確率", 4, Difficulty::L2),
            RunHooks::default().with_progress(&on_progress),
        )
        .await
        .unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
    assert_eq!(outcome.items.len(), 4);
}

#[tokio::test]
async fn partial_results_are_returned_without_error() {
    let generator = Arc::new(ScriptedGenerator::from_batches(vec![
        Ok(batch(vec![valid(1), broken(1)])),
        Ok(batch(vec![broken(2), valid(2)])),
    ]));
    let compiler = Arc::new(ScriptedCompiler::rejecting_containing("\\badmacro"));
    let pipeline = pipeline(&generator, &compiler, config(1));

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("図形", 5, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 2);
    assert!(!outcome.metadata.complete);
    assert_eq!(outcome.metadata.attempts, 2);
    assert!(outcome.metadata.last_error.unwrap().starts_with("COMPILE_FAILED"));
}

#[tokio::test]
async fn missing_credential_fails_before_any_call() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1)])).without_credential());
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(2));

    let err = pipeline
        .generate_verified(
            &GenerationRequest::new("整数", 1, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::MissingCredential));
    assert_eq!(generator.call_count(), 0);
}

#[tokio::test]
async fn zero_target_is_rejected() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1)])));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(2));

    let err = pipeline
        .generate_verified(
            &GenerationRequest::new("整数", 0, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert_eq!(generator.call_count(), 0);
}

#[tokio::test]
async fn oversized_target_is_rejected_without_allocating() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1)])));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(2));

    for target in [51, usize::MAX] {
        let err = pipeline
            .generate_verified(
                &GenerationRequest::new("一次方程式", target, Difficulty::L1),
                RunHooks::default(),
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::InvalidRequest(reason) => {
                assert!(reason.contains("exceeds the limit of 50"), "{}", reason)
            }
            other => panic!("expected InvalidRequest, got {:?}", other),
        }
    }
    assert_eq!(generator.call_count(), 0);
}

#[tokio::test]
async fn target_at_the_limit_is_accepted() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch((0..3).map(valid).collect())));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let config = PipelineConfig {
        max_target_count: 3,
        ..config(0)
    };
    let pipeline = pipeline(&generator, &compiler, config);

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("一次方程式", 3, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.items.len(), 3);
}

#[tokio::test]
async fn cancelled_token_stops_before_first_call() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1)])));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(2));
    let token = CancellationToken::new();
    token.cancel();

    let err = pipeline
        .generate_verified(
            &GenerationRequest::new("整数", 1, Difficulty::L1),
            RunHooks::default().with_cancel(&token),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(generator.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_inflight_compile() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1)])));
    let compiler = Arc::new(ScriptedCompiler::hanging(Duration::from_secs(3600)));
    let pipeline = pipeline(
        &generator,
        &compiler,
        PipelineConfig {
            verify_timeout_secs: 7200,
            ..PipelineConfig::default()
        },
    );
    let token = CancellationToken::new();
    let request = GenerationRequest::new("整数", 1, Difficulty::L1);

    let cancel_later = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(
        pipeline.generate_verified(&request, RunHooks::default().with_cancel(&token)),
        cancel_later
    );

    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert_eq!(compiler.call_count(), 1);
}

#[tokio::test]
async fn full_gate_reports_busy() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1)])));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let gate = ConcurrencyGate::new(1);
    let pipeline = pipeline(&generator, &compiler, config(2)).with_gate(gate.clone());

    let held = gate.try_enter().unwrap();
    let request = GenerationRequest::new("整数", 1, Difficulty::L1);
    let err = pipeline
        .generate_verified(&request, RunHooks::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Busy { limit: 1 }));

    drop(held);
    let outcome = pipeline
        .generate_verified(&request, RunHooks::default())
        .await
        .unwrap();
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(gate.available(), 1);
}

#[tokio::test]
async fn regenerate_returns_first_verified_item() {
    let generator = Arc::new(ScriptedGenerator::from_batches(vec![
        Ok(batch(vec![broken(1)])),
        Ok(batch(vec![valid(7), valid(8)])),
    ]));
    let compiler = Arc::new(ScriptedCompiler::rejecting_containing("\\badmacro"));
    let pipeline = pipeline(&generator, &compiler, config(2));
    let prior = valid(1);

    let item = pipeline
        .regenerate(
            Some(&prior),
            "数値を大きくして",
            "一次方程式",
            Difficulty::L2,
            RunHooks::default(),
        )
        .await
        .unwrap();

    assert_eq!(item.item().stem_text, valid(7).stem_text);
    assert_eq!(generator.call_count(), 2);
    let prompt = user_text(&generator, 0);
    assert!(prompt.contains("Instruction: 数値を大きくして"));
    assert!(prompt.contains(&prior.stem_text));
}

#[tokio::test]
async fn duplicates_are_rejected_as_invalid_content() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![valid(1); 3])));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(1));

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("整数", 2, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(
        outcome.metadata.rejections.get(&FailureKind::ContentInvalid),
        Some(&5)
    );
    assert_eq!(
        outcome.metadata.last_error.as_deref(),
        Some("CONTENT_INVALID: duplicate item")
    );
    // duplicates never reach the compiler
    assert_eq!(compiler.call_count(), 2);
}

#[tokio::test]
async fn batch_failure_is_retried() {
    let mut second = batch(vec![valid(1), valid(2)]);
    second.intent = Some("一次方程式の基本".to_string());
    second.summary_notes = Some("移項".to_string());
    let generator = Arc::new(ScriptedGenerator::from_batches(vec![
        Err(GenerationError::Status {
            status: 502,
            body: "bad gateway".to_string(),
        }),
        Ok(second),
    ]));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(2));

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("一次方程式", 2, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 2);
    assert_eq!(outcome.metadata.attempts, 2);
    assert_eq!(outcome.metadata.batch_failures, 1);
    assert_eq!(outcome.intent.as_deref(), Some("一次方程式の基本"));
    assert_eq!(outcome.summary_notes.as_deref(), Some("移項"));
    assert!(user_text(&generator, 1).contains("Count: 3"));
}

#[tokio::test]
async fn repairs_are_visible_in_accepted_items() {
    let raw = GeneratedItem::new("x^2-9=0", "x=\\pm 3", Difficulty::L1);
    let generator = Arc::new(ScriptedGenerator::repeating(batch(vec![raw])));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(0));

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("二次方程式", 1, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap();

    let item = outcome.items[0].item();
    assert_eq!(item.stem_text, "$x^2-9=0$");
    assert_eq!(item.answer_text, "$x=\\pm 3$");
    assert_eq!(outcome.items[0].fingerprint(), item.fingerprint());
}

#[tokio::test]
async fn parallel_fanout_produces_same_result() {
    let items = vec![valid(1).with_explanation("$x$ を移項する"), broken(1), valid(2)];
    let generator = Arc::new(ScriptedGenerator::repeating(batch(items)));
    let compiler = Arc::new(ScriptedCompiler::rejecting_containing("\\badmacro"));
    let pipeline = pipeline(
        &generator,
        &compiler,
        PipelineConfig {
            compile_fanout: CompileFanout::Parallel,
            ..PipelineConfig::default()
        },
    );

    let outcome = pipeline
        .generate_verified(
            &GenerationRequest::new("一次方程式", 2, Difficulty::L1),
            RunHooks::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 2);
    assert_eq!(outcome.metadata.rejections.get(&FailureKind::CompileFailed), Some(&1));
}

#[tokio::test]
async fn free_prompt_forwards_content_and_model() {
    let generator = Arc::new(ScriptedGenerator::repeating(batch((0..3).map(valid).collect())));
    let compiler = Arc::new(ScriptedCompiler::accepting());
    let pipeline = pipeline(&generator, &compiler, config(2));
    let content = UserContent::text("この画像と同じ形式で")
        .with_image_url("data:image/png;base64,iVBORw0KGgo=");

    let outcome = pipeline
        .generate_verified_from_prompt(
            "You write worksheets.",
            &content,
            3,
            Some("gpt-4o-mini"),
            RunHooks::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 3);
    let call = &generator.calls()[0];
    assert!(call.system_prompt.ends_with("Generate exactly 5 problems."));
    assert_eq!(call.user_content, content);
    assert_eq!(call.model.as_deref(), Some("gpt-4o-mini"));
}
