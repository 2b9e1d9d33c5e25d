//! mathsheet - verified mathematics exercise sheets
//!
//! The `mathsheet` command drives the verified generation pipeline and the
//! sheet renderer.
//!
//! ## Commands
//!
//! - `generate`: Request verified problems for one or more units
//! - `prompt`: Generate from a free-form prompt, optionally with images
//! - `regenerate`: Replace one problem following an instruction
//! - `feedback`: Add explanation, hint and common mistake to a problem file
//! - `verify`: Run the verification chain over a problem file
//! - `render`: Typeset a sheet from a problem file or static templates
//! - `check-engine`: Report whether the TeX engine is usable

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use mathsheet_core::config::TARGET_COUNT_CEILING;
use mathsheet_core::generation::prompts;
use mathsheet_core::telemetry::init_tracing;
use mathsheet_core::templates::UnitMap;
use mathsheet_core::{
    BatchConfig, CompileContext, CompileVerifier, Compiler, ConcurrencyGate, Difficulty,
    FailureKind, GeneratedItem, GenerationPipeline, GenerationRequest, GenerationService,
    ItemVerifier, OpenAiClient, PipelineConfig, PipelineError, ProblemBatch, RunHooks, RunMetadata, SheetLayout,
    SheetSpec, TemplateGenerator, TypesetEngine, UserContent, VerifiedItem,
};
use mathsheet_typeset::{LatexCompiler, TypesetConfig};

#[derive(Parser)]
#[command(name = "mathsheet")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Verified generation of mathematics exercise sheets", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML config file with [pipeline] and [typeset] tables
    #[arg(short, long, global = true, env = "MATHSHEET_CONFIG")]
    config: Option<PathBuf>,

    /// TeX engine (overrides config and PDF_ENGINE)
    #[arg(long, global = true)]
    engine: Option<TypesetEngine>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate verified problems for one or more units
    Generate {
        /// Unit id or title; repeat for several units
        #[arg(short, long = "unit", required = true)]
        units: Vec<String>,

        /// Unit map (JSON) used to resolve unit ids to titles
        #[arg(long)]
        unit_map: Option<PathBuf>,

        /// Number of verified problems wanted
        #[arg(short = 'n', long, default_value = "5", value_parser = parse_count)]
        count: usize,

        /// Difficulty tier (L1..L5)
        #[arg(short, long, default_value = "L2")]
        difficulty: Difficulty,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Additional instructions passed to the generator
        #[arg(long)]
        extra: Option<String>,

        /// Write the problem set (JSON) here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        sheet: SheetArgs,
    },

    /// Generate from a free-form prompt
    Prompt {
        /// User prompt text
        text: String,

        /// System prompt file (default: built-in)
        #[arg(long)]
        system_file: Option<PathBuf>,

        /// Image to attach; repeat for several
        #[arg(long = "image")]
        images: Vec<PathBuf>,

        /// UTF-8 text file attached as reference material (PDFs are refused)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,

        /// Number of verified problems wanted
        #[arg(short = 'n', long, default_value = "5", value_parser = parse_count)]
        count: usize,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Write the problem set (JSON) here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        sheet: SheetArgs,
    },

    /// Replace one problem following an instruction
    Regenerate {
        /// Current problem (JSON object)
        #[arg(long)]
        item: Option<PathBuf>,

        /// What to change
        #[arg(short, long)]
        instruction: String,

        /// Unit title the replacement belongs to
        #[arg(short, long)]
        topic: String,

        /// Difficulty tier (L1..L5)
        #[arg(short, long, default_value = "L2")]
        difficulty: Difficulty,

        /// Write the verified problem (JSON) here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Add explanation, hint and common mistake to each problem in a file
    Feedback {
        /// Problem set or array of problems (JSON)
        input: PathBuf,

        /// Only this problem (1-based); repeat for several
        #[arg(long = "only")]
        only: Vec<usize>,

        /// Model override (default: feedback_model, then model)
        #[arg(long)]
        model: Option<String>,

        /// Write the problem set (JSON) here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the verification chain over a problem file
    Verify {
        /// Problem set or array of problems (JSON)
        input: PathBuf,

        /// Write a per-item report (JSON) here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Typeset a sheet from a problem file or from static templates
    Render {
        /// Problem set or array of problems (JSON)
        #[arg(long, conflicts_with_all = ["unit_map", "templates"])]
        items: Option<PathBuf>,

        /// Unit map (JSON) for template generation
        #[arg(long, requires = "templates")]
        unit_map: Option<PathBuf>,

        /// Question templates (JSON) for template generation
        #[arg(long, requires = "unit_map")]
        templates: Option<PathBuf>,

        /// Unit id for template generation; repeat for several units
        #[arg(short, long = "unit")]
        units: Vec<String>,

        /// Difficulty tiers for template generation
        #[arg(short, long = "difficulty", value_delimiter = ',', default_value = "L1")]
        difficulties: Vec<Difficulty>,

        /// Number of template problems
        #[arg(short = 'n', long, default_value = "10", value_parser = parse_count)]
        count: usize,

        /// Mix in prerequisite units
        #[arg(long)]
        prereqs: bool,

        /// RNG seed for reproducible template sheets
        #[arg(long)]
        seed: Option<u64>,

        /// Drop problems that fail verification before rendering
        #[arg(long)]
        verify: bool,

        #[command(flatten)]
        sheet: SheetArgs,
    },

    /// Report whether the configured TeX engine is usable
    CheckEngine {
        /// Also compile a small probe document
        #[arg(long)]
        probe: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct SheetArgs {
    /// Typeset the sheet to this PDF
    #[arg(long)]
    pdf: Option<PathBuf>,

    /// Write the sheet source to this file
    #[arg(long)]
    tex: Option<PathBuf>,

    /// Append the instructor guide page
    #[arg(long)]
    instructor_guide: bool,

    /// Larger answer areas
    #[arg(long)]
    more_work_space: bool,
}

impl SheetArgs {
    fn wants_output(&self) -> bool {
        self.pdf.is_some() || self.tex.is_some()
    }
}

/// Config file layout: one table per crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    pipeline: PipelineConfig,
    typeset: TypesetConfig,
}

impl FileConfig {
    fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).context("Failed to parse config")
    }

    /// Read `path` (defaults when absent), then overlay the environment.
    fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {:?}", path))?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.pipeline.apply_env_from(&lookup)?;
        self.typeset.apply_env_from(&lookup)?;
        self.pipeline.validate()?;
        self.typeset.validate()?;
        Ok(())
    }

    fn layout(&self) -> SheetLayout {
        SheetLayout::new(self.typeset.engine)
    }

    fn item_verifier(&self, compiler: Arc<dyn Compiler>) -> ItemVerifier {
        let compile = CompileVerifier::new(compiler, self.layout(), self.pipeline.verify_timeout());
        ItemVerifier::new(compile, self.pipeline.compile_fanout)
    }

    fn build_pipeline(
        &self,
        generator: Arc<dyn GenerationService>,
        compiler: Arc<dyn Compiler>,
    ) -> GenerationPipeline {
        GenerationPipeline::new(generator, self.item_verifier(compiler), self.pipeline.clone())
            .with_gate(ConcurrencyGate::new(self.pipeline.max_concurrent))
    }
}

/// Problem files hold either a full problem set or a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum ItemsFile {
    Batch(ProblemBatch),
    Items(Vec<GeneratedItem>),
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    index: usize,
    passed: bool,
    code: Option<FailureKind>,
    reason: Option<String>,
    item: GeneratedItem,
}

#[derive(Debug, Serialize)]
struct GenerateOutput<'a> {
    #[serde(flatten)]
    batch: &'a ProblemBatch,
    metadata: &'a RunMetadata,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut config = FileConfig::load(cli.config.as_deref())?;
    if let Some(engine) = cli.engine {
        config.typeset.engine = engine;
    }

    let compiler = Arc::new(LatexCompiler::new(config.typeset.clone()));
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Generate {
            units,
            unit_map,
            count,
            difficulty,
            model,
            extra,
            output,
            sheet,
        } => {
            let topic = resolve_topic(&units, unit_map.as_deref())?;
            let mut request = GenerationRequest::new(topic, count, difficulty);
            if let Some(model) = model {
                request = request.with_model(model);
            }
            if let Some(extra) = extra {
                request = request.with_extra_instructions(extra);
            }
            let generator = Arc::new(OpenAiClient::new(&config.pipeline)?);
            let pipeline = config.build_pipeline(generator, compiler.clone());
            cmd_generate(
                &pipeline,
                compiler.as_ref(),
                config.layout(),
                &request,
                output.as_deref(),
                &sheet,
                &cancel,
            )
            .await
        }
        Commands::Prompt {
            text,
            system_file,
            images,
            attachments,
            count,
            model,
            output,
            sheet,
        } => {
            let system_prompt = match system_file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read system prompt {:?}", path))?,
                None => prompts::free_prompt_system_prompt(),
            };
            let content = build_user_content(&text, &images, &attachments)?;
            let generator = Arc::new(OpenAiClient::new(&config.pipeline)?);
            let pipeline = config.build_pipeline(generator, compiler.clone());
            cmd_prompt(
                &pipeline,
                compiler.as_ref(),
                config.layout(),
                &system_prompt,
                &content,
                count,
                model.as_deref(),
                output.as_deref(),
                &sheet,
                &cancel,
            )
            .await
        }
        Commands::Regenerate {
            item,
            instruction,
            topic,
            difficulty,
            output,
        } => {
            let prior = item.as_deref().map(read_item).transpose()?;
            let generator = Arc::new(OpenAiClient::new(&config.pipeline)?);
            let pipeline = config.build_pipeline(generator, compiler.clone());
            cmd_regenerate(
                &pipeline,
                prior.as_ref(),
                &instruction,
                &topic,
                difficulty,
                output.as_deref(),
                &cancel,
            )
            .await
        }
        Commands::Feedback {
            input,
            only,
            model,
            output,
        } => {
            let generator = Arc::new(OpenAiClient::new(&config.pipeline)?);
            let pipeline = config.build_pipeline(generator, compiler.clone());
            cmd_feedback(&pipeline, &input, &only, model.as_deref(), output.as_deref()).await
        }
        Commands::Verify { input, report } => {
            let verifier = config.item_verifier(compiler.clone());
            cmd_verify(&verifier, &input, report.as_deref()).await
        }
        Commands::Render {
            items,
            unit_map,
            templates,
            units,
            difficulties,
            count,
            prereqs,
            seed,
            verify,
            sheet,
        } => {
            let source = match (items, unit_map, templates) {
                (Some(path), _, _) => RenderSource::Items(path),
                (None, Some(unit_map), Some(templates)) => RenderSource::Templates {
                    unit_map,
                    templates,
                    batch: BatchConfig {
                        unit_ids: units,
                        difficulties,
                        count,
                        use_prereqs: prereqs,
                    },
                    seed,
                },
                _ => bail!("Pass --items, or --unit-map together with --templates"),
            };
            let verifier = verify.then(|| config.item_verifier(compiler.clone()));
            cmd_render(
                compiler.as_ref(),
                config.layout(),
                &source,
                verifier.as_ref(),
                &sheet,
            )
            .await
        }
        Commands::CheckEngine { probe } => cmd_check_engine(&compiler, config.layout(), probe).await,
    }
}

/// Problem counts accepted on the command line.
fn parse_count(raw: &str) -> std::result::Result<usize, String> {
    let count: usize = raw
        .trim()
        .parse()
        .map_err(|e| format!("'{}' is not a count: {}", raw, e))?;
    if count == 0 || count > TARGET_COUNT_CEILING {
        return Err(format!("count must be between 1 and {}", TARGET_COUNT_CEILING));
    }
    Ok(count)
}

/// Cancel the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            child.cancel();
        }
    });
    token
}

fn print_progress(accepted: usize, target: usize) {
    eprintln!("Verified {}/{}", accepted, target);
}

/// Join unit titles into one topic string. Ids missing from the unit map
/// are used as titles.
fn resolve_topic(units: &[String], unit_map: Option<&Path>) -> Result<String> {
    let titles: Vec<String> = match unit_map {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read unit map {:?}", path))?;
            let map: UnitMap = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse unit map {:?}", path))?;
            let generator = TemplateGenerator::from_parts(map, Vec::new());
            units
                .iter()
                .map(|id| generator.unit_title(id).to_string())
                .collect()
        }
        None => units.to_vec(),
    };
    let titles: Vec<&str> = titles
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if titles.is_empty() {
        bail!("At least one non-empty unit is required");
    }
    Ok(titles.join("、"))
}

fn image_data_url(path: &Path) -> Result<String> {
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => bail!("Unsupported image type: {:?}", path),
    };
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read image {:?}", path))?;
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
}

/// Text attachments only. PDFs and other binary files are refused instead of
/// being sent as mangled text.
fn attachment_text(path: &Path) -> Result<String> {
    let is_pdf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
    if is_pdf {
        bail!(
            "PDF attachments are not supported: {:?}; extract the text first or attach pages with --image",
            path
        );
    }
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read attachment {:?}", path))?;
    if bytes.starts_with(b"%PDF-") {
        bail!("Attachment {:?} is a PDF document; only text files can be attached", path);
    }
    String::from_utf8(bytes)
        .map_err(|_| anyhow::anyhow!("Attachment {:?} is not UTF-8 text", path))
}

fn build_user_content(text: &str, images: &[PathBuf], attachments: &[PathBuf]) -> Result<UserContent> {
    let mut content = UserContent::text(text);
    for path in attachments {
        let body = attachment_text(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        content = content.with_text_part(format!("[Reference: {}]\n{}", name, body));
    }
    for path in images {
        content = content.with_image_url(image_data_url(path)?);
    }
    Ok(content)
}

fn read_items(path: &Path) -> Result<ProblemBatch> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read problem file {:?}", path))?;
    let file: ItemsFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse problem file {:?}", path))?;
    Ok(match file {
        ItemsFile::Batch(batch) => batch,
        ItemsFile::Items(items) => ProblemBatch::new(items),
    })
}

fn read_item(path: &Path) -> Result<GeneratedItem> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read problem {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse problem {:?}", path))
}

fn write_json<T: Serialize>(output: Option<&Path>, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote {:?}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Write the sheet source and/or the compiled PDF, as requested.
async fn write_sheet(
    compiler: &dyn Compiler,
    layout: SheetLayout,
    spec: &SheetSpec,
    items: &[GeneratedItem],
    sheet: &SheetArgs,
) -> Result<()> {
    let source = layout.render_sheet(spec, items);
    if let Some(path) = &sheet.tex {
        std::fs::write(path, &source).with_context(|| format!("Failed to write {:?}", path))?;
        println!("Wrote {:?}", path);
    }
    if let Some(path) = &sheet.pdf {
        let pdf = compiler
            .compile(&source)
            .await
            .context("Failed to typeset sheet")?;
        std::fs::write(path, &pdf).with_context(|| format!("Failed to write {:?}", path))?;
        println!("Wrote {:?} ({} bytes)", path, pdf.len());
    }
    Ok(())
}

fn sheet_spec(
    unit_titles: Vec<String>,
    difficulties: Vec<Difficulty>,
    point_review: Option<String>,
    sheet: &SheetArgs,
) -> SheetSpec {
    SheetSpec {
        unit_titles,
        difficulties,
        more_work_space: sheet.more_work_space,
        instructor_guide: sheet.instructor_guide,
        point_review,
    }
}

fn report_run(metadata: &RunMetadata) {
    info!(
        run_id = %metadata.run_id,
        accepted = metadata.accepted_count,
        requested = metadata.requested_count,
        attempts = metadata.attempts,
        "Generation finished"
    );
    if !metadata.complete {
        warn!(
            "Only {} of {} problems verified after {} attempt(s); last error: {}",
            metadata.accepted_count,
            metadata.requested_count,
            metadata.attempts,
            metadata.last_error.as_deref().unwrap_or("none")
        );
    }
}

fn outcome_batch(
    items: Vec<VerifiedItem>,
    intent: Option<String>,
    summary_notes: Option<String>,
) -> ProblemBatch {
    ProblemBatch {
        items: items.into_iter().map(VerifiedItem::into_item).collect(),
        intent,
        summary_notes,
    }
}

/// Generate verified problems for a topic
async fn cmd_generate(
    pipeline: &GenerationPipeline,
    compiler: &dyn Compiler,
    layout: SheetLayout,
    request: &GenerationRequest,
    output: Option<&Path>,
    sheet: &SheetArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Generating {} problem(s) for {}", request.target_count, request.topic);

    let hooks = RunHooks::default()
        .with_progress(&print_progress)
        .with_cancel(cancel);
    let outcome = pipeline
        .generate_verified(request, hooks)
        .await
        .context("Generation failed")?;
    report_run(&outcome.metadata);

    let batch = outcome_batch(outcome.items, outcome.intent, outcome.summary_notes);
    write_json(
        output,
        &GenerateOutput {
            batch: &batch,
            metadata: &outcome.metadata,
        },
    )?;

    if sheet.wants_output() {
        let spec = sheet_spec(
            vec![request.topic.clone()],
            vec![request.difficulty],
            batch.summary_notes.clone(),
            sheet,
        );
        write_sheet(compiler, layout, &spec, &batch.items, sheet).await?;
    }
    Ok(())
}

/// Generate verified problems from a free-form prompt
#[allow(clippy::too_many_arguments)]
async fn cmd_prompt(
    pipeline: &GenerationPipeline,
    compiler: &dyn Compiler,
    layout: SheetLayout,
    system_prompt: &str,
    content: &UserContent,
    count: usize,
    model: Option<&str>,
    output: Option<&Path>,
    sheet: &SheetArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let hooks = RunHooks::default()
        .with_progress(&print_progress)
        .with_cancel(cancel);
    let outcome = pipeline
        .generate_verified_from_prompt(system_prompt, content, count, model, hooks)
        .await
        .context("Generation failed")?;
    report_run(&outcome.metadata);

    let batch = outcome_batch(outcome.items, outcome.intent, outcome.summary_notes);
    write_json(
        output,
        &GenerateOutput {
            batch: &batch,
            metadata: &outcome.metadata,
        },
    )?;

    if sheet.wants_output() {
        let mut difficulties: Vec<Difficulty> = batch.items.iter().map(|i| i.difficulty).collect();
        difficulties.sort();
        difficulties.dedup();
        let title = batch.intent.clone().unwrap_or_default();
        let spec = sheet_spec(vec![title], difficulties, batch.summary_notes.clone(), sheet);
        write_sheet(compiler, layout, &spec, &batch.items, sheet).await?;
    }
    Ok(())
}

/// Replace one problem
async fn cmd_regenerate(
    pipeline: &GenerationPipeline,
    prior: Option<&GeneratedItem>,
    instruction: &str,
    topic: &str,
    difficulty: Difficulty,
    output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let hooks = RunHooks::default().with_cancel(cancel);
    let item = pipeline
        .regenerate(prior, instruction, topic, difficulty, hooks)
        .await
        .context("Regeneration failed")?;
    info!(fingerprint = %item.fingerprint(), "Replacement verified");
    write_json(output, &item)
}

/// Attach verified feedback to problems in a file
async fn cmd_feedback(
    pipeline: &GenerationPipeline,
    input: &Path,
    only: &[usize],
    model: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let mut batch = read_items(input)?;
    let total = batch.items.len();
    if let Some(bad) = only.iter().find(|&&n| n == 0 || n > total) {
        bail!("Problem #{} does not exist; the file has {} problem(s)", bad, total);
    }

    let mut enriched = 0;
    let mut failed = 0;
    for (index, item) in batch.items.iter_mut().enumerate() {
        if !only.is_empty() && !only.contains(&(index + 1)) {
            continue;
        }
        match pipeline.feedback(item, model).await {
            Ok(feedback) => {
                item.apply_feedback(&feedback);
                enriched += 1;
            }
            Err(PipelineError::MissingCredential) => {
                bail!("Feedback failed: {}", PipelineError::MissingCredential)
            }
            Err(err) => {
                warn!("Problem #{}: {}", index + 1, err);
                failed += 1;
            }
        }
    }
    info!(enriched, failed, "Feedback finished");
    write_json(output, &batch)?;

    if failed > 0 {
        bail!("{} of {} problem(s) got no feedback", failed, enriched + failed);
    }
    Ok(())
}

async fn verify_items(verifier: &ItemVerifier, items: Vec<GeneratedItem>) -> Vec<VerifyReport> {
    let mut reports = Vec::with_capacity(items.len());
    for (index, mut item) in items.into_iter().enumerate() {
        let result = verifier.verify_item(&mut item).await;
        reports.push(VerifyReport {
            index,
            passed: result.is_passed(),
            code: result.code(),
            reason: result.reason().map(str::to_string),
            item,
        });
    }
    reports
}

/// Verify every problem in a file
async fn cmd_verify(verifier: &ItemVerifier, input: &Path, report: Option<&Path>) -> Result<()> {
    let batch = read_items(input)?;
    let total = batch.items.len();
    let reports = verify_items(verifier, batch.items).await;

    for entry in &reports {
        match (&entry.code, &entry.reason) {
            (Some(code), Some(reason)) => {
                println!("#{:<3} FAILED  {}: {}", entry.index + 1, code.as_str(), reason)
            }
            _ => println!("#{:<3} PASSED", entry.index + 1),
        }
    }
    if let Some(path) = report {
        std::fs::write(path, serde_json::to_string_pretty(&reports)?)
            .with_context(|| format!("Failed to write report {:?}", path))?;
    }

    let failed = reports.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        bail!("{} of {} problem(s) failed verification", failed, total);
    }
    println!("All {} problem(s) passed verification", total);
    Ok(())
}

enum RenderSource {
    Items(PathBuf),
    Templates {
        unit_map: PathBuf,
        templates: PathBuf,
        batch: BatchConfig,
        seed: Option<u64>,
    },
}

impl RenderSource {
    /// Problems plus the unit titles shown in the header.
    fn load(&self) -> Result<(ProblemBatch, Vec<String>, Vec<Difficulty>)> {
        match self {
            RenderSource::Items(path) => {
                let batch = read_items(path)?;
                let mut difficulties: Vec<Difficulty> =
                    batch.items.iter().map(|i| i.difficulty).collect();
                difficulties.sort();
                difficulties.dedup();
                let titles = batch.intent.iter().cloned().collect();
                Ok((batch, titles, difficulties))
            }
            RenderSource::Templates {
                unit_map,
                templates,
                batch,
                seed,
            } => {
                let generator = TemplateGenerator::from_files(unit_map, templates)
                    .context("Failed to load templates")?;
                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(*seed),
                    None => StdRng::from_entropy(),
                };
                let questions = generator.generate_batch(batch, &mut rng)?;
                let titles = batch
                    .unit_ids
                    .iter()
                    .map(|id| generator.unit_title(id).to_string())
                    .collect();
                let items = questions.into_iter().map(|q| q.into_item()).collect();
                Ok((ProblemBatch::new(items), titles, batch.difficulties.clone()))
            }
        }
    }
}

/// Typeset a sheet
async fn cmd_render(
    compiler: &dyn Compiler,
    layout: SheetLayout,
    source: &RenderSource,
    verifier: Option<&ItemVerifier>,
    sheet: &SheetArgs,
) -> Result<()> {
    if !sheet.wants_output() {
        bail!("Nothing to write: pass --pdf and/or --tex");
    }
    let (mut batch, titles, difficulties) = source.load()?;

    if let Some(verifier) = verifier {
        let reports = verify_items(verifier, std::mem::take(&mut batch.items)).await;
        for entry in reports {
            if entry.passed {
                batch.items.push(entry.item);
            } else {
                warn!(
                    "Dropping problem #{}: {}",
                    entry.index + 1,
                    entry.reason.as_deref().unwrap_or("verification failed")
                );
            }
        }
    }
    if batch.items.is_empty() {
        bail!("No problems to render");
    }

    let spec = sheet_spec(titles, difficulties, batch.summary_notes.clone(), sheet);
    write_sheet(compiler, layout, &spec, &batch.items, sheet).await
}

/// Report TeX engine availability
async fn cmd_check_engine(compiler: &LatexCompiler, layout: SheetLayout, probe: bool) -> Result<()> {
    let config = compiler.config();
    println!("Engine: {}", config.engine);
    match &config.tex_dir {
        Some(dir) => println!("TeX dir: {:?}", dir),
        None => println!("TeX dir: (PATH)"),
    }
    println!("Timeout: {}s", config.timeout_secs);
    for pass in compiler.passes() {
        println!("Pass: {} {}", pass.program, pass.args.join(" "));
    }

    if !compiler.is_available().await {
        bail!("{} is not available", config.engine);
    }
    println!("Available: yes");

    if probe {
        let source = layout.probe_document("$\\frac{1}{2} + x^2$", CompileContext::Stem);
        let pdf = compiler
            .compile(&source)
            .await
            .context("Probe document failed to compile")?;
        println!("Probe: ok ({} bytes)", pdf.len());
    }
    Ok(())
}
