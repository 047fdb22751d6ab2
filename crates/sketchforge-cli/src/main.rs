use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use sketchforge_contracts::backends::BackendsConfig;
use sketchforge_contracts::events::EventWriter;
use sketchforge_contracts::parameters::{ParameterResolver, ParameterTable};
use sketchforge_contracts::prompts::{check_budget, compose_with, PromptContext};
use sketchforge_contracts::request::{
    ArtStyle, GenerationRequest, InboundRequest, SketchType, ThemeCategory,
};
use sketchforge_contracts::themes::ThemeCatalog;
use sketchforge_engine::registry::dryrun_config;
use sketchforge_engine::{CancelToken, SketchEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_GENERATION_FAILED: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "sketchforge",
    version,
    about = "Turn sketches into images through a chain of fallback backends"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate an image from a sketch file.
    Generate(GenerateArgs),
    /// Read an inbound JSON request and print the outbound JSON response.
    RunRequest(RunRequestArgs),
    /// Show the resolved generation parameters.
    Params(ParamsArgs),
    /// Show the composed prompt pair and its token budget.
    Prompt(PromptArgs),
    /// List themes.
    Themes(ThemesArgs),
    /// List configured backends and whether each can be called.
    Backends(BackendsArgs),
    /// Rewrite one backend's endpoint in a config file.
    SetEndpoint(SetEndpointArgs),
}

#[derive(Debug, Clone, Args)]
struct CatalogArgs {
    /// Theme catalog JSON overriding the builtin one.
    #[arg(long)]
    themes: Option<PathBuf>,
    /// Parameter table JSON overriding the builtin one.
    #[arg(long)]
    parameters: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct BackendSelection {
    #[arg(long)]
    backends_config: Option<PathBuf>,
    /// Comma-separated backend ids to try, in order.
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    /// Use the offline backend only.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    theme: String,
    #[arg(long, default_value = "face")]
    sketch_type: String,
    #[arg(long, default_value = "realistic")]
    art_style: String,
    #[arg(long, default_value = "Default")]
    tier: String,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    catalogs: CatalogArgs,
    #[command(flatten)]
    backends: BackendSelection,
}

#[derive(Debug, Parser)]
struct RunRequestArgs {
    /// Inbound request JSON; stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Also save the image and receipt here.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    catalogs: CatalogArgs,
    #[command(flatten)]
    backends: BackendSelection,
}

#[derive(Debug, Parser)]
struct ParamsArgs {
    #[arg(long)]
    art_style: String,
    #[arg(long)]
    sketch_type: String,
    #[arg(long, default_value = "Default")]
    tier: String,
    #[arg(long)]
    parameters: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct PromptArgs {
    #[arg(long)]
    theme: String,
    #[arg(long)]
    sketch_type: String,
    #[arg(long)]
    art_style: String,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    themes: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ThemesArgs {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    themes: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct BackendsArgs {
    #[arg(long)]
    backends_config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct SetEndpointArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    id: String,
    #[arg(long)]
    endpoint: String,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sketchforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sketchforge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::RunRequest(args) => run_request(args),
        Command::Params(args) => run_params(args),
        Command::Prompt(args) => run_prompt(args),
        Command::Themes(args) => run_themes(args),
        Command::Backends(args) => run_backends(args),
        Command::SetEndpoint(args) => run_set_endpoint(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let image = fs::read(&args.image)
        .with_context(|| format!("failed reading sketch {}", args.image.display()))?;
    let sketch_type = parse_sketch_type(&args.sketch_type)?;
    let art_style = parse_art_style(&args.art_style)?;
    let request = GenerationRequest::builder(image, args.theme, sketch_type, art_style)
        .tier(args.tier)
        .prompt(args.prompt)
        .negative_prompt(args.negative_prompt)
        .subject(parse_subject(args.subject.as_deref())?)
        .build()?;

    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(&events_path, run_id_for(&args.out));
    let engine = build_engine(&args.catalogs, &args.backends, events)?;

    let run = engine.generate(request, &CancelToken::new())?;
    for warning in &run.prepared.warnings {
        eprintln!("warning: {warning}");
    }
    let saved = engine.save_result(&run, &args.out)?;
    match &run.outcome {
        Ok(result) => {
            if let Some(path) = &saved.image_path {
                println!("{}", path.display());
            }
            eprintln!(
                "generated by '{}' in {} ms; receipt {}",
                result.backend_id,
                result.elapsed_ms,
                saved.receipt_path.display()
            );
            Ok(0)
        }
        Err(err) => {
            eprintln!("{}", err.failure().user_message());
            eprintln!("receipt {}", saved.receipt_path.display());
            Ok(EXIT_GENERATION_FAILED)
        }
    }
}

fn run_request(args: RunRequestArgs) -> Result<i32> {
    let raw = match &args.input {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed reading request {}", path.display()))?,
        None => {
            let mut raw = String::new();
            io::stdin()
                .read_to_string(&mut raw)
                .context("failed reading request from stdin")?;
            raw
        }
    };
    let events = match (&args.events, &args.out) {
        (Some(path), out) => EventWriter::new(path, run_id_for(out.as_deref().unwrap_or(path.as_path()))),
        (None, Some(out)) => EventWriter::new(out.join("events.jsonl"), run_id_for(out)),
        (None, None) => EventWriter::detached("sketchforge"),
    };
    let engine = build_engine(&args.catalogs, &args.backends, events)?;
    let (response, succeeded) = respond(&engine, &raw, args.out.as_deref())?;
    println!("{}", serde_json::to_string(&response)?);
    Ok(if succeeded { 0 } else { EXIT_GENERATION_FAILED })
}

/// Inbound JSON in, outbound JSON out.
fn respond(engine: &SketchEngine, raw: &str, out: Option<&Path>) -> Result<(Value, bool)> {
    let inbound: InboundRequest =
        serde_json::from_str(raw).context("request is not a valid inbound JSON object")?;
    let request = inbound.into_request()?;
    let run = engine.generate(request, &CancelToken::new())?;
    if let Some(out) = out {
        engine.save_result(&run, out)?;
    }
    Ok((serde_json::to_value(run.response())?, run.succeeded()))
}

fn run_params(args: ParamsArgs) -> Result<i32> {
    let table = match &args.parameters {
        Some(path) => ParameterTable::load(path)?,
        None => ParameterTable::from_env_or_builtin()?,
    };
    let resolution = ParameterResolver::new(table.into())
        .resolve(&args.art_style, &args.sketch_type, &args.tier);
    if let Some(fallback) = &resolution.fallback {
        eprintln!("warning: {}", fallback.reason);
    }
    println!("{}", serde_json::to_string_pretty(&resolution)?);
    Ok(0)
}

fn run_prompt(args: PromptArgs) -> Result<i32> {
    let themes = load_themes(args.themes.as_deref())?;
    let theme = themes.lookup(&args.theme);
    let composed = compose_with(
        &theme,
        parse_sketch_type(&args.sketch_type)?,
        parse_art_style(&args.art_style)?,
        PromptContext {
            free_text: args.prompt.as_deref(),
            custom_negative: args.negative_prompt.as_deref(),
            subject: parse_subject(args.subject.as_deref())?,
        },
    );
    let budget = check_budget(&composed.positive);
    let payload = json!({
        "theme": theme.name,
        "known_theme": themes.get(&args.theme).is_some(),
        "positive": composed.positive,
        "negative": composed.negative,
        "context_rule": composed.context_rule,
        "budget": budget,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(0)
}

fn run_themes(args: ThemesArgs) -> Result<i32> {
    let themes = load_themes(args.themes.as_deref())?;
    let category = parse_subject(args.category.as_deref())?;
    for name in themes.names() {
        let Some(theme) = themes.get(name) else {
            continue;
        };
        if category.is_some_and(|category| !theme.in_category(category)) {
            continue;
        }
        let categories: Vec<&str> = theme.categories.iter().map(|c| c.as_str()).collect();
        println!(
            "{}\t{}\t{}\t{}",
            theme.name,
            theme.style.as_str(),
            categories.join(","),
            theme.description
        );
    }
    Ok(0)
}

fn run_backends(args: BackendsArgs) -> Result<i32> {
    let mut config = match &args.backends_config {
        Some(path) => BackendsConfig::load(path)?,
        None => BackendsConfig::builtin()?,
    };
    config.apply_env_overrides();
    println!(
        "max_retries={} timeout_backoff_ms={} connection_backoff_ms={}",
        config.max_retries, config.timeout_backoff_ms, config.connection_backoff_ms
    );
    for backend in &config.backends {
        let status = backend
            .config_problem()
            .unwrap_or_else(|| "ready".to_string());
        println!(
            "{}\t{}\t{}\tretries={}\t{}",
            backend.id,
            backend.kind.as_str(),
            backend.endpoint,
            config.max_retries_for(backend),
            status
        );
    }
    Ok(0)
}

fn run_set_endpoint(args: SetEndpointArgs) -> Result<i32> {
    let mut config = if args.config.exists() {
        BackendsConfig::load(&args.config)?
    } else {
        BackendsConfig::builtin()?
    };
    config.set_endpoint(&args.id, &args.endpoint)?;
    config.save(&args.config)?;
    println!(
        "{} -> {}",
        args.id,
        config.get(&args.id).map(|spec| spec.endpoint.as_str()).unwrap_or_default()
    );
    Ok(0)
}

fn build_engine(
    catalogs: &CatalogArgs,
    selection: &BackendSelection,
    events: EventWriter,
) -> Result<SketchEngine> {
    let themes = load_themes(catalogs.themes.as_deref())?;
    let parameters = match &catalogs.parameters {
        Some(path) => ParameterTable::load(path)?,
        None => ParameterTable::from_env_or_builtin()?,
    };
    let backends = load_backends(selection)?;
    SketchEngine::from_config(themes, parameters, &backends, events)
}

fn load_themes(path: Option<&Path>) -> Result<ThemeCatalog> {
    match path {
        Some(path) => ThemeCatalog::load(path),
        None => ThemeCatalog::from_env_or_builtin(),
    }
}

fn load_backends(selection: &BackendSelection) -> Result<BackendsConfig> {
    if selection.dryrun {
        return Ok(dryrun_config());
    }
    let mut config = match &selection.backends_config {
        Some(path) => BackendsConfig::load(path)?,
        None => BackendsConfig::builtin()?,
    };
    for id in config.apply_env_overrides() {
        tracing::info!(backend = %id, "endpoint overridden from environment");
    }
    if !selection.only.is_empty() {
        config.restrict_to(&selection.only)?;
    }
    Ok(config)
}

fn parse_sketch_type(raw: &str) -> Result<SketchType> {
    match SketchType::parse(raw) {
        Some(value) => Ok(value),
        None => bail!("unknown sketch type {raw:?} (expected face or full_body)"),
    }
}

fn parse_art_style(raw: &str) -> Result<ArtStyle> {
    match ArtStyle::parse(raw) {
        Some(value) => Ok(value),
        None => bail!("unknown art style {raw:?} (expected realistic, cartoon or ultra_realistic)"),
    }
}

fn parse_subject(raw: Option<&str>) -> Result<Option<ThemeCategory>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    match ThemeCategory::parse(raw) {
        Some(category) => Ok(Some(category)),
        None => bail!("unknown subject category {raw:?}"),
    }
}

fn run_id_for(path: &Path) -> String {
    path.file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("sketchforge")
        .to_string()
}
