//! CLI Application logic
//!
//! Contains the command-line interface implementation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use texforge_core::{
    CompileRequest, EngineChoice, PreviewKind, ServiceStatus, Settings, TexService,
};

/// Output format for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output for tooling
    Json,
}

#[derive(Parser)]
#[command(name = "texforge")]
#[command(author, version, about = "LaTeX engine probing and bounded compilation", long_about = None)]
pub struct Cli {
    /// Settings file (TOML); environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe engines, run warmup and print the diagnostics snapshot
    Doctor {
        /// Output format (text or json)
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Seconds to wait for warmup to test every engine
        #[arg(long, default_value_t = 240)]
        wait: u64,
    },

    /// Compile a LaTeX source file to PDF
    Compile {
        /// Input .tex file
        input: PathBuf,

        /// Output PDF file (defaults to the input with a .pdf extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Engine to use: auto, pdflatex, xelatex or lualatex
        #[arg(short, long, default_value = "auto")]
        engine: EngineChoice,

        /// Use only the named engine, without fallback
        #[arg(long)]
        strict: bool,
    },

    /// Render a circuit, diagram or chart block to SVG
    Preview {
        /// File containing the block body
        input: PathBuf,

        /// Block type: circuit, diagram, chart or raw
        #[arg(short, long)]
        kind: PreviewKind,

        /// Output SVG file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Install the stderr log subscriber; `RUST_LOG` refines the INFO default
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Run the CLI application
///
/// Parses arguments, builds a runtime and dispatches to the command.
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(cli))
}

/// Dispatch a parsed command line
pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load settings from {}", path.display()),
        None => "Failed to load settings from the environment".to_string(),
    })?;

    match cli.command {
        Commands::Doctor { format, wait } => {
            doctor_command(settings, format, Duration::from_secs(wait)).await?;
        }
        Commands::Compile {
            input,
            output,
            engine,
            strict,
        } => {
            let choice = engine_choice(engine, strict)?;
            compile_command(settings, &input, output.as_deref(), choice).await?;
        }
        Commands::Preview {
            input,
            kind,
            output,
        } => {
            preview_command(settings, &input, kind, output.as_deref()).await?;
        }
    }

    Ok(())
}

/// Apply `--strict` to the parsed engine choice
pub fn engine_choice(engine: EngineChoice, strict: bool) -> Result<EngineChoice> {
    match (engine, strict) {
        (EngineChoice::Prefer(kind), true) => Ok(EngineChoice::Require(kind)),
        (EngineChoice::Auto, true) => anyhow::bail!("--strict needs an explicit --engine"),
        (choice, _) => Ok(choice),
    }
}

/// Execute the doctor command
pub async fn doctor_command(settings: Settings, format: OutputFormat, wait: Duration) -> Result<()> {
    let service = TexService::bootstrap(settings).await;
    service.start_warmup();
    if !service.wait_for_warmup_finished(wait).await {
        tracing::warn!(wait_secs = wait.as_secs(), "warmup still running; reporting partial results");
    }

    let status = service.status();
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&status)
                .context("Failed to serialize status to JSON")?;
            println!("{}", json);
        }
        OutputFormat::Text => print!("{}", render_status(&status)),
    }
    Ok(())
}

/// Execute the compile command
pub async fn compile_command(
    settings: Settings,
    input: &Path,
    output: Option<&Path>,
    choice: EngineChoice,
) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input file not found: {}", input.display());
    }
    let source = fs::read_to_string(input)
        .with_context(|| format!("Failed to read input file: {}", input.display()))?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension("pdf"));

    let service = TexService::bootstrap(settings).await;
    service.start_warmup();

    let request = CompileRequest::new(source).with_choice(choice);
    match service.compile(&request).await {
        Ok(compiled) => {
            fs::write(&output, &compiled.pdf)
                .with_context(|| format!("Failed to write PDF: {}", output.display()))?;
            println!(
                "Created: {} ({} bytes, {}, {:.1}s)",
                output.display(),
                compiled.pdf.len(),
                compiled.engine,
                compiled.elapsed.as_secs_f64()
            );
            Ok(())
        }
        Err(err) => {
            if !err.log_excerpt.is_empty() {
                eprintln!("{}", err.log_excerpt.trim_end());
            }
            anyhow::bail!("{:?} error: {}", err.category, err.message)
        }
    }
}

/// Execute the preview command
pub async fn preview_command(
    settings: Settings,
    input: &Path,
    kind: PreviewKind,
    output: Option<&Path>,
) -> Result<()> {
    let code = fs::read_to_string(input)
        .with_context(|| format!("Failed to read input file: {}", input.display()))?;

    let service = TexService::bootstrap(settings).await;
    let svg = service
        .preview(&code, kind)
        .await
        .with_context(|| format!("Failed to preview {} block", kind))?;

    match output {
        Some(path) => {
            fs::write(path, &svg)
                .with_context(|| format!("Failed to write SVG: {}", path.display()))?;
            println!("Created: {}", path.display());
        }
        None => println!("{}", svg),
    }
    Ok(())
}

/// Human-readable diagnostics
pub fn render_status(status: &ServiceStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("texforge v{}\n", texforge_core::VERSION));
    out.push_str(&format!(
        "Warmup: {:?}{}\n",
        status.warmup,
        if status.warm { " (signaled)" } else { "" }
    ));
    let ranking: Vec<String> = status
        .default_engine
        .iter()
        .chain(status.fallbacks.iter())
        .map(|k| k.to_string())
        .collect();
    out.push_str(&format!("Ranking: {}\n", ranking.join(" > ")));
    out.push_str(&format!("Concurrent compiles: {}\n", status.max_concurrent_compiles));
    out.push_str(&format!("Cached previews: {}\n\n", status.preview_cached));

    for engine in &status.engines {
        let verdict = if engine.verified {
            "verified"
        } else if engine.available {
            "available"
        } else {
            "unavailable"
        };
        out.push_str(&format!(
            "{:<9} {:<11} {}\n",
            engine.engine.to_string(),
            verdict,
            engine.command.display()
        ));
        if let Some(ms) = engine.latency_ms {
            out.push_str(&format!("          compile test: {} ms\n", ms));
        }
        if !engine.missing.is_empty() {
            out.push_str(&format!("          missing: {}\n", engine.missing.join(", ")));
        }
        out.push_str(&format!("          breaker: {:?}\n", engine.breaker));
    }

    out.push('\n');
    out.push_str(&format!(
        "CJK fonts ({:?}): main={} sans={}\n",
        status.fonts.source,
        status.fonts.main.as_deref().unwrap_or("-"),
        status.fonts.sans.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!(
        "TEXINPUTS: {}\n",
        status.texinputs.as_deref().unwrap_or("(not set)")
    ));
    out.push_str(&format!("LIBGS: {}\n", status.libgs.as_deref().unwrap_or("(not set)")));
    out
}
