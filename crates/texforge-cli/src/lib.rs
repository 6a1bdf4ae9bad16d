//! texforge CLI - Command-line interface library
//!
//! This library provides the CLI functionality for texforge:
//! - Doctor: Probe engines, run warmup and report diagnostics
//! - Compile: Compile a LaTeX file with engine fallback
//! - Preview: Render a circuit, diagram or chart block to SVG
//!
//! # Library Usage
//!
//! ```ignore
//! use texforge_cli::{run_cli, OutputFormat};
//!
//! // Run the full CLI
//! run_cli()?;
//!
//! // Or use individual commands programmatically
//! compile_command(settings, &input, None, EngineChoice::Auto).await?;
//! doctor_command(settings, OutputFormat::Json, Duration::from_secs(60)).await?;
//! ```
//!
//! # Binary Usage
//!
//! ```bash
//! # Report engine health
//! texforge doctor --format json
//!
//! # Compile with a preferred engine
//! texforge compile report.tex --engine lualatex
//!
//! # Render a circuit block
//! texforge preview rc.tex --kind circuit -o rc.svg
//! ```

pub mod app;

pub use app::{
    compile_command, doctor_command, engine_choice, init_tracing, preview_command, render_status,
    run, run_cli, Cli, OutputFormat,
};
