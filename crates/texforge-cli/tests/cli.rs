//! Integration tests for the texforge CLI

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use tempfile::TempDir;
use texforge_cli::{compile_command, render_status, run, Cli};
use texforge_core::{
    CommandLocator, EngineCandidate, EngineChoice, EngineKind, FontSelection, ProbeReport, Settings,
    TexEnv, TexService,
};

#[tokio::test]
async fn test_malformed_config_is_reported() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("texforge.toml");
    fs::write(&config, "max_concurrent_compiles = \"many\"\n").unwrap();

    let cli = Cli::try_parse_from([
        "texforge",
        "--config",
        config.to_str().unwrap(),
        "compile",
        "missing.tex",
    ])
    .unwrap();
    let err = run(cli).await.unwrap_err();
    assert!(err.to_string().contains("Failed to load settings"), "{err}");
}

#[tokio::test]
async fn test_missing_input_fails_before_bootstrap() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("nope.tex");

    let err = compile_command(Settings::default(), &input, None, EngineChoice::Auto)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Input file not found"));
    assert!(!input.with_extension("pdf").exists());
}

#[tokio::test]
async fn test_status_text_lists_every_engine() {
    let candidates = vec![
        EngineCandidate::available(EngineKind::PdfLatex, "/opt/tex/bin/pdflatex"),
        EngineCandidate::new(
            EngineKind::LuaLatex,
            PathBuf::from("lualatex"),
            true,
            vec!["luatexja.sty".to_string()],
        ),
    ];
    let service = TexService::builder(Settings::default())
        .locator(CommandLocator::with_dirs(None, Vec::new()))
        .env(TexEnv::default())
        .probe_report(ProbeReport::from_candidates(candidates, FontSelection::default()))
        .bootstrap()
        .await;

    let text = render_status(&service.status());
    assert!(text.contains("Warmup: NotStarted"), "{text}");
    assert!(text.starts_with("texforge v"));
    assert!(text.contains("Ranking: pdflatex > "), "{text}");
    assert!(text.contains("/opt/tex/bin/pdflatex"));
    assert!(text.contains("Cached previews: 0"));
    assert!(text.contains("missing: luatexja.sty"), "{text}");
    for kind in EngineKind::ALL {
        assert!(text.contains(kind.name()), "{kind} not listed");
    }
}
