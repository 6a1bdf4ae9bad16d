//! Block previews through the service

mod support;

use std::path::Path;
use std::sync::Arc;

use support::{all_available, service, source_of, test_settings, write_pdf, DelayedTester, ScriptedRunner};
use texforge_core::{Invocation, PreviewError, PreviewKind, ProcessOutput, Settings};

const SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\"/>";

/// Write the SVG to the path following `flag`, or to the last argument
fn write_svg(inv: &Invocation, after: Option<&str>) {
    let target = match after {
        Some(flag) => inv.flag_value(flag).unwrap().to_path_buf(),
        None => Path::new(inv.args.last().unwrap()).to_path_buf(),
    };
    std::fs::write(target, SVG).unwrap();
}

fn toolchain(cairo_works: bool) -> ScriptedRunner {
    ScriptedRunner::new(move |inv| match inv.program_name().as_str() {
        "pdflatex" => {
            if source_of(inv).contains("\\bogus") {
                ProcessOutput::exited(1, "! Undefined control sequence.\nl.5 \\bogus")
            } else {
                write_pdf(inv);
                ProcessOutput::exited(0, "")
            }
        }
        "pdftocairo" if cairo_works => {
            write_svg(inv, None);
            ProcessOutput::exited(0, "")
        }
        "dvisvgm" => {
            write_svg(inv, Some("-o"));
            ProcessOutput::exited(0, "")
        }
        _ => ProcessOutput::exited(1, ""),
    })
}

#[tokio::test]
async fn test_preview_is_cached() {
    let runner = Arc::new(toolchain(true));
    let service = service(test_settings(), runner.clone(), Arc::new(DelayedTester::new(&[])), all_available()).await;

    let code = "\\draw (0,0) to[R=$R_1$] (2,0);";
    let first = service.preview(code, PreviewKind::Circuit).await.unwrap();
    let second = service.preview(code, PreviewKind::Circuit).await.unwrap();
    assert_eq!(first, SVG);
    assert_eq!(first, second);
    assert_eq!(runner.calls_to("pdflatex"), 1);
    assert_eq!(runner.calls_to("dvisvgm"), 0);
    assert_eq!(service.status().preview_cached, 1);

    // same code as another kind is a different document
    service.preview(code, PreviewKind::Diagram).await.unwrap();
    assert_eq!(runner.calls_to("pdflatex"), 2);
    assert_eq!(service.status().preview_cached, 2);
}

#[tokio::test]
async fn test_empty_block_skips_compilation() {
    let runner = Arc::new(toolchain(true));
    let service = service(test_settings(), runner.clone(), Arc::new(DelayedTester::new(&[])), all_available()).await;

    assert_eq!(service.preview("  \n", PreviewKind::Chart).await.unwrap(), "");
    assert_eq!(runner.total_calls(), 0);
    assert_eq!(service.status().preview_cached, 0);
}

#[tokio::test]
async fn test_falls_back_to_dvisvgm() {
    let runner = Arc::new(toolchain(false));
    let service = service(test_settings(), runner.clone(), Arc::new(DelayedTester::new(&[])), all_available()).await;

    let svg = service
        .preview("\\addplot {x^2};", PreviewKind::Chart)
        .await
        .unwrap();
    assert_eq!(svg, SVG);
    assert_eq!(runner.calls_to("pdftocairo"), 1);
    assert_eq!(runner.calls_to("dvisvgm"), 1);
}

#[tokio::test]
async fn test_compile_error_is_reported() {
    let runner = Arc::new(toolchain(true));
    let service = service(test_settings(), runner, Arc::new(DelayedTester::new(&[])), all_available()).await;

    let err = service.preview("\\bogus", PreviewKind::Raw).await.unwrap_err();
    match err {
        PreviewError::Compile(message) => assert!(message.contains("Undefined control sequence")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_cache_is_bounded() {
    let runner = Arc::new(toolchain(true));
    let settings = Settings {
        preview_cache_entries: 2,
        ..test_settings()
    };
    let service = service(settings, runner.clone(), Arc::new(DelayedTester::new(&[])), all_available()).await;

    for code in ["a", "b", "c"] {
        service.preview(code, PreviewKind::Diagram).await.unwrap();
    }
    // "a" was evicted first
    service.preview("a", PreviewKind::Diagram).await.unwrap();
    assert_eq!(runner.calls_to("pdflatex"), 4);
    service.preview("c", PreviewKind::Diagram).await.unwrap();
    assert_eq!(runner.calls_to("pdflatex"), 4);
    assert_eq!(service.status().preview_cached, 2);
}

#[tokio::test]
async fn test_preview_compiles_under_memory_ceiling() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = seen.clone();
    let runner = Arc::new(ScriptedRunner::new(move |inv| {
        record.lock().unwrap().push((inv.program_name(), inv.memory_limit));
        match inv.program_name().as_str() {
            "pdflatex" => {
                write_pdf(inv);
                ProcessOutput::exited(0, "")
            }
            _ => {
                write_svg(inv, None);
                ProcessOutput::exited(0, "")
            }
        }
    }));
    let settings = Settings {
        memory_limit_mb: 256,
        ..test_settings()
    };
    let service = service(settings, runner, Arc::new(DelayedTester::new(&[])), all_available()).await;

    service.preview("\\node {A};", PreviewKind::Diagram).await.unwrap();
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0], ("pdflatex".to_string(), Some(256 * 1024 * 1024)));
}
