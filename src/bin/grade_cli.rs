//! Exercises the grading pipeline against local JPEGs without a host
//! application. Not a feature of the core itself — just enough harness to
//! run it by hand.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dictation_grading_core::grading::config::GradingConfig;
use dictation_grading_core::grading::delegate::InMemoryDelegate;
use dictation_grading_core::grading::{grade, PageUpload};

#[derive(Parser)]
struct Args {
    /// Page images, in reading order.
    #[arg(required = true)]
    pages: Vec<PathBuf>,

    /// Optional config file name (without extension) consulted alongside
    /// environment variables.
    #[arg(long, default_value = "grading")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = GradingConfig::from_env_and_file(&args.config).unwrap_or_else(|e| {
        log::warn!("falling back to defaults: {e}");
        GradingConfig::default()
    });

    let mut uploads = Vec::with_capacity(args.pages.len());
    for path in &args.pages {
        let bytes = std::fs::read(path)?;
        uploads.push(PageUpload {
            bytes,
            mime_hint: None,
        });
    }

    let delegate = Arc::new(InMemoryDelegate::new());
    let result = grade(uploads, &config, delegate, None).await?;

    println!(
        "graded {} item(s) across {} page(s); worksheet_uuid={:?}",
        result.items.len(),
        result.image_count,
        result.worksheet_uuid.map(|u| u.value)
    );
    for item in &result.items {
        println!(
            "  #{:>3} [{}] zh={:<12} llm={:<16} ocr={:<16} correct={} method={}",
            item.position,
            item.page_index,
            item.zh_hint,
            item.llm_text,
            item.ocr_text,
            item.is_correct,
            item.match_method,
        );
    }
    if let Some(warning) = result.uuid_warning {
        println!("warning: {warning}");
    }

    Ok(())
}
