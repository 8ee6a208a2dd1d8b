use std::{path::PathBuf, process::ExitCode, time::Instant};

use clap::Parser;
use questionnaire_ocr::{
    annotation_path, load_options, report::report_file_name, ExtractionOptions, Gender,
    QuestionnaireOcrBuilder, DEFAULT_DATA_DIR,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Extracts handwritten answers from scanned questionnaire PDFs.
#[derive(Parser)]
#[command(version, long_about = None)]
struct Cli {
    /// Questionnaire PDF to process
    #[arg(long)]
    pdf: PathBuf,

    /// Questionnaire variant, selects the field layout
    #[arg(long, value_parser = ["pria", "perempuan"], default_value = "pria")]
    gender: String,

    /// Directory holding the annotation files and default models
    #[arg(long = "data-dir", default_value = DEFAULT_DATA_DIR, env = "QOCR_DATA_DIR")]
    data_dir: PathBuf,

    /// Character detection model, defaults to the one in the data directory
    #[arg(long = "det-model", env = "QOCR_DET_MODEL")]
    det_model: Option<PathBuf>,

    /// Character classification model, defaults to the one in the data directory
    #[arg(long = "cls-model", env = "QOCR_CLS_MODEL")]
    cls_model: Option<PathBuf>,

    /// TOML file overriding extraction thresholds
    #[arg(long, env = "QOCR_CONFIG")]
    config: Option<PathBuf>,

    /// Report path, defaults to extraction_results_<gender>_<pdf>.xlsx
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Review page to print
    #[arg(long, default_value_t = 1)]
    page: usize,

    /// Inference threads per model
    #[arg(long, default_value_t = 4, env = "QOCR_THREADS")]
    threads: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> questionnaire_ocr::Result<()> {
    let gender: Gender = cli.gender.parse()?;
    let options = match &cli.config {
        Some(path) => load_options(path)?,
        None => ExtractionOptions::default(),
    };

    let mut builder = QuestionnaireOcrBuilder::new()
        .data_dir(&cli.data_dir)
        .threads(cli.threads)
        .options(options);
    if let Some(path) = cli.det_model {
        builder = builder.det_model(path);
    }
    if let Some(path) = cli.cls_model {
        builder = builder.cls_model(path);
    }
    let ocr = builder.build();

    let pdf = std::fs::read(&cli.pdf).map_err(|e| questionnaire_ocr::Error::Io {
        path: cli.pdf.clone(),
        source: e,
    })?;
    let start = Instant::now();
    let extraction = ocr.extract_pdf(&pdf, &annotation_path(&cli.data_dir, gender))?;
    log::debug!("Extraction took {:?}", start.elapsed());

    if extraction.is_empty() {
        println!("Extraction finished but no fields were recognized.");
        return Ok(());
    }

    let output = cli
        .output
        .unwrap_or_else(|| report_file_name(gender.as_str(), &cli.pdf).into());
    questionnaire_ocr::report::write_report(&extraction.results, &output)?;

    if let Some(page) = extraction.page(cli.page, options.page_size) {
        println!("Page {} of {}", page.number, page.total_pages);
        for (offset, result) in page.items.iter().enumerate() {
            println!();
            println!("Item {}", page.start_index + offset + 1);
            println!("  Question ID:     {}", result.question_id);
            println!("  Page:            {}", result.page);
            println!("  Recognized text: {}", result.text);
            println!("  Avg. confidence: {}", result.confidence_label());
        }
    }
    println!();
    println!(
        "{} fields extracted, {} skipped, report written to {}",
        extraction.results.len(),
        extraction.skipped_fields,
        output.display()
    );
    Ok(())
}
