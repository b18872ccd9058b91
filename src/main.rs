use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use doc_compressor_rust::ladder::QualityLadder;
use doc_compressor_rust::{compress_with_config, CompressionResult, EngineConfig};
use log::{debug, LevelFilter};
use tempfile::NamedTempFile;

/// Shrinks PDF documents and JPEG/PNG images
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input PDF or image file
    input: PathBuf,

    /// Output file
    output: PathBuf,

    /// MIME type of the input, if the extension is misleading
    #[arg(long, default_value = "")]
    mime: String,

    /// JPEG qualities to try, best first (1-100)
    #[arg(long, value_delimiter = ',', default_values_t = [85u8, 75, 60, 40])]
    quality: Vec<u8>,

    /// Max image dimension (longer side), standalone images only
    #[arg(long, default_value_t = 2048)]
    max_dim: u32,

    /// Also drop oversized image objects and duplicate metadata in PDFs
    #[arg(long)]
    aggressive: bool,

    /// Skip the full object rewrite fallback for PDFs
    #[arg(long)]
    no_rewrite: bool,

    /// Recompress embedded images on one thread
    #[arg(long)]
    sequential: bool,

    /// More output; repeat for debug logs
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.image.ladder = QualityLadder::new(self.quality.iter().copied());
        config.image.max_dimension = self.max_dim;
        config.pdf.aggressive = self.aggressive;
        config.pdf.object_rewrite = !self.no_rewrite;
        config.pdf.parallel = !self.sequential;
        config
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();
}

/// Writes through a temp file in the destination directory so a failed run
/// never leaves a truncated output behind.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).context("Failed to create temporary file")?;
    tmp.write_all(data).context("Failed to write output")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move output into {:?}", path))?;
    Ok(())
}

fn print_summary(result: &CompressionResult) {
    if let Some(stats) = result.pdf {
        println!(
            "Pages: {}, images evaluated: {}.",
            stats.page_count, stats.processed_pages
        );
        match stats.strategy {
            Some(kind) => println!("Strategy: {}", kind),
            None => println!("No strategy improved the file; output is a copy of the input."),
        }
    }
    if let Some(format) = result.format {
        println!("Format: {}", format);
    }
    println!(
        "Original size: {:.2} MB",
        result.original_size as f64 / 1_048_576.0
    );
    println!(
        "New size:      {:.2} MB",
        result.compressed_size as f64 / 1_048_576.0
    );
    println!("Ratio:         {:.3}", result.compression_ratio);
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    let config = args.config();

    println!("Loading: {:?}", args.input);
    let bytes = std::fs::read(&args.input).context("Failed to read input")?;

    let start = Instant::now();
    let mut progress = |value: u8| debug!("progress {}%", value);
    let result = compress_with_config(&bytes, &args.mime, &config, &mut progress)
        .with_context(|| format!("Failed to compress {:?}", args.input))?;
    println!("Compressed in {:.2?}", start.elapsed());

    write_atomically(&args.output, &result.data)?;
    print_summary(&result);

    Ok(())
}
