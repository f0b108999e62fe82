use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use rolepack_common::{
    collate, write_jsonl, write_packed_file, HfTokenSource, PackConfig, PackedMmapDataset,
    PromptTemplate, SampleReader,
};
use rolepack_core::pack_split_prefetched;

#[derive(Parser, Debug)]
#[command(name = "rolepack", about = "Pack persona dialogue into fixed-length LM training chunks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render, tokenise and pack a JSONL split into fixed-length chunks.
    Pack(PackArgs),
    /// Print header and statistics of a packed .pkd file.
    Inspect(InspectArgs),
    /// Print rendered prompts for the first few samples.
    Render(RenderArgs),
}

// ── Pack ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct PackArgs {
    #[arg(long, default_value = "pack.json")]
    config: PathBuf,
    /// JSONL file or directory of JSONL files with `input_text`/`output_text`.
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    tokenizer: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// Split name used in logs; each invocation packs exactly one split.
    #[arg(long, default_value = "train")]
    split: String,
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    eos_token: Option<String>,
    #[arg(long, default_value = "bin", value_parser = ["bin", "jsonl"])]
    format: String,
    /// Tokenised batches buffered ahead of the packer (0 = tokenise inline).
    #[arg(long, default_value_t = 4)]
    prefetch: usize,
}

// ── Inspect / Render ───────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InspectArgs {
    #[arg(long)]
    input: PathBuf,
    /// Decode the first `--show` chunks with this tokenizer.
    #[arg(long)]
    tokenizer: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    show: usize,
    /// Collate one batch of this size to check tensor shapes.
    #[arg(long, default_value_t = 2)]
    batch_size: usize,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Read only; unlike `pack`, a missing file is not created.
    #[arg(long, default_value = "pack.json")]
    config: PathBuf,
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value_t = 3)]
    limit: usize,
    #[arg(long)]
    eos_token: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Pack(args) => cmd_pack(args),
        Command::Inspect(args) => cmd_inspect(args),
        Command::Render(args) => cmd_render(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn load_config(args: &PackArgs) -> Result<PackConfig> {
    let mut config = if args.config.exists() {
        PackConfig::load(&args.config)?
    } else {
        let default = PackConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    if let Some(c) = args.chunk_size {
        config.chunk_size = c;
    }
    if let Some(b) = args.batch_size {
        config.batch_size = b;
    }
    if let Some(ref eos) = args.eos_token {
        config.eos_token = eos.clone();
    }
    config.validate()?;
    Ok(config)
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {pos} samples {msg}")?,
    );
    Ok(pb)
}

fn cmd_pack(args: PackArgs) -> Result<()> {
    let config = load_config(&args)?;
    let source = HfTokenSource::from_file(&args.tokenizer, config.add_special_tokens)?;
    let template = PromptTemplate::from_config(&config);
    let mut reader = SampleReader::new(&args.input, config.batch_size)?;
    tracing::info!(
        split = %args.split,
        files = reader.files().len(),
        chunk_size = config.chunk_size,
        batch_size = config.batch_size,
        "packing"
    );

    let pb = progress_bar()?;
    let split = pack_split_prefetched(
        &args.split,
        &source,
        &template,
        &mut reader,
        config.chunk_size,
        args.prefetch,
        |samples, mapper| {
            pb.inc(samples as u64);
            pb.set_message(format!("{} chunks", mapper.packed().len()));
        },
    )?;
    pb.finish_and_clear();

    if split.examples.is_empty() {
        anyhow::bail!(
            "split {} produced no chunks; need at least {} tokens",
            split.name,
            split.chunk_size
        );
    }
    match args.format.as_str() {
        "jsonl" => write_jsonl(&args.output, &split.examples)?,
        _ => write_packed_file(&args.output, split.chunk_size, &split.examples)?,
    }
    eprintln!(
        "Wrote {} chunks of {} tokens to {} ({} examples, {} tokens, {} dropped, {:.2}% used)",
        split.stats.chunks,
        split.chunk_size,
        args.output.display(),
        split.stats.examples,
        split.stats.tokens,
        split.stats.discarded,
        split.stats.utilisation() * 100.0
    );
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let ds = PackedMmapDataset::open(&args.input)
        .with_context(|| format!("open {}", args.input.display()))?;
    eprintln!(
        "{}: {} chunks x {} tokens = {} tokens",
        args.input.display(),
        ds.len(),
        ds.chunk_size(),
        ds.num_tokens()
    );
    if ds.is_empty() {
        return Ok(());
    }

    let mut attended = 0usize;
    for batch in ds.batches(1024) {
        attended += batch
            .iter()
            .map(|e| e.attention_mask.iter().filter(|&&m| m != 0).count())
            .sum::<usize>();
    }
    eprintln!(
        "attention mask coverage: {:.2}%",
        attended as f64 / ds.num_tokens() as f64 * 100.0
    );

    if let Some(first) = ds.batches(args.batch_size).next() {
        let batch = collate(&first, &Device::Cpu)?;
        eprintln!(
            "collated batch: input_ids {:?}, attention_mask {:?}, labels {:?}",
            batch.input_ids.dims(),
            batch.attention_mask.dims(),
            batch.labels.dims()
        );
    }

    if let Some(ref path) = args.tokenizer {
        show_chunks(&ds, path, args.show)?;
    }
    Ok(())
}

fn show_chunks(ds: &PackedMmapDataset, tokenizer: &Path, count: usize) -> Result<()> {
    let source = HfTokenSource::from_file(tokenizer, false)?;
    for i in 0..count.min(ds.len()) {
        if let Some(chunk) = ds.get(i) {
            println!("── chunk {i} ──");
            println!("{}", source.decode(&chunk.input_ids)?);
        }
    }
    Ok(())
}

fn render_config(args: &RenderArgs) -> Result<PackConfig> {
    let mut config = if args.config.exists() {
        PackConfig::load(&args.config)?
    } else {
        PackConfig::default()
    };
    if let Some(ref eos) = args.eos_token {
        config.eos_token = eos.clone();
    }
    Ok(config)
}

fn render_samples(args: &RenderArgs) -> Result<Vec<String>> {
    let template = PromptTemplate::from_config(&render_config(args)?);
    let mut reader = SampleReader::new(&args.input, args.limit.max(1))?;
    let rendered = match reader.next_batch()? {
        Some(batch) => batch.iter().take(args.limit).map(|s| template.render(s)).collect(),
        None => Vec::new(),
    };
    Ok(rendered)
}

fn cmd_render(args: RenderArgs) -> Result<()> {
    for (i, text) in render_samples(&args)?.iter().enumerate() {
        println!("── sample {i} ──");
        println!("{text}");
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
