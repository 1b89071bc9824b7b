//! FLUX CLI: generate images locally from the command line.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use flux_gen::config::{resolve_model_preset, Config, MODEL_PRESETS};
use flux_gen::error::GenerateError;
use flux_gen::generator::{FluxGenerator, GeneratorOptions};
use flux_gen::models::GenerateRequest;
use flux_gen::strategy;
use flux_gen::vram;

#[derive(Parser)]
#[command(name = "flux")]
#[command(version, about = "Generate images locally with FLUX", long_about = None)]
struct Cli {
    /// Verbose output with extra generation details
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an image from a text prompt
    Generate {
        /// Text description of the image
        prompt: Option<String>,

        /// Number of inference steps (default: per-model smart default)
        #[arg(short, long)]
        steps: Option<u32>,

        /// Guidance scale (default: per-model smart default)
        #[arg(short, long)]
        guidance: Option<f32>,

        /// Image width in pixels (must be a multiple of 8)
        #[arg(long, default_value_t = 1024)]
        width: u32,

        /// Image height in pixels (must be a multiple of 8)
        #[arg(long, default_value_t = 1024)]
        height: u32,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,

        /// Custom output path (default: auto-generated in the output directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override the output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Model preset name (flux1-dev, flux2-dev) or full model id
        #[arg(short, long)]
        model: Option<String>,

        /// Interactive mode: generate several images with one loaded model
        #[arg(short, long)]
        interactive: bool,
    },

    /// Show generator and system status
    Status,

    /// Show the current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command {
        Commands::Generate {
            prompt,
            steps,
            guidance,
            width,
            height,
            seed,
            output,
            output_dir,
            model,
            interactive,
        } => {
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            if let Some(ref m) = model {
                config.model_id = resolve_model_preset(m);
            }

            // The process exits after this invocation, so background
            // auto-unload is pointless in CLI mode.
            let backend = flux_gen::default_backend(&config);
            let options = GeneratorOptions::from_config(&config, false);
            let generator = FluxGenerator::new(backend, options);

            if interactive {
                return interactive_mode(&generator, cli.verbose);
            }

            let prompt = match prompt {
                Some(p) => p,
                None => {
                    eprintln!("Error: prompt is required");
                    eprintln!("\nUsage: flux generate \"your prompt here\"");
                    eprintln!("   or: flux generate --interactive");
                    std::process::exit(1);
                }
            };

            let mut request = GenerateRequest::new(prompt);
            request.steps = steps;
            request.guidance = guidance;
            request.width = width;
            request.height = height;
            request.seed = seed;
            request.output = output;

            run_generation(&generator, request, cli.verbose);
        }

        Commands::Status => print_status(&config),
        Commands::Config => print_config(&config),
    }

    Ok(())
}

fn run_generation(generator: &FluxGenerator, request: GenerateRequest, verbose: bool) {
    if verbose {
        println!("  Prompt: {}", request.prompt);
        println!("  Resolution: {}x{}", request.width, request.height);
        if let Some(seed) = request.seed {
            println!("  Seed: {seed}");
        }
    }

    println!("Generating image...");
    match generator.generate(request) {
        Ok(outcome) => {
            println!("\n✓ Image generated successfully!\n");
            println!("  Image: {}", outcome.image_path.display());
            println!("  Metadata: {}", outcome.sidecar_path.display());
            println!("  Generation time: {:.2}s", outcome.duration_seconds);
            println!("  Seed: {}", outcome.seed);
            if !verbose {
                println!("\nTip: use --seed {} to reproduce this image", outcome.seed);
            }
        }
        Err(e @ GenerateError::ResourceExhausted(_)) => {
            eprintln!("\n✗ {e}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("\n✗ Error: {e}");
            std::process::exit(1);
        }
    }
}

/// Batch generation against one loaded pipeline. Reads parameters from
/// stdin; an empty answer keeps the default.
fn interactive_mode(generator: &FluxGenerator, verbose: bool) -> Result<()> {
    println!("FLUX image generator (interactive mode)");
    println!("Generate multiple images with the same loaded model. Type 'quit' to exit.\n");

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        let prompt = match ask(&mut lines, "Prompt (or 'quit'): ")? {
            Some(p) => p,
            None => break,
        };
        if prompt.is_empty() {
            println!("Prompt cannot be empty");
            continue;
        }
        if matches!(prompt.to_lowercase().as_str(), "quit" | "exit" | "q") {
            break;
        }

        let mut request = GenerateRequest::new(prompt);
        request.steps = match parse_answer(ask(&mut lines, "Steps [model default]: ")?) {
            Ok(v) => v,
            Err(e) => {
                println!("Invalid input: {e}");
                continue;
            }
        };
        request.guidance = match parse_answer(ask(&mut lines, "Guidance [model default]: ")?) {
            Ok(v) => v,
            Err(e) => {
                println!("Invalid input: {e}");
                continue;
            }
        };
        if let Ok(Some(w)) = parse_answer::<u32>(ask(&mut lines, "Width [1024]: ")?) {
            request.width = w;
        }
        if let Ok(Some(h)) = parse_answer::<u32>(ask(&mut lines, "Height [1024]: ")?) {
            request.height = h;
        }
        request.seed = parse_answer(ask(&mut lines, "Seed [random]: ")?).unwrap_or(None);

        if let Err(e) = request.validate() {
            println!("✗ {e}");
            continue;
        }

        run_generation(generator, request, verbose);
        println!();
    }

    println!("Goodbye!");
    Ok(())
}

fn ask(
    lines: &mut std::io::Lines<std::io::StdinLock<'_>>,
    question: &str,
) -> Result<Option<String>> {
    print!("{question}");
    std::io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(Some(line?.trim().to_string())),
        None => Ok(None), // EOF
    }
}

fn parse_answer<T: std::str::FromStr>(answer: Option<String>) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match answer {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => s.parse::<T>().map(Some).map_err(|e| e.to_string()),
    }
}

fn print_status(config: &Config) {
    println!("FLUX generator status\n");
    println!("  Model: {}", config.model_id);
    println!("  Output directory: {}", config.output_dir.display());

    match vram::query_vram_usage_gb() {
        Some((used, total)) => {
            println!("  CUDA available: yes");
            println!("  Total VRAM: {total:.2} GB");
            println!("  Used VRAM: {used:.2} GB");
            let strategy = strategy::select(total, &config.thresholds);
            println!("  Offload tier at load: {}", strategy.tier.as_str());
            if strategy.low_memory {
                println!("  Warning: low VRAM, quality or resolution may need reduction");
            }
        }
        None => {
            println!("  CUDA available: no (CPU fallback, very slow)");
        }
    }

    match &config.model_cache {
        Some(cache) => println!("  Model cache: {}", cache.display()),
        None => println!("  Model cache: worker default"),
    }
}

fn print_config(config: &Config) {
    println!("FLUX configuration\n");
    println!("  FLUX_MODEL_ID={}", config.model_id);
    println!("  FLUX_OUTPUT_DIR={}", config.output_dir.display());
    println!(
        "  FLUX_UNLOAD_TIMEOUT={}s (MCP server only)",
        config.unload_timeout_secs
    );
    println!("  FLUX_DEFAULT_STEPS={}", config.default_steps);
    println!("  FLUX_DEFAULT_GUIDANCE={}", config.default_guidance);
    println!("  FLUX_WORKER_CMD={}", config.worker_cmd);
    if let Some(ref cache) = config.model_cache {
        println!("  FLUX_MODEL_CACHE={}", cache.display());
    }
    println!(
        "  Tier thresholds: full >= {}GB, balanced >= {}GB, low < {}GB",
        config.thresholds.full_gb, config.thresholds.balanced_gb, config.thresholds.low_gb
    );

    println!("\nModel presets:");
    for (preset, id) in MODEL_PRESETS {
        println!("  {preset} -> {id}");
    }
}
