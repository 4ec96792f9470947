//! lorastage CLI
//!
//! # Usage
//!
//! ```bash
//! # Show the stage table and which stage a request would use
//! lorastage stages --prompt-len 2000 --max-new-tokens 512
//!
//! # Print the slot indices handed to the runtime
//! lorastage slots --layers 28 --bundle both
//!
//! # Write a simulated model, scaled adapters and reference traces
//! lorastage fixtures --dir test_lora
//!
//! # Generate on the simulated runtime
//! lorastage generate --model test_lora/model.bin -p "Hello" --adapter test_lora/scale0.01_embedding_scale0.01_lora_weights.bin
//!
//! # Run the adapter regression suite
//! lorastage suite --dir test_lora
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use lorastage_core::{
    parse_devices, AdapterBundle, GenerationMode, RuntimeConfig, SlotLayout, SlotMap,
};
use lorastage_harness::{
    load_cases, write_fixtures, ChatPrompt, FixtureOptions, FixtureSet, GenerationRequest,
    LoraPipeline, RegressionSuite, SuiteOptions,
};
use lorastage_model::{ByteCodec, ChatFormat, SimulatedRuntime, TokenCodec, Tokenizer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lorastage")]
#[command(version)]
#[command(about = "Staged LoRA inference: stage selection, adapter hot-swap and regression checks")]
struct Cli {
    /// TOML configuration file (environment overrides still apply)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stage table and the stage chosen for a request
    Stages {
        /// Prompt length in tokens
        #[arg(long)]
        prompt_len: Option<usize>,

        /// Tokens to generate
        #[arg(long, default_value = "20")]
        max_new_tokens: usize,
    },

    /// Print the wire indices of an adapter bundle
    Slots {
        /// Adapter-bearing layers
        #[arg(short, long, default_value = "28")]
        layers: i64,

        /// adapter, embedding or both
        #[arg(short, long, default_value = "both")]
        bundle: String,
    },

    /// Write a simulated model, scaled adapters and reference traces
    Fixtures {
        /// Output directory
        #[arg(short, long, default_value = "test_lora")]
        dir: PathBuf,

        /// Tokens generated per reference
        #[arg(short, long, default_value = "20")]
        max_new_tokens: usize,

        /// Seed for adapter values
        #[arg(long, default_value = "2024")]
        seed: u64,
    },

    /// Generate text on the simulated runtime
    Generate {
        /// Model file (overrides the configuration)
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// User prompt
        #[arg(short, long, conflicts_with = "cases")]
        prompt: Option<String>,

        /// JSON file of {content, question} cases
        #[arg(long)]
        cases: Option<PathBuf>,

        /// Adapter weight file
        #[arg(short, long)]
        adapter: Option<PathBuf>,

        /// adapter, embedding or both
        #[arg(short, long, default_value = "both")]
        bundle: String,

        /// Tokens to generate; 0 stops at EOS or stage capacity
        #[arg(short = 'n', long)]
        max_new_tokens: Option<usize>,

        /// greedy or penalty_sample
        #[arg(long)]
        generation_mode: Option<String>,

        /// Device ids, e.g. "0,1"
        #[arg(short, long)]
        devid: Option<String>,

        /// Path to tokenizer.json; byte-level tokens without it
        #[arg(short, long)]
        tokenizer: Option<PathBuf>,

        /// Show timing information
        #[arg(long, default_value = "false")]
        timing: bool,
    },

    /// Run the adapter regression suite against a fixture directory
    Suite {
        /// Fixture directory written by `lorastage fixtures`
        #[arg(short, long, default_value = "test_lora")]
        dir: PathBuf,

        /// Apply/clear cycles in the stress case
        #[arg(short, long, default_value = "5")]
        loops: usize,

        /// Minimum cosine similarity against references
        #[arg(long, default_value = "0.8")]
        threshold: f64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lorastage_harness=info,lorastage_model=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Stages {
            prompt_len,
            max_new_tokens,
        } => run_stages(&config, prompt_len, max_new_tokens),
        Commands::Slots { layers, bundle } => run_slots(&config, layers, &bundle),
        Commands::Fixtures {
            dir,
            max_new_tokens,
            seed,
        } => run_fixtures(&dir, max_new_tokens, seed),
        Commands::Generate {
            model,
            prompt,
            cases,
            adapter,
            bundle,
            max_new_tokens,
            generation_mode,
            devid,
            tokenizer,
            timing,
        } => {
            let mut config = config;
            if let Some(model) = model {
                config.model_path = model;
            }
            if let Some(devid) = devid {
                config.devices = parse_devices(&devid)?;
            }
            if let Some(n) = max_new_tokens {
                config.generation.max_new_tokens = n;
            }
            if let Some(mode) = generation_mode {
                config.generation.mode = mode.parse::<GenerationMode>()?;
            }
            if tokenizer.is_some() {
                config.tokenizer_path = tokenizer;
            }
            if adapter.is_some() {
                config.adapter_path = adapter;
            }
            let bundle: AdapterBundle = bundle.parse()?;
            run_generate(&config, prompt, cases.as_deref(), bundle, timing)
        }
        Commands::Suite {
            dir,
            loops,
            threshold,
        } => run_suite(&dir, loops, threshold),
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn run_stages(config: &RuntimeConfig, prompt_len: Option<usize>, max_new_tokens: usize) -> Result<()> {
    let table = config.stages.to_table()?;

    println!("{}", style("Compiled stages").cyan().bold());
    println!("  {:>5}  {:>8}  {:>8}", "index", "total", "prompt");
    for stage in table.stages() {
        println!(
            "  {:>5}  {:>8}  {:>8}",
            stage.index, stage.max_total_length, stage.max_prompt_length
        );
    }

    if let Some(prompt_len) = prompt_len {
        let total = lorastage_core::total_length_for(prompt_len, max_new_tokens)?;
        println!();
        match table.select(total, prompt_len) {
            Ok(stage) => println!(
                "{} prompt {} + {} new -> stage {} (total {}, prompt {})",
                style("[OK]").green().bold(),
                prompt_len,
                max_new_tokens,
                stage.index,
                stage.max_total_length,
                stage.max_prompt_length
            ),
            Err(e) => {
                println!("{} {}", style("[ERROR]").red().bold(), e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn run_slots(config: &RuntimeConfig, layers: i64, bundle: &str) -> Result<()> {
    let bundle: AdapterBundle = bundle.parse()?;
    let layout: &SlotLayout = &config.slots.layout;
    let selection = SlotMap::with_layout(layers, layout)?.select(bundle);
    let wire = selection.to_wire();

    println!("{} {} over {} layers", style("Bundle:").cyan().bold(), bundle, layers);
    println!("  graph:   {}", wire.graph);
    println!("  region:  {}", wire.region);
    for (i, weights) in wire.weights.iter().enumerate() {
        println!("  weights[{:>2}]: {}", i, weights);
    }
    Ok(())
}

fn run_fixtures(dir: &Path, max_new_tokens: usize, seed: u64) -> Result<()> {
    let options = FixtureOptions {
        max_new_tokens,
        seed,
        ..FixtureOptions::default()
    };
    let set = write_fixtures(dir, &options)?;

    println!(
        "{} wrote {} adapter cases to {}",
        style("[OK]").green().bold(),
        set.cases.len(),
        dir.display()
    );
    for case in &set.cases {
        println!("  {}", case.adapter);
    }
    Ok(())
}

fn run_generate(
    config: &RuntimeConfig,
    prompt: Option<String>,
    cases: Option<&Path>,
    bundle: AdapterBundle,
    show_timing: bool,
) -> Result<()> {
    let (codec, format): (Box<dyn TokenCodec>, ChatFormat) = match &config.tokenizer_path {
        Some(path) => {
            let tokenizer = Tokenizer::from_file(path)?;
            println!(
                "{} {} tokens, {:?} chat format",
                style("Tokenizer:").cyan().bold(),
                tokenizer.vocab_size(),
                tokenizer.chat_format
            );
            let format = tokenizer.chat_format;
            (Box::new(tokenizer), format)
        }
        None => (Box::new(ByteCodec::default()), ChatFormat::ChatML),
    };
    let runtime = SimulatedRuntime::new(config.stages.to_table()?);
    let mut pipeline = LoraPipeline::new(runtime, config, codec)?;

    let mut request = GenerationRequest::new(config.generation.clone());
    if let Some(adapter) = &config.adapter_path {
        request = request.with_adapter(bundle, adapter);
    }

    let chat = ChatPrompt::default().with_format(format);
    let prompts: Vec<String> = match (prompt, cases) {
        (Some(prompt), _) => vec![chat.render(&prompt)],
        (None, Some(path)) => load_cases(path)?.iter().map(|c| chat.render_case(c)).collect(),
        (None, None) => vec![chat.sample()],
    };

    for text in prompts {
        let tokens = pipeline.encode(&text)?;
        println!("{} {} prompt tokens", style("Prompt:").cyan().bold(), tokens.len());

        let output = match pipeline.generate(&tokens, &request) {
            Ok(output) => output,
            Err(e) => {
                println!("{} Generation failed: {}", style("[ERROR]").red().bold(), e);
                std::process::exit(1);
            }
        };
        let text = output.text(pipeline.codec())?;
        println!("{} {}", style("Generated:").cyan().bold(), text);

        if show_timing {
            println!();
            println!("Timing:");
            println!("  Stage:      {}", output.stage.index);
            println!(
                "  FTL:        {:>8.3} s",
                output.metrics.first_token_latency.as_secs_f64()
            );
            println!("  TPS:        {:>8.3} token/s", output.metrics.tokens_per_second());
            println!("  Tokens:     {}", output.metrics.generated_tokens);
            println!("  Stop:       {:?}", output.stop_reason);
        }
        println!();
    }

    Ok(())
}

fn run_suite(dir: &Path, loops: usize, threshold: f64) -> Result<()> {
    println!("{}", style("lorastage regression suite").cyan().bold());
    println!("========================================\n");

    let fixtures = FixtureSet::load(dir)
        .with_context(|| format!("loading fixtures from {}", dir.display()))?;
    let suite = RegressionSuite::new(fixtures, SuiteOptions { threshold, loops });
    let report = suite.run(|stages| SimulatedRuntime::new(stages.clone()))?;

    for case in &report.cases {
        let tag = if case.passed {
            style("[PASS]").green().bold()
        } else {
            style("[FAIL]").red().bold()
        };
        println!("{} {:<36} {}", tag, case.name, case.detail);
    }

    println!();
    if report.passed() {
        println!("{} all {} cases passed", style("[OK]").green().bold(), report.cases.len());
        Ok(())
    } else {
        report.ensure_passed()?;
        Ok(())
    }
}
