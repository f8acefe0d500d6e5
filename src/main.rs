use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tracing::error;
use tracing_subscriber::EnvFilter;

use mire::config::{RuntimeConfig, UnresolvedCallPolicy};
use mire::error::{EXIT_FATAL, EngineError};
use mire::vm::disasm;
use mire::vm::dyn_interp::exit_payload;
use mire::vm::value::Slot;
use mire::vm::{DynEngine, Image, MValue, Mode, PrimType, SimpleRuntime, StaticEngine};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UnresolvedCallArg {
    Ignore,
    Warn,
    Error,
}

impl From<UnresolvedCallArg> for UnresolvedCallPolicy {
    fn from(arg: UnresolvedCallArg) -> Self {
        match arg {
            UnresolvedCallArg::Ignore => UnresolvedCallPolicy::Ignore,
            UnresolvedCallArg::Warn => UnresolvedCallPolicy::Warn,
            UnresolvedCallArg::Error => UnresolvedCallPolicy::Error,
        }
    }
}

#[derive(Parser)]
#[command(name = "mire")]
#[command(about = "Interpreter for compiled mire images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an image's entry method
    Run {
        /// The image to run
        image: PathBuf,

        /// Code offset of the method to run instead of the entry
        #[arg(long)]
        entry: Option<usize>,

        /// Arguments for a static entry method, converted to its formal types
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<i64>,

        /// Configuration file (defaults to mire.toml next to the image)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log every dispatched opcode and call
        #[arg(long)]
        trace: bool,

        /// What a call to an unregistered name does
        #[arg(long, value_enum)]
        unresolved_call: Option<UnresolvedCallArg>,
    },
    /// Disassemble every method of an image
    Dump {
        /// The image to disassemble
        image: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Validate method headers and instruction boundaries
    Check {
        /// The image to check
        image: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let trace = matches!(cli.command, Commands::Run { trace: true, .. });
    init_tracing(trace);

    match cli.command {
        Commands::Run {
            image,
            entry,
            args,
            config,
            trace,
            unresolved_call,
        } => {
            let mut config = match load_config(&image, config.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(EXIT_FATAL as u8);
                }
            };
            if trace {
                config.trace.opcodes = true;
                config.trace.calls = true;
            }
            if let Some(policy) = unresolved_call {
                config.unresolved_call = policy.into();
            }
            match run(&image, entry, &args, config) {
                Ok(code) => code,
                Err(e) => fail(e),
            }
        }
        Commands::Dump { image, json } => {
            let listing = match Image::load(&image).map_err(EngineError::from).and_then(|i| disasm::disassemble(&i)) {
                Ok(l) => l,
                Err(e) => return fail(e),
            };
            if json {
                match serde_json::to_string_pretty(&listing) {
                    Ok(s) => println!("{}", s),
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print!("{}", listing);
            }
            ExitCode::SUCCESS
        }
        Commands::Check { image } => {
            match Image::load(&image).map_err(EngineError::from).and_then(|i| disasm::check(&i)) {
                Ok(count) => {
                    println!("{}: {} instructions ok", image.display(), count);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}: {}", image.display(), e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("warn,mire=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `--config`, else `mire.toml` beside the image, else defaults; then the
/// environment.
fn load_config(image: &Path, explicit: Option<&Path>) -> Result<RuntimeConfig, String> {
    let beside = image.with_file_name("mire.toml");
    let mut config = match explicit {
        Some(path) => RuntimeConfig::load(path)?,
        None if beside.is_file() => RuntimeConfig::load(&beside)?,
        None => RuntimeConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

fn run(path: &Path, entry: Option<usize>, args: &[i64], config: RuntimeConfig) -> Result<ExitCode, EngineError> {
    let image = Image::load(path)?;
    match image.mode() {
        Mode::Static => {
            let engine = StaticEngine::new(image, Arc::new(SimpleRuntime::new()))?.with_config(config);
            let offset = entry.unwrap_or(engine.image().entry() as usize);
            let header = engine.image().method_header(offset)?;
            let mut slots: Vec<Slot> = args
                .iter()
                .enumerate()
                .map(|(i, &a)| {
                    let ty = header
                        .formals
                        .get(i)
                        .and_then(|s| s.prim_type())
                        .unwrap_or(PrimType::I64);
                    Slot::from(MValue::from_bits(ty, a as u64))
                })
                .collect();
            let result = engine
                .invoke(engine.method_addr(offset), &mut slots)
                .map_err(|u| u.into_engine_error())?;
            println!("{}", result);
            Ok(ExitCode::SUCCESS)
        }
        Mode::Dynamic => {
            let mut engine = DynEngine::new(image, config)?;
            let result = match entry {
                Some(offset) => engine.run_method(offset)?,
                None => engine.run_main()?,
            };
            // process statuses are 8 bits wide
            Ok(ExitCode::from(exit_payload(result) as u8))
        }
    }
}

fn fail(e: EngineError) -> ExitCode {
    match &e {
        EngineError::Uncaught(text) => eprintln!("uncaught exception: {}", text),
        _ => {
            error!("{}", e);
            eprintln!("error: {}", e);
        }
    }
    ExitCode::from(e.exit_code() as u8)
}
