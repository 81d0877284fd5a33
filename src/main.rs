use std::{
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

use cinder::bytecode::{disasm, module};
use cinder::{CompileConfig, compile_program, decode_tree};

#[derive(Parser, Debug)]
#[command(name = "cinder", about = "Compile a program tree to a .pyc module")]
struct Cli {
    /// Postcard-encoded program tree
    input: PathBuf,

    /// Output path (defaults to INPUT with a .pyc extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the disassembly of the compiled program
    #[arg(short, long)]
    dis: bool,

    /// Magic number written to the module header
    #[arg(long, env = "CINDER_MAGIC", default_value_t = cinder::config::DEFAULT_MAGIC)]
    magic: u16,

    /// Source filename recorded in the code objects
    #[arg(long)]
    filename: Option<String>,
}

/// Use `RUST_LOG` to override the default filter.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cinder=info"));

    fmt().with_env_filter(filter).with_target(false).init();
}

/// Modification time and size of the source, as the module header stores them.
fn source_stamp(path: &Path) -> (u32, u32) {
    let Ok(meta) = fs::metadata(path) else {
        return (0, 0);
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    // the header keeps the low 32 bits
    (mtime, meta.len() as u32)
}

impl Cli {
    fn config(&self, (source_mtime, source_size): (u32, u32)) -> CompileConfig {
        CompileConfig {
            filename: self
                .filename
                .clone()
                .unwrap_or_else(|| self.input.display().to_string()),
            magic: self.magic,
            source_mtime,
            source_size,
            ..CompileConfig::default()
        }
    }

    fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.input.with_extension("pyc"))
    }
}

fn run(cli: Cli) -> cinder::Result<()> {
    let bytes = fs::read(&cli.input)?;
    let root = decode_tree(&bytes)?;
    debug!(input = %cli.input.display(), bytes = bytes.len(), "decoded program tree");

    let config = cli.config(source_stamp(&cli.input));

    let code = compile_program(root, &config)?;
    if cli.dis {
        disasm::print_code(&code)?;
    }

    let output = cli.output_path();
    let module = module::serialize(code, &config)?;
    module::write(&output, &module)?;
    info!("compiled {} -> {}", cli.input.display(), output.display());
    Ok(())
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
