//! pyhost-launcher
//!
//! Subprocess-mode entry point for the native modules. Runs one function
//! and prints its result as JSON on stdout; failures go to stderr with a
//! non-zero exit code.
//!
//! ```text
//! pyhost-launcher linalg.decomposition.condition_number --input "1,0,0,2" --cols 2
//! echo '{"args": [[[1,2,3],[4,5,6]]]}' | pyhost-launcher linalg.decomposition.svd_dict
//! ```

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use pyhost_bridge::conversion::{parse_json, to_json};
use pyhost_bridge::{BridgeConfig, InvocationRequest, Matrix, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PYHOST_LOG";

#[derive(Parser)]
#[command(name = "pyhost-launcher")]
#[command(about = "Run a native module function and print its result as JSON", long_about = None)]
struct Cli {
    /// Target as `<module>.<function>`, e.g. `linalg.decomposition.svd_dict`
    target: String,

    /// Comma-separated numbers passed as a single list argument
    #[arg(long)]
    input: Option<String>,

    /// Reshape `--input` row-major into a matrix with this many columns
    #[arg(long, requires = "input")]
    cols: Option<usize>,

    /// Runtime bundle root (defaults to PYHOST_BUNDLE, then the launcher's directory)
    #[arg(long)]
    bundle: Option<PathBuf>,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let request = match build_request(&cli) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = run(&cli, &request) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_request(cli: &Cli) -> anyhow::Result<InvocationRequest> {
    let (module, function) = cli
        .target
        .rsplit_once('.')
        .filter(|(m, f)| !m.is_empty() && !f.is_empty())
        .with_context(|| format!("target '{}' is not <module>.<function>", cli.target))?;

    let args = match &cli.input {
        Some(input) => vec![parse_numbers(input, cli.cols)?],
        None => read_stdin_args()?,
    };
    Ok(InvocationRequest::new(module, function).args(args))
}

fn parse_numbers(input: &str, cols: Option<usize>) -> anyhow::Result<Value> {
    let numbers = input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .with_context(|| format!("'{}' in --input is not a number", s))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    match cols {
        None => Ok(Value::floats(numbers)),
        Some(cols) => {
            if cols == 0 || numbers.is_empty() || numbers.len() % cols != 0 {
                bail!("{} numbers cannot fill rows of {} columns", numbers.len(), cols);
            }
            let rows = numbers.len() / cols;
            Ok(Matrix::from_vec(rows, cols, numbers)?.into())
        }
    }
}

fn read_stdin_args() -> anyhow::Result<Vec<Value>> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("reading arguments from stdin")?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    match parse_json(&text)? {
        Value::Mapping(payload) => match payload.get("args") {
            Some(Value::Sequence(args)) => Ok(args.clone()),
            Some(Value::Matrix(rows)) => Ok(row_args(rows)),
            Some(other) => bail!("\"args\" must be a list, got {}", other.kind()),
            None => Ok(Vec::new()),
        },
        Value::Sequence(args) => Ok(args),
        Value::Matrix(rows) => Ok(row_args(&rows)),
        other => bail!("stdin payload must be an object or a list, got {}", other.kind()),
    }
}

/// An argument list made only of float lists decodes as a matrix; each
/// row is one argument.
fn row_args(rows: &Matrix) -> Vec<Value> {
    rows.iter_rows().map(|row| Value::floats(row.iter().copied())).collect()
}

fn run(cli: &Cli, request: &InvocationRequest) -> anyhow::Result<()> {
    let mut config = BridgeConfig::new(default_bundle()?)
        .with_environment(false)
        .with_env_overrides()?;
    if let Some(bundle) = &cli.bundle {
        config.bundle_root = bundle.clone();
    }
    debug!(bundle = %config.bundle_root.display(), %request, "launching");

    let session = pyhost_modules::reference_session(config);
    session.initialize()?;
    let result = session.invoke_value(request);
    session.shutdown()?;

    let json = to_json(&result?)?;
    println!("{}", json);
    Ok(())
}

fn default_bundle() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("locating the launcher executable")?;
    exe.parent()
        .map(PathBuf::from)
        .context("launcher executable has no parent directory")
}
