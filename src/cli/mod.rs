//! NF-017: CLI subcommands: init, validate, summary, check.

use crate::core::config::register_config_file;
use crate::core::expr::evaluate;
use crate::core::parser;
use crate::core::registry::Registry;
use crate::core::value::{Env, Kwargs, Value};
use crate::graph::module::Module;
use crate::graph::state;
use crate::nn::tensor::{checked_numel, Tensor};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter graph definition
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a graph definition without building anything
    Validate {
        /// Path to the YAML definition
        #[arg(short, long, default_value = "net.yaml")]
        file: PathBuf,
    },

    /// Build a module and print its tree, state dict and fingerprint
    Summary {
        /// Path to the YAML definition
        #[arg(short, long, default_value = "net.yaml")]
        file: PathBuf,

        /// Module to build
        #[arg(short, long)]
        module: String,

        /// Positional argument (expression), repeatable
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Keyword argument KEY=EXPR, repeatable
        #[arg(short, long = "kwarg")]
        kwargs: Vec<String>,

        /// Run a forward pass on a zero tensor of this shape, e.g. 1,4
        #[arg(long)]
        input_shape: Option<String>,

        /// Finalize drops (drop and renumber) before reporting
        #[arg(long)]
        drop: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Write a layout lock to this path
        #[arg(long)]
        lock: Option<PathBuf>,
    },

    /// Compare a module's finalized state layout against a layout lock
    Check {
        /// Path to the YAML definition
        #[arg(short, long, default_value = "net.yaml")]
        file: PathBuf,

        /// Module to build
        #[arg(short, long)]
        module: String,

        /// Positional argument (expression), repeatable
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Keyword argument KEY=EXPR, repeatable
        #[arg(short, long = "kwarg")]
        kwargs: Vec<String>,

        /// Layout lock to compare against
        #[arg(long)]
        lock: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Summary {
            file,
            module,
            args,
            kwargs,
            input_shape,
            drop,
            json,
            lock,
        } => cmd_summary(
            &file,
            &module,
            &args,
            &kwargs,
            &SummaryOptions {
                input_shape: input_shape.as_deref(),
                drop,
                json,
                lock: lock.as_deref(),
            },
        ),
        Commands::Check {
            file,
            module,
            args,
            kwargs,
            lock,
        } => cmd_check(&file, &module, &args, &kwargs, &lock),
    }
}

const TEMPLATE: &str = r#"# netforge graph definitions
global_vars:
  - hidden: 16

Block:
  args: [c_in, c_out]
  layers:
    - [-1, Linear, [c_in, c_out]]
    - [-1, ReLU]

Net:
  args: [{c_in: 4}, {c_out: 2}]
  layers:
    - [-1, Block, [c_in, hidden]]
    - [-1, Block, [hidden, hidden]]
    - [drop, Linear, [hidden, hidden]]
    - [-1, Linear, [hidden, c_out]]
    - [-1, Sigmoid]
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("net.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }
    std::fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&config_path, TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized netforge project at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_config(&config);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }

    let mut registry = Registry::new();
    let names =
        crate::core::config::register_config(&mut registry, &config).map_err(|e| e.to_string())?;
    println!(
        "OK: {} ({} modules: {})",
        file.display(),
        names.len(),
        names.join(", ")
    );
    Ok(())
}

/// Evaluate CLI argument expressions. Names resolve only to builtins.
fn parse_call_args(args: &[String], kwargs: &[String]) -> Result<(Vec<Value>, Kwargs), String> {
    let env = Env::new();
    let positional = args
        .iter()
        .map(|a| evaluate(a, &env).map_err(|e| format!("argument '{}': {}", a, e)))
        .collect::<Result<Vec<_>, _>>()?;
    let mut keywords = Kwargs::new();
    for kv in kwargs {
        let (key, expr) = kv
            .split_once('=')
            .ok_or_else(|| format!("keyword argument '{}' should be KEY=EXPR", kv))?;
        let value = evaluate(expr, &env).map_err(|e| format!("argument '{}': {}", kv, e))?;
        keywords.insert(key.trim().to_string(), value);
    }
    Ok((positional, keywords))
}

fn parse_shape(shape: &str) -> Result<Vec<usize>, String> {
    let dims = shape
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid input shape '{}'", shape))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if checked_numel(&dims).is_none() {
        return Err(format!("input shape '{}' is too large", shape));
    }
    Ok(dims)
}

/// Register `file` and build `module`.
fn build_module(
    file: &Path,
    module: &str,
    args: &[String],
    kwargs: &[String],
) -> Result<Box<dyn Module>, String> {
    let (args, kwargs) = parse_call_args(args, kwargs)?;
    let mut registry = Registry::new();
    register_config_file(&mut registry, file).map_err(|e| e.to_string())?;
    let builder = registry.get(module).map_err(|e| e.to_string())?;
    builder
        .build(&registry, args, kwargs)
        .map_err(|e| e.to_string())
}

struct SummaryOptions<'a> {
    input_shape: Option<&'a str>,
    drop: bool,
    json: bool,
    lock: Option<&'a Path>,
}

fn cmd_summary(
    file: &Path,
    module: &str,
    args: &[String],
    kwargs: &[String],
    opts: &SummaryOptions<'_>,
) -> Result<(), String> {
    let mut built = build_module(file, module, args, kwargs)?;
    let pipeline = built
        .as_pipeline_mut()
        .ok_or_else(|| format!("{} is not a config-defined module", module))?;
    if opts.drop {
        pipeline.drop_recursive(true);
    }

    let output = match opts.input_shape {
        Some(shape) => {
            let x = Tensor::zeros(&parse_shape(shape)?);
            Some(
                pipeline
                    .forward(vec![Value::Tensor(x)])
                    .map_err(|e| e.to_string())?,
            )
        }
        None => None,
    };

    let report = state::report(pipeline);
    if opts.json {
        let json = serde_json::to_string_pretty(&report).map_err(|e| format!("JSON error: {}", e))?;
        println!("{}", json);
    } else {
        println!("{}", pipeline.summary());
        println!();
        println!("state dict ({} entries):", report.state.len());
        for entry in &report.state {
            println!("  {} {:?}", entry.key, entry.shape);
        }
        if !report.drop_set.is_empty() {
            println!("pending drops: {:?}", report.drop_set);
        }
        println!("fingerprint: {}", report.fingerprint);
        if let Some(out) = &output {
            println!("output: {}", out);
        }
    }

    if let Some(lock) = opts.lock {
        let layout = state::layout_of(module, &pipeline.state_dict());
        state::save_layout(lock, &layout).map_err(|e| e.to_string())?;
        eprintln!("Wrote layout lock {}", lock.display());
    }
    Ok(())
}

fn cmd_check(
    file: &Path,
    module: &str,
    args: &[String],
    kwargs: &[String],
    lock: &Path,
) -> Result<(), String> {
    let layout = state::load_layout(lock)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no layout lock at {}", lock.display()))?;
    let built = build_module(file, module, args, kwargs)?;
    let pipeline = built
        .as_pipeline()
        .ok_or_else(|| format!("{} is not a config-defined module", module))?;

    let current = pipeline.dropped_state_dict(true);
    let changes = state::compare_layout(&layout, &current);
    if changes.is_empty() {
        println!(
            "OK: {} matches {} ({})",
            module,
            lock.display(),
            state::state_fingerprint(&current)
        );
        return Ok(());
    }
    for change in &changes {
        eprintln!("  CHANGED: {}", change);
    }
    Err(format!("{} layout change(s)", changes.len()))
}
