// Copyright (c) 2024-present, annforest contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Thin `create|drop|apply` command adapter over [`annforest::registry::DatabaseRegistry`]
//! (§6), mirroring the donor's own `tool` feature: a `clap`-derived argument
//! enum installing `env_logger` in `main`, with library code never touching
//! the global logger itself.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use annforest::database::CreateOptions;
use annforest::registry::DatabaseRegistry;
use annforest::{Error, MetricKind};

#[derive(Parser)]
#[command(name = "annforest-cli", about = "Manage annforest ANN databases")]
struct Cli {
    /// Directory holding the `<db>.*` files. Defaults to the current directory.
    #[arg(long, global = true, default_value = ".")]
    path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DistanceArg {
    Angular,
    Euclidean,
    Manhattan,
    Hamming,
}

impl From<DistanceArg> for MetricKind {
    fn from(d: DistanceArg) -> Self {
        match d {
            DistanceArg::Angular => MetricKind::Angular,
            DistanceArg::Euclidean => MetricKind::Euclidean,
            DistanceArg::Manhattan => MetricKind::Manhattan,
            DistanceArg::Hamming => MetricKind::Hamming,
        }
    }
}

/// Element type of a feature vector. The underlying engine stores every
/// coordinate as `f64` regardless of this flag; `object` only controls how
/// CLI-supplied values are parsed before being handed to the engine (an
/// integer object type truncates, it does not change the on-disk layout).
#[derive(ValueEnum, Clone, Copy, Debug)]
enum ObjectArg {
    Float,
    Integer,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new database.
    Create {
        name: String,
        #[arg(long)]
        dim: usize,
        #[arg(long, value_enum, default_value = "angular")]
        distance: DistanceArg,
        #[arg(long, value_enum, default_value = "float")]
        object: ObjectArg,
        #[arg(long, default_value_t = 50)]
        trees: usize,
        #[arg(long, default_value_t = 10)]
        bucket_capacity: usize,
    },
    /// Delete a database and its files.
    Drop {
        name: String,
        #[arg(long)]
        assumeyes: bool,
    },
    /// Run one apply cycle against a database's pending binlog rows.
    Apply { name: String },
    /// List databases registered under `--path`.
    List,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> annforest::Result<()> {
    let scratch_dir = cli.path.join(".scratch");
    let registry = DatabaseRegistry::open(&cli.path, &scratch_dir)?;

    match cli.command {
        Command::Create { name, dim, distance, object, trees, bucket_capacity } => {
            let _ = object; // parsing hint only, see ObjectArg's doc comment
            let options = CreateOptions { dim, metric: distance.into(), tree_count: trees, bucket_capacity };
            registry.create(&name, options)?;
            println!("created database {name}");
            Ok(())
        }
        Command::Drop { name, assumeyes } => {
            if !assumeyes && !confirm(&format!("drop database {name}? [y/N] ")) {
                println!("aborted");
                return Ok(());
            }
            registry.drop_database(&name, Duration::from_secs(30))?;
            println!("dropped database {name}");
            Ok(())
        }
        Command::Apply { name } => match registry.apply_once(&name) {
            Ok(()) => {
                println!("applied {name}");
                Ok(())
            }
            Err(Error::TargetNotExist) => {
                println!("nothing to apply for {name}");
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::List => {
            for name in registry.names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn confirm(prompt: &str) -> bool {
    use std::io::Write;
    print!("{prompt}");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}
