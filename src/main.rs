use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use idcae_rs::{dataset::machine_type_name, machine_types, pipeline, Config, Mode};

/// Train ID-conditioned autoencoders per machine type.
#[derive(Parser, Debug)]
#[command(name = "IDCAE", version)]
struct Cli {
    /// Use the development data root.
    #[arg(short = 'd', long = "dev")]
    dev: bool,
    /// Use the evaluation data root.
    #[arg(short = 'e', long = "eval")]
    eval: bool,
    /// YAML configuration file.
    #[arg(long, default_value = "idcae.yaml")]
    config: PathBuf,
    /// Machine type to train; asked on stdin when omitted.
    #[arg(long)]
    machine: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mode = match (cli.dev, cli.eval) {
        (true, false) => Mode::Development,
        (false, true) => Mode::Evaluation,
        _ => {
            log::error!("incorrect argument: pass exactly one of --dev or --eval");
            std::process::exit(-1);
        }
    };

    if let Err(e) = run(&cli, mode) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli, mode: Mode) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let dirs = machine_types(&config, mode)
        .with_context(|| format!("listing {}", config.data_root(mode).display()))?;

    println!("Found machine types:");
    for dir in &dirs {
        println!("  {}", machine_type_name(dir));
    }

    let target = match &cli.machine {
        Some(machine) => machine.clone(),
        None => prompt("Which machine model would you like to train")?,
    };

    let done = pipeline::run(&config, &dirs, &target)?;
    log::info!("processed {} machine type(s)", done.len());
    Ok(())
}

fn prompt(question: &str) -> anyhow::Result<String> {
    print!("{question}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("reading machine type from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
