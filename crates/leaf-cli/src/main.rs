use anyhow::Context;
use clap::{Parser, Subcommand};
use leaf_core::{
    canonicalize, config_path_from_env_value, constants::CONFIG_PATH_ENV, obfuscate, parse_panels,
    CoreConfig, Panel, PatientCount,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "leaf")]
#[command(about = "Leaf federated cohort query tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical signature of a query
    Signature {
        /// Panels file (YAML or JSON)
        panels: PathBuf,
    },
    /// Obfuscate a raw count for a query using the configured policy
    Obfuscate {
        /// Panels file (YAML or JSON)
        panels: PathBuf,
        /// Raw patient count
        #[arg(long, allow_hyphen_values = true)]
        count: i64,
        /// Configuration file (defaults to $LEAF_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file
    CheckConfig {
        /// Configuration file
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Signature { panels }) => {
            let panels = read_panels(&panels)?;
            println!("{}", canonicalize(&panels));
        }
        Some(Commands::Obfuscate {
            panels,
            count,
            config,
        }) => {
            let config_path = match config {
                Some(path) => path,
                None => config_path_from_env_value(std::env::var(CONFIG_PATH_ENV).ok())?,
            };
            let cfg = CoreConfig::load(&config_path)
                .with_context(|| format!("loading {}", config_path.display()))?;
            let panels = read_panels(&panels)?;

            let result = obfuscate_count(&cfg, &panels, count);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Some(Commands::CheckConfig { path }) => match CoreConfig::load(&path) {
            Ok(cfg) => println!("{}", describe_config(&cfg)),
            Err(e) => {
                eprintln!("Invalid configuration {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            println!("Use 'leaf --help' for commands");
        }
    }

    Ok(())
}

fn read_panels(path: &Path) -> anyhow::Result<Vec<Panel>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading panels from {}", path.display()))?;
    parse_panels(&text).with_context(|| format!("parsing panels in {}", path.display()))
}

fn obfuscate_count(cfg: &CoreConfig, panels: &[Panel], raw: i64) -> PatientCount {
    obfuscate(PatientCount::raw(raw), &canonicalize(panels), cfg.policy())
}

fn describe_config(cfg: &CoreConfig) -> String {
    let enabled = cfg.responders().iter().filter(|r| r.enabled).count();
    format!(
        "Configuration OK: {} responders ({} enabled), obfuscation {}, cache limit {}, low cell threshold {}",
        cfg.responders().len(),
        enabled,
        if cfg.policy().enabled() { "on" } else { "off" },
        cfg.cache_limit(),
        cfg.low_cell_masking_threshold(),
    )
}
