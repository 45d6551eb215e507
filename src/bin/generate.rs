use anyhow::{Context, Result};
use clap::Parser;
use querytune::{ExperimentFactory, Settings};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "generate")]
#[command(about = "Generate the full set of experiment permutations from a feature file")]
struct Args {
    /// Feature-space definition (JSON)
    #[arg(short, long)]
    features: PathBuf,

    /// Where to write the generated experiment set (JSON)
    #[arg(short, long)]
    output: PathBuf,

    /// Cap on generated experiments (overrides the config file)
    #[arg(long)]
    max_experiments: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();

    let args = Args::parse();
    let settings = Settings::load()?;
    let max_experiments = args
        .max_experiments
        .unwrap_or(settings.generation.max_experiments);

    let json = std::fs::read_to_string(&args.features)
        .with_context(|| format!("reading feature file {}", args.features.display()))?;
    let mut factory = ExperimentFactory::from_json(&json)
        .with_context(|| format!("parsing feature file {}", args.features.display()))?;

    let set = factory.permute(max_experiments)?;
    log::info!(
        "generated {} experiments (cap {})",
        set.len(),
        max_experiments
    );
    if set.len() == max_experiments {
        log::warn!("hit the experiment cap; the feature space was not fully enumerated");
    }

    std::fs::write(&args.output, set.to_json()?)
        .with_context(|| format!("writing {}", args.output.display()))?;
    log::info!("wrote {}", args.output.display());
    Ok(())
}
