use anyhow::{Context, Result};
use clap::Parser;
use querytune::db::{Db, ExperimentDB};
use querytune::reports::ReportWriter;
use querytune::runner::{ExperimentRunner, RunState};
use querytune::search::HttpClientFactory;
use querytune::{ExperimentSet, JudgmentList, Settings};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "run")]
#[command(about = "Run experiments against a live index, score them, and write reports")]
struct Args {
    /// SQLite file the scores are persisted in
    #[arg(long, default_value = "querytune.db")]
    db: PathBuf,

    /// Experiment set (JSON), as produced by `generate`
    #[arg(short, long)]
    experiments: PathBuf,

    /// Relevance judgments (JSON)
    #[arg(short, long)]
    judgments: PathBuf,

    /// Report output directory (overrides the config file)
    #[arg(long)]
    reports_dir: Option<PathBuf>,

    /// Drop existing scores and recompute everything
    #[arg(long)]
    fresh_start: bool,

    /// Run only the named experiment
    #[arg(long)]
    experiment: Option<String>,

    /// Rank report rows by the test scorer instead of the train scorer
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();

    let args = Args::parse();
    let settings = Settings::load()?;

    let set_json = std::fs::read_to_string(&args.experiments)
        .with_context(|| format!("reading {}", args.experiments.display()))?;
    let set = ExperimentSet::from_json(&set_json)
        .with_context(|| format!("parsing {}", args.experiments.display()))?;
    if set.is_empty() {
        anyhow::bail!("experiment set is empty");
    }

    let judgments_json = std::fs::read_to_string(&args.judgments)
        .with_context(|| format!("reading {}", args.judgments.display()))?;
    let judgments: JudgmentList = serde_json::from_str(&judgments_json)
        .with_context(|| format!("parsing {}", args.judgments.display()))?;
    log::info!(
        "loaded {} experiments, {} judged queries",
        set.len(),
        judgments.len()
    );

    let store = ExperimentDB::open(Db::new(&args.db), &set.scorers, args.fresh_start).await?;
    let mut runner = ExperimentRunner::new(HttpClientFactory, store.clone(), settings.runner.clone());

    let selected: Vec<&querytune::Experiment> = match &args.experiment {
        Some(name) => {
            let experiment = set
                .get(name)
                .with_context(|| format!("no experiment named {}", name))?;
            vec![experiment]
        }
        None => set.experiments.values().collect(),
    };

    let num_results = set.max_rows();
    let started = Instant::now();
    let mut completed = 0usize;
    for (i, experiment) in selected.iter().enumerate() {
        let summary = runner
            .run_experiment(experiment, &set.scorers, &judgments, num_results, false)
            .await?;
        if summary.state == RunState::Done {
            completed += 1;
            let avg = started.elapsed().as_secs_f64() / completed as f64;
            let remaining = (selected.len() - i - 1) as f64 * avg;
            log::info!(
                "{}/{} experiments done, est. {:.0}s remaining",
                i + 1,
                selected.len(),
                remaining
            );
        }
    }

    let sort_scorer = if args.test {
        set.test_scorer()?
    } else {
        set.train_scorer()?
    };
    let reports_dir = args.reports_dir.unwrap_or(settings.reports.dir.clone());
    let writer = ReportWriter::new(&store, &reports_dir, settings.reports.max_matrix_cols);
    let written = writer.dump(&set.scorers, sort_scorer).await?;
    for path in written {
        log::info!("wrote {}", path.display());
    }
    Ok(())
}
