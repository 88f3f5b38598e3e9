use anyhow::Context;
use clap::Parser;
use pulsar_gibbs::simulate::{simulate_pulsar, write_par, write_tim, SimulationConfig};
use std::fs;
use std::path::PathBuf;

/// Writes a fake pulsar dataset with white and red noise
#[derive(Parser)]
#[command(name = "simulate")]
struct Args {
    /// Output directory for the par and tim files
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// JSON simulation options; missing fields take defaults
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    ntoas: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("invalid simulation options in {}", path.display()))?
        }
        None => SimulationConfig::default(),
    };
    if let Some(ntoas) = args.ntoas {
        config.ntoas = ntoas;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let (par, toas) = simulate_pulsar(&config);

    fs::create_dir_all(&args.output)?;
    let par_path = args.output.join(format!("{}.par", par.name));
    let tim_path = args.output.join(format!("{}.tim", par.name));
    write_par(&par_path, &par)?;
    write_tim(&tim_path, &toas)?;

    log::info!("wrote {} TOAs to {} and {}", toas.len(), par_path.display(), tim_path.display());
    Ok(())
}
