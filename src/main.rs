use anyhow::Context;
use clap::Parser;
use pulsar_gibbs::model::read_noise_dict;
use pulsar_gibbs::{model_general, GibbsConfig, ModelConfig, Pulsar, PulsarBlockGibbs, SampleMethod};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::PathBuf;

/// Gibbs sampling of a single pulsar's timing noise
#[derive(Parser)]
#[command(name = "pulsar_gibbs")]
#[command(version)]
struct Cli {
    /// Timing model parameter file
    #[arg(long)]
    par: PathBuf,

    /// Times of arrival
    #[arg(long)]
    tim: PathBuf,

    /// Directory receiving the chains
    #[arg(long, default_value = "./chains")]
    outdir: PathBuf,

    #[arg(long, default_value = "10000")]
    niter: usize,

    /// JSON file with model options; missing fields take defaults
    #[arg(long)]
    model: Option<PathBuf>,

    /// JSON noise dictionary with fixed white noise values
    #[arg(long)]
    noise_dict: Option<PathBuf>,

    /// Free spectrum update: conditional or mh
    #[arg(long, default_value = "conditional")]
    hypersample: SampleMethod,

    /// ECORR update: conditional or mh
    #[arg(long, default_value = "mh")]
    ecorrsample: SampleMethod,

    #[arg(long)]
    seed: Option<u64>,

    /// Continue from chains already in the output directory
    #[arg(long)]
    resume: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    // Load pulsar
    let psr = Pulsar::new(&cli.par, &cli.tim)
        .with_context(|| format!("failed to load pulsar from {} and {}", cli.par.display(), cli.tim.display()))?;
    log::info!("loaded {} with {} TOAs over {:.2} yr", psr.name, psr.len(), psr.tspan() / 3.15576e7);

    // Build the noise model
    let mut model_config = match &cli.model {
        Some(path) => ModelConfig::from_json_file(path)
            .with_context(|| format!("failed to read model options from {}", path.display()))?,
        None => ModelConfig::default(),
    };
    if let Some(path) = &cli.noise_dict {
        model_config.noise_dict =
            Some(read_noise_dict(path).with_context(|| format!("failed to read noise dictionary {}", path.display()))?);
    }
    let model = model_general(&psr, &model_config).context("failed to build the noise model")?;

    // Wrap it in the Gibbs sampler
    let config = GibbsConfig {
        hypersample: cli.hypersample,
        ecorrsample: cli.ecorrsample,
        seed: cli.seed,
        ..GibbsConfig::default()
    };
    let mut gibbs = PulsarBlockGibbs::new(model, config).context("failed to set up the sampler")?;

    // Starting point drawn from the priors
    let mut rng = match cli.seed {
        Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed.wrapping_add(1)),
        None => Xoshiro256PlusPlus::from_entropy(),
    };
    let x0 = gibbs.model().sample_initial(&mut rng);

    gibbs
        .sample(&x0, &cli.outdir, cli.niter, cli.resume)
        .with_context(|| format!("sampling into {} failed", cli.outdir.display()))?;

    Ok(())
}
