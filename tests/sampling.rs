use ndarray::{s, Array2};
use ndarray_npy::read_npy;
use pulsar_gibbs::simulate::{simulate_pulsar, write_par, write_tim, SimulationConfig};
use pulsar_gibbs::{model_general, GibbsConfig, ModelConfig, Pulsar, PulsarBlockGibbs, SampleMethod};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs;
use std::path::Path;

fn write_fake_pulsar(dir: &Path, inc_backends: usize) -> Pulsar {
    let backends = ["ASP", "GUPPI", "PUPPI"][..inc_backends]
        .iter()
        .map(|b| b.to_string())
        .collect();
    let config = SimulationConfig {
        ntoas: 80,
        toas_per_epoch: 2,
        backends,
        seed: 3,
        ..SimulationConfig::default()
    };
    let (par, toas) = simulate_pulsar(&config);
    write_par(dir.join("fake.par"), &par).unwrap();
    write_tim(dir.join("fake.tim"), &toas).unwrap();
    Pulsar::new(dir.join("fake.par"), dir.join("fake.tim")).unwrap()
}

fn quick_config(seed: u64) -> GibbsConfig {
    GibbsConfig {
        seed: Some(seed),
        white_adapt_iters: 300,
        red_adapt_iters: 1500,
        red_steps_per_iter: 5,
        save_every: 10,
        ..GibbsConfig::default()
    }
}

fn model_config() -> ModelConfig {
    ModelConfig {
        red_components: 8,
        common_components: 8,
        ..ModelConfig::default()
    }
}

#[test]
fn test_notebook_flow_writes_chains() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let psr = write_fake_pulsar(data.path(), 1);

    let model = model_general(&psr, &model_config()).unwrap();
    let mut gibbs = PulsarBlockGibbs::new(model, quick_config(1)).unwrap();
    let x0 = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(2));
    assert_eq!(x0.len(), gibbs.param_names().len());

    let outdir = out.path().join("J1234+5678");
    let chains = gibbs.sample(&x0, &outdir, 30, false).unwrap();

    let names = fs::read_to_string(outdir.join("pars_chain.txt")).unwrap();
    let names: Vec<&str> = names.lines().collect();
    assert_eq!(names.len(), chains.chain.ncols());
    assert!(names.contains(&"J1234+5678_ASP_efac"));
    assert!(names.contains(&"gw_log10_rho_7"));

    let bnames = fs::read_to_string(outdir.join("pars_bchain.txt")).unwrap();
    assert_eq!(bnames.lines().count(), chains.bchain.ncols());
    assert!(bnames.lines().any(|l| l == "gw_0"));
    assert!(bnames.lines().any(|l| l == "J1234+5678_linear_timing_model_0"));

    let saved: Array2<f64> = read_npy(outdir.join("chain.npy")).unwrap();
    let bsaved: Array2<f64> = read_npy(outdir.join("bchain.npy")).unwrap();
    assert_eq!(saved, chains.chain);
    assert_eq!(bsaved, chains.bchain);

    // Every recorded state lies inside the prior
    for row in chains.chain.rows() {
        let x: Vec<f64> = row.to_vec();
        assert!(gibbs.get_lnprior(&x).unwrap().is_finite());
    }
}

#[test]
fn test_free_spectrum_tracks_coefficients() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let psr = write_fake_pulsar(data.path(), 1);

    let config = ModelConfig {
        red_var: false,
        ..model_config()
    };
    let model = model_general(&psr, &config).unwrap();
    let mut gibbs = PulsarBlockGibbs::new(model, quick_config(4)).unwrap();
    let x0 = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(5));
    let chains = gibbs.sample(&x0, out.path(), 40, false).unwrap();

    // The injected red noise puts most power at the lowest frequencies
    let rho = gibbs.get_gwrho_param_indices().to_vec();
    let late = chains.chain.slice(s![20.., ..]);
    let mean_of = |indices: &[usize]| {
        indices
            .iter()
            .map(|&i| late.column(i).mean().unwrap())
            .sum::<f64>()
            / indices.len() as f64
    };
    let lowest = mean_of(&rho[..3]);
    let highest = mean_of(&rho[rho.len() - 3..]);
    assert!(lowest > highest, "lowest {lowest} highest {highest}");
}

#[test]
fn test_resume_continues_saved_chains() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let psr = write_fake_pulsar(data.path(), 2);

    let model = model_general(&psr, &model_config()).unwrap();
    let mut gibbs = PulsarBlockGibbs::new(model, quick_config(6)).unwrap();
    let x0 = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(7));
    let first = gibbs.sample(&x0, out.path(), 15, false).unwrap();

    let model = model_general(&psr, &model_config()).unwrap();
    let mut resumed = PulsarBlockGibbs::new(model, quick_config(8)).unwrap();
    let second = resumed.sample(&x0, out.path(), 25, true).unwrap();

    assert_eq!(second.chain.nrows(), 25);
    assert_eq!(second.chain.slice(s![..15, ..]), first.chain);
    assert_eq!(second.bchain.slice(s![..15, ..]), first.bchain);
    // The first resumed row repeats the last saved state
    assert_eq!(second.chain.row(15), first.chain.row(14));
}

#[test]
fn test_resume_without_chains_fails() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let psr = write_fake_pulsar(data.path(), 1);

    let model = model_general(&psr, &model_config()).unwrap();
    let mut gibbs = PulsarBlockGibbs::new(model, quick_config(9)).unwrap();
    let x0 = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(10));
    assert!(gibbs.sample(&x0, out.path(), 5, true).is_err());
}

#[test]
fn test_ecorr_and_mh_hypersampling() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let psr = write_fake_pulsar(data.path(), 2);

    let config = ModelConfig {
        inc_ecorr: true,
        ..model_config()
    };
    let model = model_general(&psr, &config).unwrap();
    let gibbs_config = GibbsConfig {
        hypersample: SampleMethod::Mh,
        ecorrsample: SampleMethod::Conditional,
        ..quick_config(11)
    };
    let mut gibbs = PulsarBlockGibbs::new(model, gibbs_config).unwrap();
    assert_eq!(gibbs.get_ecorr_indices().len(), 2);

    let x0 = gibbs.model().sample_initial(&mut Xoshiro256PlusPlus::seed_from_u64(12));
    let chains = gibbs.sample(&x0, out.path(), 12, false).unwrap();
    assert!(chains.chain.iter().all(|v| v.is_finite()));
    assert!(chains.bchain.iter().all(|v| v.is_finite()));
}
