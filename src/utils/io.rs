use crate::error::{GibbsError, Result};
use ndarray::{s, Array2, ArrayView2};
use ndarray_npy::{read_npy, write_npy};
use std::fs;
use std::path::{Path, PathBuf};

pub const PARAM_NAMES_FILE: &str = "pars_chain.txt";
pub const BASIS_NAMES_FILE: &str = "pars_bchain.txt";
pub const CHAIN_FILE: &str = "chain.npy";
pub const BCHAIN_FILE: &str = "bchain.npy";

/// Output directory for a sampling run: parameter names, the hyperparameter
/// chain and the basis coefficient chain.
pub struct ChainDir {
    outdir: PathBuf,
}

impl ChainDir {
    /// Creates the output directory (and any parents) if needed.
    pub fn create(outdir: impl AsRef<Path>) -> Result<ChainDir> {
        let outdir = outdir.as_ref().to_path_buf();
        log::info!("Creating chain directory: {}", outdir.display());
        fs::create_dir_all(&outdir)?;
        Ok(ChainDir { outdir })
    }

    pub fn path(&self) -> &Path {
        &self.outdir
    }

    /// Writes one name per line.
    pub fn write_names(&self, file: &str, names: &[String]) -> Result<()> {
        let mut text = names.join("\n");
        text.push('\n');
        fs::write(self.outdir.join(file), text)?;
        Ok(())
    }

    /// Saves the first `rows` rows of both chains. Files are written to a
    /// temporary name and renamed so an interrupted save leaves the previous
    /// chains intact.
    pub fn save(&self, chain: ArrayView2<f64>, bchain: ArrayView2<f64>, rows: usize) -> Result<()> {
        self.save_array(CHAIN_FILE, chain.slice(s![..rows, ..]))?;
        self.save_array(BCHAIN_FILE, bchain.slice(s![..rows, ..]))?;
        Ok(())
    }

    fn save_array(&self, file: &str, array: ArrayView2<f64>) -> Result<()> {
        let tmp = self.outdir.join(format!("{file}.tmp"));
        write_npy(&tmp, &array)?;
        fs::rename(&tmp, self.outdir.join(file))?;
        Ok(())
    }

    /// Loads previously saved chains, truncated to the shorter of the two.
    pub fn load(&self) -> Result<(Array2<f64>, Array2<f64>)> {
        let chain_path = self.outdir.join(CHAIN_FILE);
        let bchain_path = self.outdir.join(BCHAIN_FILE);
        for path in [&chain_path, &bchain_path] {
            if !path.exists() {
                return Err(GibbsError::Resume {
                    path: path.clone(),
                    reason: "file does not exist".to_string(),
                });
            }
        }

        let chain: Array2<f64> = read_npy(&chain_path)?;
        let bchain: Array2<f64> = read_npy(&bchain_path)?;

        let rows = chain.nrows().min(bchain.nrows());
        Ok((
            chain.slice(s![..rows, ..]).to_owned(),
            bchain.slice(s![..rows, ..]).to_owned(),
        ))
    }

    /// Reads a names file written by [`write_names`](Self::write_names).
    pub fn read_names(&self, file: &str) -> Result<Vec<String>> {
        let text = fs::read_to_string(self.outdir.join(file))?;
        Ok(text.lines().map(str::to_string).collect())
    }
}

#[test]
fn test_save_and_load_truncates_to_shorter() {
    let dir = tempfile::tempdir().unwrap();
    let chain_dir = ChainDir::create(dir.path().join("nested/run")).unwrap();

    let chain = Array2::from_shape_fn((10, 3), |(i, j)| (i * 3 + j) as f64);
    let bchain = Array2::from_shape_fn((10, 2), |(i, j)| -((i * 2 + j) as f64));
    chain_dir.save(chain.view(), bchain.view(), 4).unwrap();

    let (loaded, bloaded) = chain_dir.load().unwrap();
    assert_eq!(loaded.shape(), &[4, 3]);
    assert_eq!(bloaded.shape(), &[4, 2]);
    assert_eq!(loaded[[3, 2]], 11.0);
    assert_eq!(bloaded[[1, 1]], -3.0);
}

#[test]
fn test_load_missing_chain_is_resume_error() {
    let dir = tempfile::tempdir().unwrap();
    let chain_dir = ChainDir::create(dir.path()).unwrap();
    assert!(matches!(chain_dir.load(), Err(GibbsError::Resume { .. })));
}

#[test]
fn test_names_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let chain_dir = ChainDir::create(dir.path()).unwrap();
    let names = vec!["a_efac".to_string(), "gw_log10_rho_0".to_string()];
    chain_dir.write_names(PARAM_NAMES_FILE, &names).unwrap();
    assert_eq!(chain_dir.read_names(PARAM_NAMES_FILE).unwrap(), names);
}
