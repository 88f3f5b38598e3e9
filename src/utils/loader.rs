use crate::constants::SECONDS_PER_DAY;
use crate::error::{GibbsError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// tim file commands that carry no information we use.
const IGNORED_TIM_COMMANDS: [&str; 8] = [
    "FORMAT", "MODE", "EFAC", "EQUAD", "JUMP", "TRACK", "PHASE", "INFO",
];

/// A Modified Julian Date split into integer day and fractional day.
///
/// TOAs are quoted to ~1e-13 days, which does not survive a round trip
/// through a single `f64` MJD. Keeping the day separate preserves it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Mjd {
    pub day: i64,
    pub frac: f64,
}

impl Mjd {
    /// Parses an MJD written as `ddddd.ffffffffff`.
    pub fn parse(text: &str) -> Option<Mjd> {
        let text = text.trim();
        let (day, frac) = match text.split_once('.') {
            Some((day, frac)) => (day, frac),
            None => (text, "0"),
        };

        // Fractional part is parsed with a leading "0." so no digits are lost to the day
        let day: i64 = day.parse().ok()?;
        let frac: f64 = if frac.is_empty() {
            0.0
        } else {
            format!("0.{frac}").parse().ok()?
        };

        Some(Mjd { day, frac })
    }

    /// Seconds elapsed from `other` to `self`.
    pub fn seconds_since(&self, other: &Mjd) -> f64 {
        (self.day - other.day) as f64 * SECONDS_PER_DAY + (self.frac - other.frac) * SECONDS_PER_DAY
    }

    /// Shifts the date by some number of seconds, keeping `frac` in [0, 1).
    pub fn add_seconds(&self, seconds: f64) -> Mjd {
        let frac = self.frac + seconds / SECONDS_PER_DAY;
        let carry = frac.floor();
        Mjd {
            day: self.day + carry as i64,
            frac: frac - carry,
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.day as f64 + self.frac
    }
}

impl fmt::Display for Mjd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Rounding can carry the fraction into the next day
        let frac = format!("{:.15}", self.frac);
        match frac.strip_prefix("0.") {
            Some(digits) => write!(f, "{}.{}", self.day, digits),
            None => write!(f, "{}.{}", self.day + 1, "0".repeat(15)),
        }
    }
}

/// The subset of a timing model `.par` file we need: the pulsar name and its
/// spin-down parameters. Every other `KEY VALUE` entry is kept as text.
#[derive(Debug, Clone)]
pub struct ParFile {
    pub name: String,
    pub f0: f64,
    pub f1: f64,
    pub pepoch: Mjd,
    pub entries: HashMap<String, String>,
}

impl ParFile {
    /// Reads and parses a `.par` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<ParFile> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        ParFile::parse(&text, &path.display().to_string())
    }

    /// Parses the contents of a `.par` file. `label` is only used in errors.
    pub fn parse(text: &str, label: &str) -> Result<ParFile> {
        // Collect KEY VALUE pairs
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("C ") {
                continue;
            }

            let mut tokens = line.split_whitespace();
            if let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
                entries.insert(key.to_uppercase(), value.to_string());
            }
        }

        // Pulsar name is PSRJ for tempo2-style files, PSR for older ones
        let name = entries
            .get("PSRJ")
            .or_else(|| entries.get("PSR"))
            .cloned()
            .ok_or_else(|| GibbsError::MissingParameter("PSRJ".to_string()))?;

        let f0 = parse_float_entry(&entries, "F0", label)?
            .ok_or_else(|| GibbsError::MissingParameter("F0".to_string()))?;
        let f1 = parse_float_entry(&entries, "F1", label)?.unwrap_or(0.0);
        let pepoch = entries
            .get("PEPOCH")
            .ok_or_else(|| GibbsError::MissingParameter("PEPOCH".to_string()))
            .and_then(|value| {
                Mjd::parse(value).ok_or_else(|| GibbsError::Parse {
                    file: label.to_string(),
                    line: 0,
                    reason: format!("invalid PEPOCH {value}"),
                })
            })?;

        Ok(ParFile {
            name,
            f0,
            f1,
            pepoch,
            entries,
        })
    }
}

fn parse_float_entry(entries: &HashMap<String, String>, key: &str, label: &str) -> Result<Option<f64>> {
    match entries.get(key) {
        Some(value) => parse_fortran_float(value)
            .map(Some)
            .ok_or_else(|| GibbsError::Parse {
                file: label.to_string(),
                line: 0,
                reason: format!("invalid value for {key}: {value}"),
            }),
        None => Ok(None),
    }
}

/// Parses a float, accepting Fortran `D` exponents as written by tempo.
pub fn parse_fortran_float(text: &str) -> Option<f64> {
    text.replace(['D', 'd'], "e").parse().ok()
}

/// A single time of arrival.
#[derive(Debug, Clone)]
pub struct Toa {
    pub name: String,
    pub freq_mhz: f64,
    pub mjd: Mjd,
    pub error_us: f64,
    pub site: String,
    pub flags: BTreeMap<String, String>,
}

/// TOAs read from a tempo2 `FORMAT 1` `.tim` file.
#[derive(Debug, Clone)]
pub struct TimFile {
    pub toas: Vec<Toa>,
}

impl TimFile {
    /// Reads a `.tim` file, following any `INCLUDE` statements.
    pub fn from_path(path: impl AsRef<Path>) -> Result<TimFile> {
        let path = path.as_ref();

        let mut toas = Vec::new();
        read_tim_into(path, &mut toas)?;

        if toas.is_empty() {
            return Err(GibbsError::NoToas(path.display().to_string()));
        }
        log::debug!("read {} TOAs from {}", toas.len(), path.display());

        Ok(TimFile { toas })
    }

    /// Parses `.tim` contents directly. `INCLUDE` paths resolve relative to `base_dir`.
    pub fn parse(text: &str, label: &str, base_dir: &Path) -> Result<TimFile> {
        let mut toas = Vec::new();
        parse_tim_text(text, label, base_dir, &mut toas)?;

        if toas.is_empty() {
            return Err(GibbsError::NoToas(label.to_string()));
        }

        Ok(TimFile { toas })
    }
}

fn read_tim_into(path: &Path, toas: &mut Vec<Toa>) -> Result<()> {
    let text = fs::read_to_string(path)?;
    let base_dir: PathBuf = path.parent().map(Path::to_path_buf).unwrap_or_default();
    parse_tim_text(&text, &path.display().to_string(), &base_dir, toas)
}

fn parse_tim_text(text: &str, label: &str, base_dir: &Path, toas: &mut Vec<Toa>) -> Result<()> {
    // TIME statements accumulate and apply to every TOA that follows
    let mut time_offset = 0.0;

    for (line_index, line) in text.lines().enumerate() {
        let line_number = line_index + 1;
        let parse_error = |reason: String| GibbsError::Parse {
            file: label.to_string(),
            line: line_number,
            reason,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("C ") {
            continue;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        let command = tokens[0].to_uppercase();

        if IGNORED_TIM_COMMANDS.contains(&command.as_str()) {
            continue;
        }
        if command == "TIME" {
            let offset = tokens
                .get(1)
                .and_then(|x| parse_fortran_float(x))
                .ok_or_else(|| parse_error("TIME requires a numeric offset".to_string()))?;
            time_offset += offset;
            continue;
        }
        if command == "INCLUDE" {
            let include = tokens
                .get(1)
                .ok_or_else(|| parse_error("INCLUDE requires a path".to_string()))?;
            read_tim_into(&base_dir.join(include), toas)?;
            continue;
        }

        // Otherwise this is a TOA line: name freq mjd err site [-flag value]...
        if tokens.len() < 5 {
            return Err(parse_error(format!("expected at least 5 fields, found {}", tokens.len())));
        }
        let freq_mhz = parse_fortran_float(tokens[1])
            .ok_or_else(|| parse_error(format!("invalid frequency {}", tokens[1])))?;
        let mjd = Mjd::parse(tokens[2]).ok_or_else(|| parse_error(format!("invalid MJD {}", tokens[2])))?;
        let error_us = parse_fortran_float(tokens[3])
            .ok_or_else(|| parse_error(format!("invalid TOA error {}", tokens[3])))?;
        if error_us <= 0.0 {
            return Err(parse_error(format!("TOA error must be positive, found {error_us}")));
        }

        // Flags come in -key value pairs
        let mut flags = BTreeMap::new();
        let mut rest = tokens[5..].iter();
        while let Some(&key) = rest.next() {
            let Some(key) = key.strip_prefix('-') else {
                return Err(parse_error(format!("expected a flag, found {key}")));
            };
            let value = rest
                .next()
                .ok_or_else(|| parse_error(format!("flag -{key} has no value")))?;
            flags.insert(key.to_string(), value.to_string());
        }

        toas.push(Toa {
            name: tokens[0].to_string(),
            freq_mhz,
            mjd: if time_offset != 0.0 { mjd.add_seconds(time_offset) } else { mjd },
            error_us,
            site: tokens[4].to_string(),
            flags,
        });
    }

    Ok(())
}

#[test]
fn test_mjd_keeps_precision() {
    let a = Mjd::parse("55000.0000000000001").unwrap();
    let b = Mjd::parse("55000.0000000000000").unwrap();
    assert_eq!(a.day, 55000);
    assert!(a.seconds_since(&b) > 0.0);
    assert!((a.seconds_since(&b) - 1e-13 * SECONDS_PER_DAY).abs() < 1e-15);
}

#[test]
fn test_mjd_add_seconds_carries() {
    let mjd = Mjd::parse("55000.9").unwrap().add_seconds(0.2 * SECONDS_PER_DAY);
    assert_eq!(mjd.day, 55001);
    assert!((mjd.frac - 0.1).abs() < 1e-12);
}

#[test]
fn test_mjd_display_round_trip() {
    let mjd = Mjd::parse("55123.000123456789").unwrap();
    assert_eq!(mjd.to_string(), "55123.000123456789000");
    assert_eq!(Mjd::parse(&mjd.to_string()).unwrap(), mjd);

    let carry = Mjd { day: 10, frac: 0.9999999999999999 };
    assert_eq!(carry.to_string(), "11.000000000000000");
}

#[test]
fn test_parse_par() {
    let text = "PSRJ J1909-3744\nF0 339.31568728824 1 1e-13\nF1 -1.614D-15 1\nPEPOCH 53631.0\n# comment\nDM 10.39\n";
    let par = ParFile::parse(text, "test.par").unwrap();
    assert_eq!(par.name, "J1909-3744");
    assert_eq!(par.f0, 339.31568728824);
    assert_eq!(par.f1, -1.614e-15);
    assert_eq!(par.pepoch.day, 53631);
    assert_eq!(par.entries.get("DM").unwrap(), "10.39");
}

#[test]
fn test_parse_par_missing_f0() {
    let err = ParFile::parse("PSRJ J0000+0000\nPEPOCH 55000\n", "test.par").unwrap_err();
    assert!(matches!(err, GibbsError::MissingParameter(p) if p == "F0"));
}

#[test]
fn test_parse_tim_flags_and_time_offset() {
    let text = "FORMAT 1\nMODE 1\nC a comment\n\
                obs1 1400.0 55000.5 1.0 ao -f ASP_L -be ASP\n\
                TIME 86400\n\
                obs2 1400.0 55000.5 2.0 ao -f ASP_L\n";
    let tim = TimFile::parse(text, "test.tim", Path::new(".")).unwrap();
    assert_eq!(tim.toas.len(), 2);
    assert_eq!(tim.toas[0].flags.get("f").unwrap(), "ASP_L");
    assert_eq!(tim.toas[0].flags.get("be").unwrap(), "ASP");
    assert_eq!(tim.toas[1].mjd.day, 55001);
    assert_eq!(tim.toas[1].error_us, 2.0);
}

#[test]
fn test_parse_tim_rejects_short_line() {
    let err = TimFile::parse("obs1 1400.0 55000.5\n", "bad.tim", Path::new(".")).unwrap_err();
    assert!(matches!(err, GibbsError::Parse { line: 1, .. }));
}

#[test]
fn test_parse_tim_include() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("sub.tim"), "obs2 820.0 55001.5 1.5 gbt -f GUPPI\n").unwrap();
    fs::write(
        dir.path().join("main.tim"),
        "FORMAT 1\nobs1 1400.0 55000.5 1.0 ao -f ASP\nINCLUDE sub.tim\n",
    )
    .unwrap();

    let tim = TimFile::from_path(dir.path().join("main.tim")).unwrap();
    assert_eq!(tim.toas.len(), 2);
    assert_eq!(tim.toas[1].site, "gbt");
}
