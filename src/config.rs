use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Error};
use race_analysis::{AnalysisOptions, DEFAULT_WIDENING_THRESHOLD, VariableSkipper};
use serde::{Deserialize, Serialize};

/// Analysis settings.
///
/// [`Config::from_env`] reads the defaults from `RACEGRIND_*` environment
/// variables. A JSON file loaded with [`Config::from_json_file`] replaces
/// them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Number of state changes a node may see before it is widened.
    ///
    /// Defaults to the `RACEGRIND_WIDENING_THRESHOLD` environment variable.
    pub widening_threshold: usize,

    /// Accesses that never produce usage points.
    ///
    /// Defaults to the comma separated lists in `RACEGRIND_SKIP_NAMES`,
    /// `RACEGRIND_SKIP_PREFIXES` and `RACEGRIND_SKIP_FUNCTIONS`.
    pub skipper: VariableSkipper,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            widening_threshold: DEFAULT_WIDENING_THRESHOLD,
            skipper: VariableSkipper::new(),
        }
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars<F: Fn(&str) -> Option<String>>(var: F) -> Result<Self, Error> {
        let mut config = Config::default();

        if let Some(value) = var("RACEGRIND_WIDENING_THRESHOLD") {
            config.widening_threshold = value
                .trim()
                .parse()
                .with_context(|| format!("invalid value for `RACEGRIND_WIDENING_THRESHOLD`: {value}"))?;
        }

        let mut skipper = VariableSkipper::new();
        if let Some(value) = var("RACEGRIND_SKIP_NAMES") {
            skipper = split_list(&value).fold(skipper, VariableSkipper::skip_name);
        }
        if let Some(value) = var("RACEGRIND_SKIP_PREFIXES") {
            skipper = split_list(&value).fold(skipper, VariableSkipper::skip_name_prefix);
        }
        if let Some(value) = var("RACEGRIND_SKIP_FUNCTIONS") {
            skipper = split_list(&value).fold(skipper, VariableSkipper::skip_function);
        }
        config.skipper = skipper;

        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let reader = BufReader::new(
            File::open(path).with_context(|| format!("cannot open config {}", path.display()))?,
        );
        serde_json::from_reader(reader).map_err(Error::from)
    }

    pub fn options(&self) -> AnalysisOptions {
        AnalysisOptions {
            widening_threshold: self.widening_threshold,
            skipper: self.skipper.clone(),
        }
    }
}
