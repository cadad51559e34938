// simulate/records.rs

//! What a simulation run keeps: one record per (replication, model) fit, grouped by
//! replication and design point, plus the formulas and options that produced them.
//! The whole result saves to and loads from TOML.

use crate::design::formula::FormulaDescription;
use crate::design::structure::{GroupLevel, VarianceComponents};
use crate::design::study::StudyDesign;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialise simulation result: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Failed to parse simulation result: {0}")]
    TomlDe(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Completed,
    ConvergenceWarning,
    FitFailed,
}

impl FitStatus {
    /// Whether the fit produced estimates that summaries may use.
    pub fn has_estimates(self) -> bool {
        self != FitStatus::FitFailed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRecord {
    pub name: String,
    pub estimate: f64,
    pub se: f64,
    /// Two-sided Wald z p-value.
    pub p_value: f64,
    pub df: Option<f64>,
    pub p_value_satterthwaite: Option<f64>,
    pub df_warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedValue {
    pub name: String,
    pub value: f64,
}

impl NamedValue {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        NamedValue {
            name: name.into(),
            value,
        }
    }
}

/// Named standard deviations and correlations, `error.sd` last.
pub fn variance_values(components: &VarianceComponents, levels: &[GroupLevel]) -> Vec<NamedValue> {
    let mut values = Vec::new();
    for &level in levels {
        let lv = components.level(level);
        values.push(NamedValue::new(format!("{level}.sd_intercept"), lv.sd_intercept));
        values.push(NamedValue::new(format!("{level}.sd_slope"), lv.sd_slope));
        values.push(NamedValue::new(format!("{level}.cor"), lv.cor));
    }
    values.push(NamedValue::new("error.sd", components.sigma_error));
    values
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub model: String,
    pub status: FitStatus,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub coefficients: Vec<CoefficientRecord>,
    #[serde(default)]
    pub variance: Vec<NamedValue>,
    pub loglik: Option<f64>,
    pub n_covariance_params: usize,
    pub n_obs: usize,
}

impl FitRecord {
    pub fn failed(model: &str, n_covariance_params: usize, n_obs: usize, error: String) -> Self {
        FitRecord {
            model: model.to_string(),
            status: FitStatus::FitFailed,
            warnings: Vec::new(),
            error: Some(error),
            coefficients: Vec::new(),
            variance: Vec::new(),
            loglik: None,
            n_covariance_params,
            n_obs,
        }
    }

    pub fn coefficient(&self, name: &str) -> Option<&CoefficientRecord> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub replication: usize,
    pub seed: u64,
    /// Set when the replication could not be analysed at all (an empty grouping
    /// factor after dropout); `fits` is then empty.
    pub failure: Option<String>,
    #[serde(default)]
    pub fits: Vec<FitRecord>,
}

impl ReplicationRecord {
    pub fn fit(&self, model: &str) -> Option<&FitRecord> {
        self.fits.iter().find(|f| f.model == model)
    }
}

/// True parameter values a model's estimates are compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTruth {
    pub model: String,
    pub coefficients: Vec<NamedValue>,
    pub variance: Vec<NamedValue>,
}

impl ModelTruth {
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coefficients.iter().find(|v| v.name == name).map(|v| v.value)
    }

    pub fn variance(&self, name: &str) -> Option<f64> {
        self.variance.iter().find(|v| v.name == name).map(|v| v.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignPoint {
    pub index: usize,
    pub label: String,
    pub design: StudyDesign,
    /// Analytical power of the treatment-by-time test, when it could be computed.
    pub analytical_power: Option<f64>,
    pub truth: Vec<ModelTruth>,
    pub replications: Vec<ReplicationRecord>,
}

impl DesignPoint {
    pub fn truth(&self, model: &str) -> Option<&ModelTruth> {
        self.truth.iter().find(|t| t.model == model)
    }

    pub fn failed_replications(&self) -> usize {
        self.replications.iter().filter(|r| r.failure.is_some()).count()
    }
}

/// Options a result was produced with, kept for provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub nsim: usize,
    pub seed: u64,
    pub cores: usize,
    pub satterthwaite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub run: RunInfo,
    pub formulas: Vec<FormulaDescription>,
    pub designs: Vec<DesignPoint>,
}

impl SimulationResult {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RecordError> {
        let text = toml::to_string(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.formulas.iter().map(|f| f.name.as_str()).collect()
    }
}
