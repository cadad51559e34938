// design/study.rs

//! The study definition: sample sizes per level, variance components, dropout,
//! nesting topology and effect size of a longitudinal multilevel trial.
//!
//! A `StudyDesign` is a plain value. Construct it field by field (or through
//! `StudyParameters`), then call `validated()`; every consumer in the crate assumes
//! it received a validated design. Derived copies go through `update`, which
//! re-validates.

use crate::design::dropout::{Dropout, DropoutError};
use crate::linalg::{self, LinalgError};
use ndarray::{Array2, array};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Invalid design: {0}")]
    InvalidDesign(String),
    #[error("Invalid dropout for the {arm} arm: {source}")]
    Dropout {
        arm: Arm,
        #[source]
        source: DropoutError,
    },
    #[error("Covariance check failed: {0}")]
    Linalg(#[from] LinalgError),
}

// --- Arms ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    Control,
    Treatment,
}

impl Arm {
    pub const BOTH: [Arm; 2] = [Arm::Control, Arm::Treatment];

    /// The 0/1 treatment dummy used in the fixed-effects design.
    pub fn indicator(self) -> f64 {
        match self {
            Arm::Control => 0.0,
            Arm::Treatment => 1.0,
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arm::Control => write!(f, "control"),
            Arm::Treatment => write!(f, "treatment"),
        }
    }
}

/// A setting that may differ between the two arms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerArm<T> {
    pub control: T,
    pub treatment: T,
}

impl<T: Clone> PerArm<T> {
    pub fn same(value: T) -> Self {
        PerArm {
            control: value.clone(),
            treatment: value,
        }
    }
}

impl<T> PerArm<T> {
    pub fn get(&self, arm: Arm) -> &T {
        match arm {
            Arm::Control => &self.control,
            Arm::Treatment => &self.treatment,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(Arm, &T) -> U) -> PerArm<U> {
        PerArm {
            control: f(Arm::Control, &self.control),
            treatment: f(Arm::Treatment, &self.treatment),
        }
    }
}

// --- Sample sizes ---

/// Subjects per cluster for one arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterSizes {
    /// `n3` clusters with `n2` subjects each.
    Equal { n2: usize, n3: usize },
    /// One entry per cluster.
    Unequal { sizes: Vec<usize> },
    /// `n3` clusters whose sizes are drawn per replication from Poisson(`mean`),
    /// with at least one subject each.
    Poisson { mean: f64, n3: usize },
}

impl ClusterSizes {
    pub fn n_clusters(&self) -> usize {
        match self {
            ClusterSizes::Equal { n3, .. } | ClusterSizes::Poisson { n3, .. } => *n3,
            ClusterSizes::Unequal { sizes } => sizes.len(),
        }
    }

    /// Cluster sizes used by the analytical engine. Random sizes are replaced by
    /// their rounded mean.
    pub fn expected_sizes(&self) -> Vec<usize> {
        match self {
            ClusterSizes::Equal { n2, n3 } => vec![*n2; *n3],
            ClusterSizes::Unequal { sizes } => sizes.clone(),
            ClusterSizes::Poisson { mean, n3 } => vec![(mean.round() as usize).max(1); *n3],
        }
    }

    pub fn total_subjects(&self) -> usize {
        self.expected_sizes().iter().sum()
    }

    /// `Some(n2)` when every cluster of the arm has the same fixed size.
    pub fn common_size(&self) -> Option<usize> {
        match self {
            ClusterSizes::Equal { n2, .. } => Some(*n2),
            ClusterSizes::Unequal { sizes } => {
                let first = *sizes.first()?;
                sizes.iter().all(|&s| s == first).then_some(first)
            }
            ClusterSizes::Poisson { .. } => None,
        }
    }

    fn validate(&self, arm: Arm) -> Result<(), DesignError> {
        let bad = |msg: String| Err(DesignError::InvalidDesign(format!("{arm} arm: {msg}")));
        match self {
            ClusterSizes::Equal { n2, n3 } => {
                if *n2 == 0 || *n3 == 0 {
                    return bad(format!("n2 and n3 must be at least 1, found n2={n2}, n3={n3}"));
                }
            }
            ClusterSizes::Unequal { sizes } => {
                if sizes.is_empty() {
                    return bad("unequal cluster sizes need at least one cluster".to_string());
                }
                if sizes.contains(&0) {
                    return bad(format!("every cluster needs at least one subject, found {sizes:?}"));
                }
            }
            ClusterSizes::Poisson { mean, n3 } => {
                if !mean.is_finite() || *mean <= 0.0 {
                    return bad(format!("Poisson cluster mean must be positive, found {mean}"));
                }
                if *n3 == 0 {
                    return bad("n3 must be at least 1".to_string());
                }
            }
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        match self {
            ClusterSizes::Equal { n2, n3 } => format!("{n3} x {n2}"),
            ClusterSizes::Unequal { sizes } => format!("{sizes:?}"),
            ClusterSizes::Poisson { mean, n3 } => format!("{n3} x Poisson({mean})"),
        }
    }
}

// --- Variance components ---

/// Random intercept and slope at one grouping level, as standard deviations and
/// their correlation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LevelVariance {
    pub sd_intercept: f64,
    pub sd_slope: f64,
    #[serde(default)]
    pub cor: f64,
}

impl LevelVariance {
    pub fn new(sd_intercept: f64, sd_slope: f64, cor: f64) -> Self {
        LevelVariance {
            sd_intercept,
            sd_slope,
            cor,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.sd_intercept == 0.0 && self.sd_slope == 0.0
    }

    pub fn covariance(&self) -> Array2<f64> {
        let off = self.cor * self.sd_intercept * self.sd_slope;
        array![
            [self.sd_intercept.powi(2), off],
            [off, self.sd_slope.powi(2)]
        ]
    }

    /// Covariance between this level's contributions at times `t` and `s`.
    pub fn covariance_between(&self, t: f64, s: f64) -> f64 {
        let off = self.cor * self.sd_intercept * self.sd_slope;
        self.sd_intercept.powi(2) + (t + s) * off + t * s * self.sd_slope.powi(2)
    }

    fn validate(&self, level: &str) -> Result<(), DesignError> {
        for (name, value) in [
            ("intercept SD", self.sd_intercept),
            ("slope SD", self.sd_slope),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DesignError::InvalidDesign(format!(
                    "{level} {name} must be finite and non-negative, found {value}"
                )));
            }
        }
        if !self.cor.is_finite() || !(-1.0..=1.0).contains(&self.cor) {
            return Err(DesignError::InvalidDesign(format!(
                "{level} correlation must lie in [-1, 1], found {}",
                self.cor
            )));
        }
        let cov = self.covariance();
        let scale = cov[(0, 0)].max(cov[(1, 1)]).max(1.0);
        let min_eig = linalg::min_eigenvalue(&cov)?;
        if min_eig < -1e-10 * scale {
            return Err(DesignError::InvalidDesign(format!(
                "{level} covariance is not positive semi-definite (smallest eigenvalue {min_eig:.3e})"
            )));
        }
        Ok(())
    }
}

/// Treatment effect at the last time point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EffectSize {
    /// Raw difference between arms at `t_end`.
    Raw(f64),
    /// Difference at `t_end` in units of the control arm's pretest SD.
    CohensD(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignLevel {
    TwoLevel,
    ThreeLevel,
    PartiallyNested,
}

impl fmt::Display for DesignLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DesignLevel::TwoLevel => "two-level",
            DesignLevel::ThreeLevel => "three-level",
            DesignLevel::PartiallyNested => "partially nested three-level",
        };
        write!(f, "{text}")
    }
}

/// Share of the outcome variance at one time point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VarianceShare {
    pub time: f64,
    pub cluster: f64,
    pub subject: f64,
    pub error: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeSd {
    pub time: f64,
    pub control: f64,
    pub treatment: f64,
}

// --- The design ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDesign {
    pub n1: usize,
    pub t_end: f64,
    pub clusters: PerArm<ClusterSizes>,
    pub fixed_intercept: f64,
    pub fixed_slope: f64,
    pub subject: LevelVariance,
    pub cluster: LevelVariance,
    pub sigma_error: f64,
    pub effect: EffectSize,
    pub dropout: PerArm<Dropout>,
    #[serde(default)]
    pub deterministic_dropout: bool,
    #[serde(default)]
    pub partially_nested: bool,
}

impl StudyDesign {
    /// A two-level design with `n2` subjects per arm and everything else at its
    /// neutral default. Intended as a starting point for `update`.
    pub fn two_level(n1: usize, n2: usize, subject: LevelVariance, sigma_error: f64) -> Self {
        StudyDesign {
            n1,
            t_end: n1.saturating_sub(1) as f64,
            clusters: PerArm::same(ClusterSizes::Equal { n2, n3: 1 }),
            fixed_intercept: 0.0,
            fixed_slope: 0.0,
            subject,
            cluster: LevelVariance::default(),
            sigma_error,
            effect: EffectSize::Raw(0.0),
            dropout: PerArm::same(Dropout::None),
            deterministic_dropout: false,
            partially_nested: false,
        }
    }

    pub fn validated(self) -> Result<Self, DesignError> {
        if self.n1 < 2 {
            return Err(DesignError::InvalidDesign(format!(
                "n1 must be at least 2, found {}",
                self.n1
            )));
        }
        if !self.t_end.is_finite() || self.t_end <= 0.0 {
            return Err(DesignError::InvalidDesign(format!(
                "T_end must be positive and finite, found {}",
                self.t_end
            )));
        }
        for arm in Arm::BOTH {
            self.clusters.get(arm).validate(arm)?;
            self.dropout
                .get(arm)
                .validate(self.n1)
                .map_err(|source| DesignError::Dropout { arm, source })?;
        }
        self.subject.validate("subject")?;
        self.cluster.validate("cluster")?;
        if !self.sigma_error.is_finite() || self.sigma_error <= 0.0 {
            return Err(DesignError::InvalidDesign(format!(
                "sigma_error must be positive and finite, found {}",
                self.sigma_error
            )));
        }
        if !self.fixed_intercept.is_finite() || !self.fixed_slope.is_finite() {
            return Err(DesignError::InvalidDesign(
                "fixed effects must be finite".to_string(),
            ));
        }
        let effect = match self.effect {
            EffectSize::Raw(v) | EffectSize::CohensD(v) => v,
        };
        if !effect.is_finite() {
            return Err(DesignError::InvalidDesign(format!(
                "effect size must be finite, found {effect}"
            )));
        }
        Ok(self)
    }

    /// A validated copy with some fields overridden.
    pub fn update(&self, f: impl FnOnce(&mut StudyDesign)) -> Result<StudyDesign, DesignError> {
        let mut copy = self.clone();
        f(&mut copy);
        copy.validated()
    }

    /// `t_k = k * t_end / (n1 - 1)`.
    pub fn time_points(&self) -> Vec<f64> {
        let step = self.t_end / (self.n1 - 1) as f64;
        (0..self.n1).map(|k| k as f64 * step).collect()
    }

    pub fn level(&self) -> DesignLevel {
        if self.cluster.is_absent() {
            DesignLevel::TwoLevel
        } else if self.partially_nested {
            DesignLevel::PartiallyNested
        } else {
            DesignLevel::ThreeLevel
        }
    }

    /// Whether subjects of `arm` belong to clusters at all. Only the control arm of
    /// a partially nested design is unclustered.
    pub fn arm_is_clustered(&self, arm: Arm) -> bool {
        !(self.partially_nested && arm == Arm::Control)
    }

    /// Whether outcomes in `arm` carry a cluster-level random effect.
    pub fn arm_has_cluster_effect(&self, arm: Arm) -> bool {
        self.level() != DesignLevel::TwoLevel && self.arm_is_clustered(arm)
    }

    pub fn has_dropout(&self) -> bool {
        Arm::BOTH.iter().any(|&arm| !self.dropout.get(arm).is_none())
    }

    /// Cumulative dropout per time point for `arm`.
    pub fn dropout_curve(&self, arm: Arm) -> Vec<f64> {
        self.dropout.get(arm).cumulative(&self.time_points())
    }

    pub fn total_subjects(&self, arm: Arm) -> usize {
        self.clusters.get(arm).total_subjects()
    }

    /// SD of the control arm at baseline; the denominator of Cohen's d.
    pub fn pretest_sd(&self) -> f64 {
        let mut var = self.subject.sd_intercept.powi(2) + self.sigma_error.powi(2);
        if self.arm_has_cluster_effect(Arm::Control) {
            var += self.cluster.sd_intercept.powi(2);
        }
        var.sqrt()
    }

    /// Raw difference between arms at `t_end`.
    pub fn effect_at_end(&self) -> f64 {
        match self.effect {
            EffectSize::Raw(raw) => raw,
            EffectSize::CohensD(d) => d * self.pretest_sd(),
        }
    }

    /// Coefficient of `time:treatment` implied by the effect size.
    pub fn slope_difference(&self) -> f64 {
        self.effect_at_end() / self.t_end
    }

    // --- ICC parameterisation ---

    fn pretest_total(&self) -> f64 {
        self.subject.sd_intercept.powi(2)
            + self.cluster.sd_intercept.powi(2)
            + self.sigma_error.powi(2)
    }

    /// Share of baseline variance due to subjects and clusters together.
    pub fn icc_pre_subject(&self) -> f64 {
        (self.subject.sd_intercept.powi(2) + self.cluster.sd_intercept.powi(2))
            / self.pretest_total()
    }

    /// Share of baseline variance due to clusters.
    pub fn icc_pre_cluster(&self) -> f64 {
        self.cluster.sd_intercept.powi(2) / self.pretest_total()
    }

    /// Share of the random slope variance that lies between clusters.
    pub fn icc_slope(&self) -> f64 {
        let total = self.subject.sd_slope.powi(2) + self.cluster.sd_slope.powi(2);
        if total > 0.0 {
            self.cluster.sd_slope.powi(2) / total
        } else {
            0.0
        }
    }

    /// Total random slope variance relative to the residual variance.
    pub fn var_ratio(&self) -> f64 {
        (self.subject.sd_slope.powi(2) + self.cluster.sd_slope.powi(2)) / self.sigma_error.powi(2)
    }

    /// Marginal covariance between two measurements of the same subject in `arm`.
    pub fn covariance_between(&self, arm: Arm, t: f64, s: f64) -> f64 {
        let mut cov = self.subject.covariance_between(t, s);
        if self.arm_has_cluster_effect(arm) {
            cov += self.cluster.covariance_between(t, s);
        }
        cov
    }

    /// Variance partition coefficients per time point.
    pub fn variance_partition(&self, arm: Arm) -> Vec<VarianceShare> {
        let error = self.sigma_error.powi(2);
        self.time_points()
            .into_iter()
            .map(|t| {
                let subject = self.subject.covariance_between(t, t);
                let cluster = if self.arm_has_cluster_effect(arm) {
                    self.cluster.covariance_between(t, t)
                } else {
                    0.0
                };
                let total = subject + cluster + error;
                VarianceShare {
                    time: t,
                    cluster: cluster / total,
                    subject: subject / total,
                    error: error / total,
                    total,
                }
            })
            .collect()
    }

    pub fn sds(&self) -> Vec<TimeSd> {
        let error = self.sigma_error.powi(2);
        self.time_points()
            .into_iter()
            .map(|t| TimeSd {
                time: t,
                control: (self.covariance_between(Arm::Control, t, t) + error).sqrt(),
                treatment: (self.covariance_between(Arm::Treatment, t, t) + error).sqrt(),
            })
            .collect()
    }

    /// Correlation between a subject's measurements across the time points.
    pub fn correlation_matrix(&self, arm: Arm) -> Array2<f64> {
        let time = self.time_points();
        let error = self.sigma_error.powi(2);
        let cov = Array2::from_shape_fn((self.n1, self.n1), |(i, j)| {
            let nugget = if i == j { error } else { 0.0 };
            self.covariance_between(arm, time[i], time[j]) + nugget
        });
        Array2::from_shape_fn((self.n1, self.n1), |(i, j)| {
            cov[(i, j)] / (cov[(i, i)] * cov[(j, j)]).sqrt()
        })
    }

    /// One-line description used to label design points.
    pub fn label(&self) -> String {
        let mut parts = vec![format!("n1={}", self.n1)];
        if self.clusters.control == self.clusters.treatment {
            parts.push(format!("clusters={}", self.clusters.control.describe()));
        } else {
            parts.push(format!(
                "clusters=({}, {})",
                self.clusters.control.describe(),
                self.clusters.treatment.describe()
            ));
        }
        parts.push(format!("effect={:.4}", self.effect_at_end()));
        if self.has_dropout() {
            parts.push(format!(
                "dropout=({}, {})",
                self.dropout.control.describe(),
                self.dropout.treatment.describe()
            ));
        }
        parts.push(self.level().to_string());
        parts.join(" ")
    }
}

impl fmt::Display for StudyDesign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Study design ({})", self.level())?;
        writeln!(f, "  n1 (time points)     : {} over T_end = {}", self.n1, self.t_end)?;
        for arm in Arm::BOTH {
            let sizes = self.clusters.get(arm);
            writeln!(
                f,
                "  {:<9} clusters     : {} ({} subjects{})",
                arm.to_string(),
                sizes.describe(),
                sizes.total_subjects(),
                if self.arm_is_clustered(arm) { "" } else { ", unclustered" }
            )?;
        }
        writeln!(
            f,
            "  subject level        : sd_intercept={} sd_slope={} cor={}",
            self.subject.sd_intercept, self.subject.sd_slope, self.subject.cor
        )?;
        if !self.cluster.is_absent() {
            writeln!(
                f,
                "  cluster level        : sd_intercept={} sd_slope={} cor={}",
                self.cluster.sd_intercept, self.cluster.sd_slope, self.cluster.cor
            )?;
        }
        writeln!(f, "  sigma_error          : {}", self.sigma_error)?;
        writeln!(
            f,
            "  icc_pre_subject={:.4} icc_pre_cluster={:.4} icc_slope={:.4} var_ratio={:.4}",
            self.icc_pre_subject(),
            self.icc_pre_cluster(),
            self.icc_slope(),
            self.var_ratio()
        )?;
        let cohen = self.effect_at_end() / self.pretest_sd();
        writeln!(
            f,
            "  effect at T_end      : {:.4} (Cohen's d {:.4}, slope difference {:.4})",
            self.effect_at_end(),
            cohen,
            self.slope_difference()
        )?;
        for arm in Arm::BOTH {
            let retained: Vec<String> = self
                .dropout_curve(arm)
                .iter()
                .map(|p| format!("{:.2}", 1.0 - p))
                .collect();
            writeln!(
                f,
                "  {:<9} retention    : {}{}",
                arm.to_string(),
                retained.join(" "),
                if self.deterministic_dropout && self.has_dropout() {
                    " (deterministic)"
                } else {
                    ""
                }
            )?;
        }
        Ok(())
    }
}
