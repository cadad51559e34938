// analysis/power.rs

//! Analytical power for the treatment-by-time interaction.
//!
//! The standard error of the slope difference comes from the closed-form slope
//! variance when the design is balanced and complete, and from the GLS information
//! of the design's own variance structure on the expected layout otherwise. Power
//! is reported for a Wald z test and for a noncentral t test whose degrees of
//! freedom come from the closed form, a Welch combination of the arm variances
//! (partially nested designs), or the Satterthwaite engine.

use crate::design::formula::{FixedTerm, Formula, FormulaError};
use crate::design::params::{ParamError, StudyParameters};
use crate::design::structure::{StructureError, VarianceStructure, expected_layout};
use crate::design::study::{Arm, DesignLevel, StudyDesign};
use crate::satterthwaite::{self, DfError};
use log::{debug, warn};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use statrs::function::beta::beta_reg;
use statrs::function::gamma::ln_gamma;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PowerError {
    #[error("Variance structure could not be built: {0}")]
    Structure(#[from] StructureError),
    #[error("Degrees of freedom failed: {0}")]
    Df(#[from] DfError),
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error("Significance level must lie in (0, 1), found {0}")]
    InvalidAlpha(f64),
    #[error("Closed-form degrees of freedom are not defined for this design: {0}")]
    ClosedFormUnavailable(String),
    #[error("Distribution error: {0}")]
    Distribution(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DfMethod {
    /// Closed form where it is exact, Satterthwaite otherwise.
    #[default]
    Auto,
    ClosedForm,
    Satterthwaite,
}

/// Where the reported degrees of freedom came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DfSource {
    ClosedForm,
    Welch,
    Satterthwaite,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerOptions {
    pub alpha: f64,
    pub df_method: DfMethod,
}

impl Default for PowerOptions {
    fn default() -> Self {
        PowerOptions {
            alpha: 0.05,
            df_method: DfMethod::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerResult {
    pub design: String,
    pub se: f64,
    pub slope_difference: f64,
    pub effect_at_end: f64,
    pub ncp: f64,
    pub df: Option<f64>,
    pub df_source: Option<DfSource>,
    pub df_warning: Option<String>,
    pub alpha: f64,
    pub power_z: f64,
    pub power_t: Option<f64>,
}

impl fmt::Display for PowerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Power analysis: {}", self.design)?;
        writeln!(f, "  effect at T_end    : {:.4}", self.effect_at_end)?;
        writeln!(f, "  slope difference   : {:.5}", self.slope_difference)?;
        writeln!(f, "  standard error     : {:.5}", self.se)?;
        writeln!(f, "  noncentrality      : {:.4}", self.ncp)?;
        match (self.df, self.df_source) {
            (Some(df), Some(source)) => writeln!(f, "  df                 : {df:.2} ({source:?})")?,
            _ => writeln!(f, "  df                 : not available")?,
        }
        writeln!(f, "  power (Wald z)     : {:.4}", self.power_z)?;
        match self.power_t {
            Some(p) => writeln!(f, "  power (t)          : {p:.4}")?,
            None => writeln!(f, "  power (t)          : not available")?,
        }
        if let Some(w) = &self.df_warning {
            writeln!(f, "  warning            : {w}")?;
        }
        Ok(())
    }
}

// --- Slope variance ---

fn sum_of_squares(time: &[f64]) -> f64 {
    let mean = time.iter().sum::<f64>() / time.len() as f64;
    time.iter().map(|t| (t - mean).powi(2)).sum()
}

/// Variance contribution of one arm's slope estimate in a complete design with a
/// common cluster size. `None` when sizes differ within the arm.
pub fn arm_slope_variance(design: &StudyDesign, arm: Arm) -> Option<f64> {
    let sst = sum_of_squares(&design.time_points());
    let subject_part = design.subject.sd_slope.powi(2) + design.sigma_error.powi(2) / sst;
    if design.arm_has_cluster_effect(arm) {
        let n2 = satterthwaite::common_expected_size(design, arm)? as f64;
        let n3 = design.clusters.get(arm).n_clusters() as f64;
        Some((design.cluster.sd_slope.powi(2) + subject_part / n2) / n3)
    } else {
        Some(subject_part / design.total_subjects(arm) as f64)
    }
}

/// Closed-form variance of the slope difference, if the design is complete and
/// balanced within each clustered arm.
pub fn closed_form_slope_variance(design: &StudyDesign) -> Option<f64> {
    if design.has_dropout() {
        return None;
    }
    Some(arm_slope_variance(design, Arm::Control)? + arm_slope_variance(design, Arm::Treatment)?)
}

/// Structure, fixed-effects matrix and `time:treatment` contrast on the expected
/// layout of a design.
fn expected_problem(
    design: &StudyDesign,
) -> Result<(VarianceStructure, Array2<f64>, Array1<f64>), PowerError> {
    let structure = VarianceStructure::build(design, &expected_layout(design))?;
    let formula = Formula::full(design.level() != DesignLevel::TwoLevel);
    let x = formula.design_matrix(structure.rows());
    let contrast = formula.contrast(FixedTerm::TimeTreatment)?;
    Ok((structure, x, contrast))
}

/// Variance of the slope difference from the design's variance structure on the
/// expected layout.
pub fn matrix_slope_variance(design: &StudyDesign) -> Result<f64, PowerError> {
    let (structure, x, contrast) = expected_problem(design)?;
    Ok(satterthwaite::contrast_variance(
        &structure,
        &x,
        &contrast,
        &structure.params(),
    )?)
}

/// Welch combination of the two arm variances for partially nested designs, with
/// `n3 - 1` df for the clustered arm and `N - 1` for the unclustered one.
pub fn welch_df(design: &StudyDesign) -> Option<f64> {
    let a = arm_slope_variance(design, Arm::Treatment)?;
    let b = arm_slope_variance(design, Arm::Control)?;
    let df_a = design.clusters.treatment.n_clusters() as f64 - 1.0;
    let df_b = design.total_subjects(Arm::Control) as f64 - 1.0;
    if df_a < 1.0 || df_b < 1.0 {
        return None;
    }
    let df = (a + b).powi(2) / (a * a / df_a + b * b / df_b);
    df.is_finite().then_some(df.max(1.0))
}

fn numerical_df(design: &StudyDesign) -> Result<f64, PowerError> {
    let (structure, x, contrast) = expected_problem(design)?;
    Ok(satterthwaite::satterthwaite_df(&structure, &x, &contrast)?.df)
}

fn resolve_df(
    design: &StudyDesign,
    method: DfMethod,
) -> Result<(Option<f64>, Option<DfSource>, Option<String>), PowerError> {
    match method {
        DfMethod::ClosedForm => {
            if let Some(df) = satterthwaite::closed_form_df(design) {
                return Ok((Some(df), Some(DfSource::ClosedForm), None));
            }
            if design.level() == DesignLevel::PartiallyNested {
                if let Some(df) = welch_df(design) {
                    return Ok((Some(df), Some(DfSource::Welch), None));
                }
            }
            Err(PowerError::ClosedFormUnavailable(design.label()))
        }
        DfMethod::Satterthwaite => Ok((Some(numerical_df(design)?), Some(DfSource::Satterthwaite), None)),
        DfMethod::Auto => {
            if let Some(df) = satterthwaite::closed_form_df(design) {
                return Ok((Some(df), Some(DfSource::ClosedForm), None));
            }
            match numerical_df(design) {
                Ok(df) => Ok((Some(df), Some(DfSource::Satterthwaite), None)),
                Err(err) => {
                    warn!("Satterthwaite df failed for {}: {err}", design.label());
                    Ok((None, None, Some(err.to_string())))
                }
            }
        }
    }
}

fn standard_normal() -> Result<Normal, PowerError> {
    Normal::new(0.0, 1.0).map_err(|e| PowerError::Distribution(e.to_string()))
}

/// Two-sided Wald z power.
pub fn power_z(ncp: f64, alpha: f64) -> Result<f64, PowerError> {
    let normal = standard_normal()?;
    let crit = normal.inverse_cdf(1.0 - alpha / 2.0);
    Ok(normal.cdf(-crit + ncp) + normal.cdf(-crit - ncp))
}

/// Two-sided power of a t test with noncentrality `ncp`.
pub fn power_t(ncp: f64, df: f64, alpha: f64) -> Result<f64, PowerError> {
    let central =
        StudentsT::new(0.0, 1.0, df).map_err(|e| PowerError::Distribution(e.to_string()))?;
    let crit = central.inverse_cdf(1.0 - alpha / 2.0);
    let upper = 1.0 - noncentral_t_cdf(crit, df, ncp)?;
    let lower = noncentral_t_cdf(-crit, df, ncp)?;
    Ok((upper + lower).clamp(0.0, 1.0))
}

/// CDF of the noncentral t distribution (Lenth's AS 243 series).
pub fn noncentral_t_cdf(t: f64, df: f64, delta: f64) -> Result<f64, PowerError> {
    if !(df > 0.0) || !t.is_finite() || !delta.is_finite() {
        return Err(PowerError::Distribution(format!(
            "noncentral t needs finite t, delta and positive df (t={t}, df={df}, delta={delta})"
        )));
    }
    let normal = standard_normal()?;
    if delta == 0.0 {
        let central =
            StudentsT::new(0.0, 1.0, df).map_err(|e| PowerError::Distribution(e.to_string()))?;
        return Ok(central.cdf(t));
    }
    let (tt, del, negdel) = if t >= 0.0 {
        (t, delta, false)
    } else {
        (-t, -delta, true)
    };

    // Far tails and huge df: normal approximation.
    if df > 4e5 || del * del > 2.0 * std::f64::consts::LN_2 * 1021.0 {
        let s = 1.0 / (4.0 * df);
        let z = (tt * (1.0 - s) - del) / (1.0 + tt * tt * 2.0 * s).sqrt();
        let lower = normal.cdf(z);
        return Ok(if negdel { 1.0 - lower } else { lower });
    }

    let x = tt * tt / (tt * tt + df);
    let mut tnc = 0.0;
    if x > 0.0 {
        let lambda = del * del;
        let mut p = 0.5 * (-0.5 * lambda).exp();
        let mut q = (2.0 / std::f64::consts::PI).sqrt() * p * del;
        let mut s = 0.5 - p;
        if s < 1e-7 {
            s = -0.5 * (-0.5 * lambda).exp_m1();
        }
        let mut a = 0.5;
        let b = 0.5 * df;
        let rxb = (1.0 - x).powf(b);
        let albeta = 0.5 * std::f64::consts::PI.ln() + ln_gamma(b) - ln_gamma(0.5 + b);
        let mut xodd = beta_reg(a, b, x);
        let mut godd = 2.0 * rxb * (a * x.ln() - albeta).exp();
        let bx = b * x;
        let mut xeven = if bx < f64::EPSILON { bx } else { 1.0 - rxb };
        let mut geven = bx * rxb;
        tnc = p * xodd + q * xeven;
        for it in 1..=1000 {
            a += 1.0;
            xodd -= godd;
            xeven -= geven;
            godd *= x * (a + b - 1.0) / a;
            geven *= x * (a + b - 0.5) / (a + 0.5);
            p *= lambda / (2.0 * it as f64);
            q *= lambda / (2.0 * it as f64 + 1.0);
            tnc += p * xodd + q * xeven;
            s -= p;
            if s < -1e-10 || (s <= 0.0 && it > 1) {
                break;
            }
            let errbd = 2.0 * s * (xodd - godd);
            if errbd.abs() < 1e-12 {
                break;
            }
        }
    }
    tnc += normal.cdf(-del);
    let tnc = tnc.min(1.0);
    Ok(if negdel { 1.0 - tnc } else { tnc }.clamp(0.0, 1.0))
}

/// Analytical power of the treatment-by-time test for one design.
pub fn get_power(design: &StudyDesign, options: &PowerOptions) -> Result<PowerResult, PowerError> {
    if !(options.alpha > 0.0 && options.alpha < 1.0) {
        return Err(PowerError::InvalidAlpha(options.alpha));
    }
    let variance = match closed_form_slope_variance(design) {
        Some(v) => v,
        None => matrix_slope_variance(design)?,
    };
    let se = variance.sqrt();
    let slope_difference = design.slope_difference();
    let ncp = slope_difference / se;
    let (df, df_source, df_warning) = resolve_df(design, options.df_method)?;
    let power_t = match df {
        Some(df) => Some(power_t(ncp, df, options.alpha)?),
        None => None,
    };
    let power_z = power_z(ncp, options.alpha)?;
    debug!(
        "Power for {}: se={se:.5}, ncp={ncp:.4}, df={df:?}, power_z={power_z:.4}",
        design.label()
    );
    Ok(PowerResult {
        design: design.label(),
        se,
        slope_difference,
        effect_at_end: design.effect_at_end(),
        ncp,
        df,
        df_source,
        df_warning,
        alpha: options.alpha,
        power_z,
        power_t,
    })
}

/// Power for every design of a parameter grid, in grid order.
pub fn get_power_grid(
    params: &StudyParameters,
    options: &PowerOptions,
) -> Result<Vec<PowerResult>, PowerError> {
    params
        .designs()?
        .map(|design| get_power(&design?, options))
        .collect()
}

// --- Monte Carlo precision ---

/// Half-width of the 95% interval of a simulated power estimate.
pub fn monte_carlo_se(power: f64, nsim: usize) -> f64 {
    1.96 * (power * (1.0 - power) / nsim as f64).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct McseRow {
    pub nsim: usize,
    pub half_width: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Precision of a simulated power estimate for several replication counts.
pub fn monte_carlo_table(power: f64, nsims: &[usize]) -> Vec<McseRow> {
    nsims
        .iter()
        .map(|&nsim| {
            let half_width = monte_carlo_se(power, nsim);
            McseRow {
                nsim,
                half_width,
                lower: (power - half_width).max(0.0),
                upper: (power + half_width).min(1.0),
            }
        })
        .collect()
}
