// simulate/fit.rs

//! The model-fit collaborator.
//!
//! The simulation engine never estimates a mixed model itself. It hands each
//! (transformed) dataset and formula to a `ModelFitter` and records what comes
//! back: fixed effects, their covariance, the REML log-likelihood and the fitted
//! variance components. `KnownVarianceFitter` is the reference collaborator: it
//! evaluates the GLS fit at the generating variance components, projected onto the
//! formula's random-effects structure, without any optimisation.

use crate::design::formula::{Formula, FormulaError};
use crate::design::structure::{
    GroupLevel, LayoutRow, StructureError, ThetaBlock, VarianceComponents, VarianceStructure,
};
use crate::design::study::{LevelVariance, StudyDesign};
use crate::linalg::{FaerCholesky, LinalgError};
use crate::simulate::data::RealizedDataset;
use faer::Side;
use ndarray::{Array1, Array2, Axis};
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Model fit failed: {0}")]
    Failed(String),
    #[error("Model has more fixed effects ({p}) than observations ({n})")]
    TooFewObservations { n: usize, p: usize },
    #[error(transparent)]
    Structure(#[from] StructureError),
    #[error(transparent)]
    Linalg(#[from] LinalgError),
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

/// Everything a collaborator may use to fit one model to one dataset.
#[derive(Debug, Clone, Copy)]
pub struct FitRequest<'a> {
    pub model: &'a str,
    pub formula: &'a Formula,
    pub data: &'a RealizedDataset,
    /// The generating design. Real estimators ignore it.
    pub design: &'a StudyDesign,
    pub replication: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitOutput {
    pub coefficient_names: Vec<String>,
    pub beta: Array1<f64>,
    pub vcov: Array2<f64>,
    pub loglik: f64,
    /// Fitted components for the formula's random structure; levels the formula
    /// does not carry are zero.
    pub variance_components: VarianceComponents,
    pub converged: bool,
    pub warnings: Vec<String>,
}

pub trait ModelFitter: Send + Sync {
    fn fit(&self, request: &FitRequest<'_>) -> Result<FitOutput, FitError>;
}

impl<F> ModelFitter for F
where
    F: Fn(&FitRequest<'_>) -> Result<FitOutput, FitError> + Send + Sync,
{
    fn fit(&self, request: &FitRequest<'_>) -> Result<FitOutput, FitError> {
        self(request)
    }
}

/// GLS at the generating variance components.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnownVarianceFitter;

/// Variance of one observation implied by `components` at time `t`.
fn row_variance(components: &VarianceComponents, row: &LayoutRow, cluster_counts: bool) -> f64 {
    let mut var = components.subject.covariance_between(row.time, row.time);
    if cluster_counts && row.cluster.is_some() {
        var += components.cluster.covariance_between(row.time, row.time);
    }
    var + components.sigma_error.powi(2)
}

impl KnownVarianceFitter {
    /// The generating components seen through `formula`'s random structure. Variance
    /// the formula cannot represent is added to the residual, matched on the mean
    /// marginal variance of the observed rows.
    pub fn projected_components(
        formula: &Formula,
        design: &StudyDesign,
        layout: &[LayoutRow],
    ) -> Result<VarianceComponents, FitError> {
        let truth = VarianceComponents::from_design(design);
        let sigma = truth.sigma_error;
        let re = formula.re_structure();
        let mut projected = VarianceComponents {
            subject: LevelVariance::default(),
            cluster: LevelVariance::default(),
            sigma_error: sigma,
        };
        for (level, terms) in re.levels() {
            let fitted = ThetaBlock::project(terms, truth.level(level), sigma).level_variance(sigma);
            match level {
                GroupLevel::Subject => projected.subject = fitted,
                GroupLevel::Cluster => projected.cluster = fitted,
            }
        }

        let observed: Vec<&LayoutRow> = layout.iter().filter(|row| row.observed).collect();
        if observed.is_empty() {
            return Err(FitError::TooFewObservations { n: 0, p: formula.fixed_terms().len() });
        }
        let missing: f64 = observed
            .iter()
            .map(|row| {
                let true_var = design.covariance_between(row.arm, row.time, row.time)
                    + sigma * sigma;
                true_var - row_variance(&projected, row, re.cluster.is_some())
            })
            .sum::<f64>()
            / observed.len() as f64;
        let residual = sigma * sigma + missing;
        if !residual.is_finite() || residual <= 0.0 {
            return Err(FitError::Failed(format!(
                "folded residual variance is not positive ({residual})"
            )));
        }
        let residual_sd = residual.sqrt();
        projected.sigma_error = residual_sd;
        Ok(projected)
    }
}

impl ModelFitter for KnownVarianceFitter {
    fn fit(&self, request: &FitRequest<'_>) -> Result<FitOutput, FitError> {
        let layout = request.data.layout();
        let components = Self::projected_components(request.formula, request.design, &layout)?;
        let structure =
            VarianceStructure::for_model(&request.formula.re_structure(), &components, &layout)?;
        let x = request.formula.design_matrix(structure.rows());
        let y = request.data.observed_y();
        let (n, p) = x.dim();
        if n <= p {
            return Err(FitError::TooFewObservations { n, p });
        }

        let params = structure.params();
        let mut m = Array2::<f64>::zeros((p, p));
        let mut xwy = Array1::<f64>::zeros(p);
        let mut log_det_v = 0.0;
        let mut factors = Vec::with_capacity(structure.blocks().len());
        for (b, rows) in structure.blocks().iter().enumerate() {
            let chol = structure.marginal_block(b, &params)?.cholesky(Side::Lower)?;
            let xb = x.select(Axis(0), rows);
            let yb = y.select(Axis(0), rows);
            m = m + xb.t().dot(&chol.solve_mat(&xb)?);
            xwy = xwy + xb.t().dot(&chol.solve_vec(&yb)?);
            log_det_v += chol.log_det();
            factors.push(chol);
        }

        let m_chol = m.cholesky(Side::Lower)?;
        let beta = m_chol.solve_vec(&xwy)?;
        let vcov = m_chol.inverse()?;
        let fitted = x.dot(&beta);
        let mut quadratic = 0.0;
        for (rows, chol) in structure.blocks().iter().zip(&factors) {
            let residual = &y.select(Axis(0), rows) - &fitted.select(Axis(0), rows);
            quadratic += residual.dot(&chol.solve_vec(&residual)?);
        }
        let loglik = -0.5
            * ((n - p) as f64 * (2.0 * PI).ln() + log_det_v + m_chol.log_det() + quadratic);

        Ok(FitOutput {
            coefficient_names: request.formula.coefficient_names(),
            beta,
            vcov,
            loglik,
            variance_components: components,
            converged: true,
            warnings: Vec::new(),
        })
    }
}
