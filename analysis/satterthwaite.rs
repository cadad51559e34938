// analysis/satterthwaite.rs

//! Satterthwaite denominator degrees of freedom for a fixed-effect contrast.
//!
//! With covariance parameters `p = (theta..., sigma)` and
//! `phi(p) = c' (X' V(p)^-1 X)^-1 c` the sampling variance of the contrast,
//!
//!   df = 2 phi^2 / (g' A g)
//!
//! where `g` is the gradient of `phi` (central finite differences) and `A` the
//! asymptotic covariance of `p`, taken as the inverse of the expected REML
//! information
//!
//!   I_ij = 1/2 tr(P V_i P V_j),   P = W - W X M^-1 X' W,   W = V^-1.
//!
//! `V_i` is assembled analytically from the structure's theta template. All sums run
//! over the independent blocks of `V`, so no dense n_obs x n_obs matrix is formed.

use crate::design::structure::{ReStructure, ReTerms, StructureError, VarianceStructure};
use crate::design::study::{Arm, DesignLevel, StudyDesign};
use crate::linalg::{self, FaerCholesky, LinalgError};
use faer::Side;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DfError {
    #[error("Degrees of freedom are not finite: {0}")]
    DfNotFinite(String),
    #[error("Dimension mismatch: {what} has {found} entries, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        found: usize,
        expected: usize,
    },
}

impl From<LinalgError> for DfError {
    fn from(err: LinalgError) -> Self {
        DfError::DfNotFinite(err.to_string())
    }
}

impl From<StructureError> for DfError {
    fn from(err: StructureError) -> Self {
        DfError::DfNotFinite(err.to_string())
    }
}

/// Result of the general numerical path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfEstimate {
    pub df: f64,
    pub phi: f64,
    pub variance_of_phi: f64,
    pub gradient: Vec<f64>,
}

fn check_dims(
    structure: &VarianceStructure,
    x: &Array2<f64>,
    contrast: Option<&Array1<f64>>,
) -> Result<(), DfError> {
    if x.nrows() != structure.n_obs() {
        return Err(DfError::DimensionMismatch {
            what: "design matrix rows",
            found: x.nrows(),
            expected: structure.n_obs(),
        });
    }
    if let Some(c) = contrast {
        if c.len() != x.ncols() {
            return Err(DfError::DimensionMismatch {
                what: "contrast",
                found: c.len(),
                expected: x.ncols(),
            });
        }
    }
    Ok(())
}

/// `M = sum_b X_b' V_b^-1 X_b` at `params`.
pub fn fixed_information(
    structure: &VarianceStructure,
    x: &Array2<f64>,
    params: &[f64],
) -> Result<Array2<f64>, DfError> {
    check_dims(structure, x, None)?;
    let p = x.ncols();
    let mut m = Array2::<f64>::zeros((p, p));
    for (b, rows) in structure.blocks().iter().enumerate() {
        let v = structure.marginal_block(b, params)?;
        let xb = x.select(Axis(0), rows);
        let wx = v.cholesky(Side::Lower)?.solve_mat(&xb)?;
        m = m + xb.t().dot(&wx);
    }
    Ok(m)
}

/// `phi(params) = c' M(params)^-1 c`.
pub fn contrast_variance(
    structure: &VarianceStructure,
    x: &Array2<f64>,
    contrast: &Array1<f64>,
    params: &[f64],
) -> Result<f64, DfError> {
    check_dims(structure, x, Some(contrast))?;
    let m = fixed_information(structure, x, params)?;
    let mc = m.cholesky(Side::Lower)?.solve_vec(contrast)?;
    let phi = contrast.dot(&mc);
    if !phi.is_finite() || phi <= 0.0 {
        return Err(DfError::DfNotFinite(format!(
            "contrast variance is {phi}"
        )));
    }
    Ok(phi)
}

/// Expected REML information of `(theta..., sigma)`.
pub fn information_matrix(
    structure: &VarianceStructure,
    x: &Array2<f64>,
    params: &[f64],
) -> Result<Array2<f64>, DfError> {
    check_dims(structure, x, None)?;
    let k = structure.n_params();
    let p = x.ncols();
    let mut m = Array2::<f64>::zeros((p, p));
    let mut traces = Array2::<f64>::zeros((k, k));
    let mut q: Vec<Array2<f64>> = vec![Array2::zeros((p, p)); k];
    // s[i][j] for j >= i
    let mut s: Vec<Vec<Array2<f64>>> = (0..k)
        .map(|i| vec![Array2::zeros((p, p)); k - i])
        .collect();

    for (b, rows) in structure.blocks().iter().enumerate() {
        let v = structure.marginal_block(b, params)?;
        let chol = v.cholesky(Side::Lower)?;
        let xb = x.select(Axis(0), rows);
        let wx = chol.solve_mat(&xb)?;
        let derivs = structure.marginal_derivatives(b, params)?;
        let wa = derivs
            .iter()
            .map(|a| chol.solve_mat(a))
            .collect::<Result<Vec<_>, _>>()?;
        // A_i W X and W A_i W X
        let awx: Vec<Array2<f64>> = derivs.iter().map(|a| a.dot(&wx)).collect();
        let wawx: Vec<Array2<f64>> = wa.iter().map(|w| w.dot(&wx)).collect();

        m = m + xb.t().dot(&wx);
        for i in 0..k {
            q[i] = &q[i] + &wx.t().dot(&awx[i]);
            for j in i..k {
                // tr(W A_i W A_j) = sum_ab (W A_i)_ab (W A_j)_ba
                let tr: f64 = wa[i]
                    .indexed_iter()
                    .map(|((r, c), value)| value * wa[j][(c, r)])
                    .sum();
                traces[(i, j)] += tr;
                s[i][j - i] = &s[i][j - i] + &wawx[i].t().dot(&awx[j]);
            }
        }
    }

    let m_inv = linalg::spd_inverse(&m)?;
    let mq: Vec<Array2<f64>> = q.iter().map(|qi| m_inv.dot(qi)).collect();
    let mut info = Array2::<f64>::zeros((k, k));
    for i in 0..k {
        for j in i..k {
            let correction = trace_of_product(&m_inv, &s[i][j - i]);
            let fixed = trace_of_product(&mq[i], &mq[j]);
            let value = 0.5 * (traces[(i, j)] - 2.0 * correction + fixed);
            info[(i, j)] = value;
            info[(j, i)] = value;
        }
    }
    Ok(info)
}

fn trace_of_product(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.indexed_iter()
        .map(|((r, c), value)| value * b[(c, r)])
        .sum()
}

/// Central differences with step `1e-4 * max(|p|, 0.01)`.
pub fn numerical_gradient(
    params: &[f64],
    f: impl Fn(&[f64]) -> Result<f64, DfError>,
) -> Result<Vec<f64>, DfError> {
    let mut gradient = Vec::with_capacity(params.len());
    let mut shifted = params.to_vec();
    for i in 0..params.len() {
        let h = 1e-4 * params[i].abs().max(0.01);
        shifted[i] = params[i] + h;
        let up = f(&shifted)?;
        shifted[i] = params[i] - h;
        let down = f(&shifted)?;
        shifted[i] = params[i];
        gradient.push((up - down) / (2.0 * h));
    }
    Ok(gradient)
}

/// `df = 2 phi^2 / (g' acov g)` with `g` the numerical gradient of `phi_fn` at
/// `params`. Floored at 1.
pub fn degrees_of_freedom(
    params: &[f64],
    acov: &Array2<f64>,
    phi_fn: impl Fn(&[f64]) -> Result<f64, DfError>,
) -> Result<DfEstimate, DfError> {
    if acov.nrows() != params.len() || acov.ncols() != params.len() {
        return Err(DfError::DimensionMismatch {
            what: "parameter covariance",
            found: acov.nrows(),
            expected: params.len(),
        });
    }
    let phi = phi_fn(params)?;
    let gradient = numerical_gradient(params, &phi_fn)?;
    let g = Array1::from(gradient.clone());
    let variance_of_phi = g.dot(&acov.dot(&g));
    if !variance_of_phi.is_finite() || variance_of_phi <= 0.0 {
        return Err(DfError::DfNotFinite(format!(
            "variance of the contrast variance is {variance_of_phi}"
        )));
    }
    let df = 2.0 * phi * phi / variance_of_phi;
    if !df.is_finite() {
        return Err(DfError::DfNotFinite(format!("df evaluated to {df}")));
    }
    Ok(DfEstimate {
        df: df.max(1.0),
        phi,
        variance_of_phi,
        gradient,
    })
}

/// General numerical path at the structure's own parameters.
pub fn satterthwaite_df(
    structure: &VarianceStructure,
    x: &Array2<f64>,
    contrast: &Array1<f64>,
) -> Result<DfEstimate, DfError> {
    check_dims(structure, x, Some(contrast))?;
    let params = structure.params();
    let info = information_matrix(structure, x, &params)?;
    let acov = linalg::spd_inverse(&info)?;
    degrees_of_freedom(&params, &acov, |p| {
        contrast_variance(structure, x, contrast, p)
    })
}

/// Exact df for designs whose treatment-by-time contrast is estimated from
/// independent, identically distributed units: subjects (two-level) or clusters
/// (fully nested three-level). Defined only without dropout, with full correlated
/// random structures, at least three time points and, for three-level designs,
/// one common cluster size.
pub fn closed_form_df(design: &StudyDesign) -> Option<f64> {
    if design.has_dropout() || design.n1 < 3 {
        return None;
    }
    let re = ReStructure::from_design(design);
    if re.subject != Some(ReTerms::Correlated) {
        return None;
    }
    let df = match design.level() {
        DesignLevel::TwoLevel => {
            let subjects: usize = Arm::BOTH.iter().map(|&arm| design.total_subjects(arm)).sum();
            subjects as f64 - 2.0
        }
        DesignLevel::ThreeLevel => {
            if re.cluster != Some(ReTerms::Correlated) {
                return None;
            }
            let control = common_expected_size(design, Arm::Control)?;
            let treatment = common_expected_size(design, Arm::Treatment)?;
            if control != treatment {
                return None;
            }
            let clusters: usize = Arm::BOTH
                .iter()
                .map(|&arm| design.clusters.get(arm).n_clusters())
                .sum();
            clusters as f64 - 2.0
        }
        DesignLevel::PartiallyNested => return None,
    };
    (df >= 1.0).then_some(df)
}

/// The common analytical cluster size of an arm, if all clusters share one.
pub fn common_expected_size(design: &StudyDesign, arm: Arm) -> Option<usize> {
    let sizes = design.clusters.get(arm).expected_sizes();
    let first = *sizes.first()?;
    sizes.iter().all(|&s| s == first).then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::dropout::Dropout;
    use crate::design::formula::{FixedTerm, Formula};
    use crate::design::structure::expected_layout;
    use crate::design::study::{ClusterSizes, EffectSize, LevelVariance, PerArm};
    use approx::assert_abs_diff_eq;

    fn design(level: DesignLevel) -> StudyDesign {
        let (clusters, cluster) = match level {
            DesignLevel::TwoLevel => (
                PerArm::same(ClusterSizes::Equal { n2: 12, n3: 1 }),
                LevelVariance::default(),
            ),
            _ => (
                PerArm::same(ClusterSizes::Equal { n2: 4, n3: 5 }),
                LevelVariance::new(0.9, 0.25, 0.3),
            ),
        };
        StudyDesign {
            n1: 5,
            t_end: 4.0,
            clusters,
            fixed_intercept: 0.0,
            fixed_slope: 0.0,
            subject: LevelVariance::new(1.5, 0.4, -0.3),
            cluster,
            sigma_error: 2.0,
            effect: EffectSize::Raw(1.0),
            dropout: PerArm::same(Dropout::None),
            deterministic_dropout: true,
            partially_nested: level == DesignLevel::PartiallyNested,
        }
        .validated()
        .unwrap()
    }

    fn numerical_df(design: &StudyDesign) -> DfEstimate {
        let structure = VarianceStructure::build(design, &expected_layout(design)).unwrap();
        let formula = Formula::full(design.level() != DesignLevel::TwoLevel);
        let x = formula.design_matrix(structure.rows());
        let c = formula.contrast(FixedTerm::TimeTreatment).unwrap();
        satterthwaite_df(&structure, &x, &c).unwrap()
    }

    #[test]
    fn two_level_numerical_df_matches_closed_form() {
        let d = design(DesignLevel::TwoLevel);
        let closed = closed_form_df(&d).unwrap();
        assert_abs_diff_eq!(closed, 22.0);
        assert_abs_diff_eq!(numerical_df(&d).df, closed, epsilon = 1e-6);
    }

    #[test]
    fn fully_nested_numerical_df_matches_closed_form() {
        let d = design(DesignLevel::ThreeLevel);
        let closed = closed_form_df(&d).unwrap();
        assert_abs_diff_eq!(closed, 8.0);
        assert_abs_diff_eq!(numerical_df(&d).df, closed, epsilon = 1e-6);
    }

    #[test]
    fn closed_form_is_undefined_with_dropout_or_partial_nesting() {
        let d = design(DesignLevel::ThreeLevel);
        let with_dropout = d
            .update(|d| d.dropout = PerArm::same(Dropout::weibull(0.3, 1.0)))
            .unwrap();
        assert_eq!(closed_form_df(&with_dropout), None);
        assert_eq!(closed_form_df(&design(DesignLevel::PartiallyNested)), None);
    }

    #[test]
    fn partially_nested_with_dropout_gives_finite_df() {
        let d = design(DesignLevel::PartiallyNested)
            .update(|d| d.dropout = PerArm::same(Dropout::weibull(0.3, 1.0)))
            .unwrap();
        let estimate = numerical_df(&d);
        assert!(estimate.df.is_finite());
        assert!(estimate.df >= 1.0);
        assert!(estimate.phi > 0.0);
    }

    #[test]
    fn phi_scales_with_sigma_squared() {
        let d = design(DesignLevel::ThreeLevel);
        let estimate = numerical_df(&d);
        let sigma = 2.0;
        let last = *estimate.gradient.last().unwrap();
        assert_abs_diff_eq!(last, 2.0 * estimate.phi / sigma, epsilon = 1e-8);
    }

    #[test]
    fn general_formula_accepts_any_phi_function() {
        let params = [2.0, 3.0];
        let acov = Array2::from_diag(&Array1::from(vec![0.1, 0.2]));
        let estimate = degrees_of_freedom(&params, &acov, |p| Ok(p[0] * p[0] + p[1])).unwrap();
        let g = [4.0, 1.0];
        let var = 0.1 * g[0] * g[0] + 0.2 * g[1] * g[1];
        assert_abs_diff_eq!(estimate.phi, 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(estimate.df, 2.0 * 49.0 / var, epsilon = 1e-6);
    }

    #[test]
    fn singular_information_is_df_not_finite() {
        let params = [1.0];
        let acov = Array2::zeros((1, 1));
        let result = degrees_of_freedom(&params, &acov, |p| Ok(p[0]));
        assert!(matches!(result, Err(DfError::DfNotFinite(_))));
    }

    #[test]
    fn mismatched_contrast_is_rejected() {
        let d = design(DesignLevel::TwoLevel);
        let structure = VarianceStructure::build(&d, &expected_layout(&d)).unwrap();
        let x = Formula::full(false).design_matrix(structure.rows());
        let c = Array1::from(vec![0.0, 1.0]);
        assert!(matches!(
            satterthwaite_df(&structure, &x, &c),
            Err(DfError::DimensionMismatch { .. })
        ));
    }
}
