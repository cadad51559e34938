// design/params.rs

//! User-facing study parameters and the design grid.
//!
//! `StudyParameters` mirrors the named options of a study file. Every option that
//! can vary across a power analysis accepts either a scalar or a list; the design
//! grid is the cartesian product of all list-valued options, expanded lazily so
//! that only one concrete `StudyDesign` exists at a time.

use crate::design::dropout::Dropout;
use crate::design::study::{
    ClusterSizes, DesignError, EffectSize, LevelVariance, PerArm, StudyDesign,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParamError {
    #[error("Failed to read study file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML study file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Options '{0}' and '{1}' are mutually exclusive")]
    Conflict(&'static str, &'static str),
    #[error("Option '{needs}' requires '{requires}'")]
    Requires {
        needs: &'static str,
        requires: &'static str,
    },
    #[error("Invalid ICC parameterisation: {0}")]
    InvalidIcc(String),
    #[error("Option '{0}' must not be an empty list")]
    EmptyAxis(&'static str),
    #[error("Expected a single design but the parameters describe {0}")]
    NotSingle(usize),
    #[error(transparent)]
    Design(#[from] DesignError),
}

/// A scalar option or a list of values to expand over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Grid<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> Grid<T> {
    pub fn many(values: Vec<T>) -> Self {
        Grid::Many(values)
    }

    pub fn len(&self) -> usize {
        match self {
            Grid::One(_) => 1,
            Grid::Many(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn at(&self, idx: usize) -> T {
        match self {
            Grid::One(value) => value.clone(),
            Grid::Many(values) => values[idx].clone(),
        }
    }
}

impl<T> From<T> for Grid<T> {
    fn from(value: T) -> Self {
        Grid::One(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudyParameters {
    pub n1: Grid<usize>,
    pub n2: Grid<usize>,
    pub n3: Grid<usize>,
    #[serde(alias = "T_end")]
    pub t_end: Option<Grid<f64>>,
    pub fixed_intercept: f64,
    pub fixed_slope: f64,
    pub sigma_subject_intercept: Option<Grid<f64>>,
    pub sigma_subject_slope: Option<Grid<f64>>,
    pub sigma_cluster_intercept: Option<Grid<f64>>,
    pub sigma_cluster_slope: Option<Grid<f64>>,
    pub sigma_error: Grid<f64>,
    pub cor_subject: Grid<f64>,
    pub cor_cluster: Grid<f64>,
    pub icc_pre_subject: Option<Grid<f64>>,
    pub icc_pre_cluster: Option<Grid<f64>>,
    pub icc_slope: Option<Grid<f64>>,
    pub var_ratio: Option<Grid<f64>>,
    pub effect_size: Option<Grid<f64>>,
    pub cohend: Option<Grid<f64>>,
    /// Weibull dropout proportion at `T_end`, both arms.
    pub dropout: Option<Grid<f64>>,
    /// Weibull shape of the dropout curve.
    pub dropout_rate: f64,
    /// Overrides `dropout` for the treatment arm.
    pub dropout_treatment: Option<Grid<f64>>,
    pub dropout_manual: Option<Vec<f64>>,
    pub deterministic_dropout: bool,
    pub partially_nested: bool,
    pub unequal_clusters: Option<Vec<usize>>,
    pub unequal_clusters_treatment: Option<Vec<usize>>,
    pub n2_treatment: Option<Grid<usize>>,
    pub n3_treatment: Option<Grid<usize>>,
    pub poisson_cluster_mean: Option<Grid<f64>>,
}

impl Default for StudyParameters {
    fn default() -> Self {
        StudyParameters {
            n1: Grid::One(11),
            n2: Grid::One(10),
            n3: Grid::One(1),
            t_end: None,
            fixed_intercept: 0.0,
            fixed_slope: 0.0,
            sigma_subject_intercept: None,
            sigma_subject_slope: None,
            sigma_cluster_intercept: None,
            sigma_cluster_slope: None,
            sigma_error: Grid::One(1.0),
            cor_subject: Grid::One(0.0),
            cor_cluster: Grid::One(0.0),
            icc_pre_subject: None,
            icc_pre_cluster: None,
            icc_slope: None,
            var_ratio: None,
            effect_size: None,
            cohend: None,
            dropout: None,
            dropout_rate: 1.0,
            dropout_treatment: None,
            dropout_manual: None,
            deterministic_dropout: true,
            partially_nested: false,
            unequal_clusters: None,
            unequal_clusters_treatment: None,
            n2_treatment: None,
            n3_treatment: None,
            poisson_cluster_mean: None,
        }
    }
}

/// One concrete value for every grid-able option.
struct Point {
    n1: usize,
    n2: usize,
    n3: usize,
    t_end: Option<f64>,
    sigma_subject_intercept: Option<f64>,
    sigma_subject_slope: Option<f64>,
    sigma_cluster_intercept: Option<f64>,
    sigma_cluster_slope: Option<f64>,
    sigma_error: f64,
    cor_subject: f64,
    cor_cluster: f64,
    icc_pre_subject: Option<f64>,
    icc_pre_cluster: Option<f64>,
    icc_slope: Option<f64>,
    var_ratio: Option<f64>,
    effect_size: Option<f64>,
    cohend: Option<f64>,
    dropout: Option<f64>,
    dropout_treatment: Option<f64>,
    n2_treatment: Option<usize>,
    n3_treatment: Option<usize>,
    poisson_cluster_mean: Option<f64>,
}

/// Walks the grid axes in declaration order.
struct Cursor<'a> {
    idx: &'a [usize],
    pos: usize,
}

impl Cursor<'_> {
    fn take<T: Clone>(&mut self, grid: &Grid<T>) -> T {
        let value = grid.at(self.idx[self.pos]);
        self.pos += 1;
        value
    }

    fn take_opt<T: Clone>(&mut self, grid: &Option<Grid<T>>) -> Option<T> {
        let value = grid.as_ref().map(|g| g.at(self.idx[self.pos]));
        self.pos += 1;
        value
    }
}

fn opt_len<T: Clone>(grid: &Option<Grid<T>>) -> usize {
    grid.as_ref().map_or(1, Grid::len)
}

impl StudyParameters {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParamError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ParamError> {
        Ok(toml::from_str(text)?)
    }

    /// Axis lengths, in the order `Cursor` consumes them.
    fn axis_lengths(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("n1", self.n1.len()),
            ("n2", self.n2.len()),
            ("n3", self.n3.len()),
            ("T_end", opt_len(&self.t_end)),
            ("sigma_subject_intercept", opt_len(&self.sigma_subject_intercept)),
            ("sigma_subject_slope", opt_len(&self.sigma_subject_slope)),
            ("sigma_cluster_intercept", opt_len(&self.sigma_cluster_intercept)),
            ("sigma_cluster_slope", opt_len(&self.sigma_cluster_slope)),
            ("sigma_error", self.sigma_error.len()),
            ("cor_subject", self.cor_subject.len()),
            ("cor_cluster", self.cor_cluster.len()),
            ("icc_pre_subject", opt_len(&self.icc_pre_subject)),
            ("icc_pre_cluster", opt_len(&self.icc_pre_cluster)),
            ("icc_slope", opt_len(&self.icc_slope)),
            ("var_ratio", opt_len(&self.var_ratio)),
            ("effect_size", opt_len(&self.effect_size)),
            ("cohend", opt_len(&self.cohend)),
            ("dropout", opt_len(&self.dropout)),
            ("dropout_treatment", opt_len(&self.dropout_treatment)),
            ("n2_treatment", opt_len(&self.n2_treatment)),
            ("n3_treatment", opt_len(&self.n3_treatment)),
            ("poisson_cluster_mean", opt_len(&self.poisson_cluster_mean)),
        ]
    }

    fn point(&self, idx: &[usize]) -> Point {
        let mut c = Cursor { idx, pos: 0 };
        Point {
            n1: c.take(&self.n1),
            n2: c.take(&self.n2),
            n3: c.take(&self.n3),
            t_end: c.take_opt(&self.t_end),
            sigma_subject_intercept: c.take_opt(&self.sigma_subject_intercept),
            sigma_subject_slope: c.take_opt(&self.sigma_subject_slope),
            sigma_cluster_intercept: c.take_opt(&self.sigma_cluster_intercept),
            sigma_cluster_slope: c.take_opt(&self.sigma_cluster_slope),
            sigma_error: c.take(&self.sigma_error),
            cor_subject: c.take(&self.cor_subject),
            cor_cluster: c.take(&self.cor_cluster),
            icc_pre_subject: c.take_opt(&self.icc_pre_subject),
            icc_pre_cluster: c.take_opt(&self.icc_pre_cluster),
            icc_slope: c.take_opt(&self.icc_slope),
            var_ratio: c.take_opt(&self.var_ratio),
            effect_size: c.take_opt(&self.effect_size),
            cohend: c.take_opt(&self.cohend),
            dropout: c.take_opt(&self.dropout),
            dropout_treatment: c.take_opt(&self.dropout_treatment),
            n2_treatment: c.take_opt(&self.n2_treatment),
            n3_treatment: c.take_opt(&self.n3_treatment),
            poisson_cluster_mean: c.take_opt(&self.poisson_cluster_mean),
        }
    }

    /// Checks option combinations that are invalid for every grid point.
    pub fn check(&self) -> Result<(), ParamError> {
        let exclusive = [
            (
                "sigma_subject_intercept",
                self.sigma_subject_intercept.is_some(),
                "icc_pre_subject",
                self.icc_pre_subject.is_some(),
            ),
            (
                "sigma_cluster_intercept",
                self.sigma_cluster_intercept.is_some(),
                "icc_pre_cluster",
                self.icc_pre_cluster.is_some(),
            ),
            (
                "sigma_subject_slope",
                self.sigma_subject_slope.is_some(),
                "var_ratio",
                self.var_ratio.is_some(),
            ),
            (
                "sigma_cluster_slope",
                self.sigma_cluster_slope.is_some(),
                "icc_slope",
                self.icc_slope.is_some(),
            ),
            (
                "effect_size",
                self.effect_size.is_some(),
                "cohend",
                self.cohend.is_some(),
            ),
            (
                "dropout",
                self.dropout.is_some(),
                "dropout_manual",
                self.dropout_manual.is_some(),
            ),
            (
                "unequal_clusters",
                self.unequal_clusters.is_some(),
                "poisson_cluster_mean",
                self.poisson_cluster_mean.is_some(),
            ),
        ];
        for (a, a_set, b, b_set) in exclusive {
            if a_set && b_set {
                return Err(ParamError::Conflict(a, b));
            }
        }
        if self.sigma_cluster_slope.is_some() && self.var_ratio.is_some() {
            return Err(ParamError::Conflict("sigma_cluster_slope", "var_ratio"));
        }
        if self.icc_slope.is_some()
            && self.var_ratio.is_none()
            && self.sigma_subject_slope.is_none()
        {
            return Err(ParamError::Requires {
                needs: "icc_slope",
                requires: "var_ratio or sigma_subject_slope",
            });
        }
        if self.dropout_treatment.is_some() && self.dropout.is_none() {
            return Err(ParamError::Requires {
                needs: "dropout_treatment",
                requires: "dropout",
            });
        }
        for (name, len) in self.axis_lengths() {
            if len == 0 {
                return Err(ParamError::EmptyAxis(name));
            }
        }
        Ok(())
    }

    /// Number of designs in the grid.
    pub fn grid_size(&self) -> usize {
        self.axis_lengths().iter().map(|(_, len)| len).product()
    }

    /// The single design these parameters describe.
    pub fn build(&self) -> Result<StudyDesign, ParamError> {
        self.check()?;
        let size = self.grid_size();
        if size != 1 {
            return Err(ParamError::NotSingle(size));
        }
        self.design_at(&vec![0; self.axis_lengths().len()])
    }

    /// Lazily expanded design grid.
    pub fn designs(&self) -> Result<DesignGrid<'_>, ParamError> {
        self.check()?;
        let indices = self
            .axis_lengths()
            .into_iter()
            .map(|(_, len)| 0..len)
            .multi_cartesian_product();
        Ok(DesignGrid {
            params: self,
            indices: Box::new(indices),
            remaining: self.grid_size(),
        })
    }

    fn design_at(&self, idx: &[usize]) -> Result<StudyDesign, ParamError> {
        let p = self.point(idx);
        let sigma2 = p.sigma_error * p.sigma_error;

        let (sd_u0, sd_v0) = intercept_sds(&p, sigma2)?;
        let (sd_u1, sd_v1) = slope_sds(&p, sigma2)?;

        let effect = match (p.effect_size, p.cohend) {
            (Some(raw), _) => EffectSize::Raw(raw),
            (None, Some(d)) => EffectSize::CohensD(d),
            (None, None) => EffectSize::Raw(0.0),
        };

        let control_sizes = match (&self.unequal_clusters, p.poisson_cluster_mean) {
            (Some(sizes), _) => ClusterSizes::Unequal {
                sizes: sizes.clone(),
            },
            (None, Some(mean)) => ClusterSizes::Poisson { mean, n3: p.n3 },
            (None, None) => ClusterSizes::Equal { n2: p.n2, n3: p.n3 },
        };
        let treatment_sizes = if let Some(sizes) = &self.unequal_clusters_treatment {
            ClusterSizes::Unequal {
                sizes: sizes.clone(),
            }
        } else if self.unequal_clusters.is_some() {
            control_sizes.clone()
        } else if let Some(mean) = p.poisson_cluster_mean {
            ClusterSizes::Poisson {
                mean,
                n3: p.n3_treatment.unwrap_or(p.n3),
            }
        } else {
            ClusterSizes::Equal {
                n2: p.n2_treatment.unwrap_or(p.n2),
                n3: p.n3_treatment.unwrap_or(p.n3),
            }
        };

        let dropout = match (&self.dropout_manual, p.dropout) {
            (Some(cumulative), _) => PerArm::same(Dropout::Manual {
                cumulative: cumulative.clone(),
            }),
            (None, Some(proportion)) => PerArm {
                control: Dropout::weibull(proportion, self.dropout_rate),
                treatment: Dropout::weibull(
                    p.dropout_treatment.unwrap_or(proportion),
                    self.dropout_rate,
                ),
            },
            (None, None) => PerArm::same(Dropout::None),
        };

        let design = StudyDesign {
            n1: p.n1,
            t_end: p.t_end.unwrap_or(p.n1.saturating_sub(1) as f64),
            clusters: PerArm {
                control: control_sizes,
                treatment: treatment_sizes,
            },
            fixed_intercept: self.fixed_intercept,
            fixed_slope: self.fixed_slope,
            subject: LevelVariance::new(sd_u0, sd_u1, p.cor_subject),
            cluster: LevelVariance::new(sd_v0, sd_v1, p.cor_cluster),
            sigma_error: p.sigma_error,
            effect,
            dropout,
            deterministic_dropout: self.deterministic_dropout,
            partially_nested: self.partially_nested,
        };
        Ok(design.validated()?)
    }
}

fn check_share(name: &str, value: f64) -> Result<(), ParamError> {
    if !value.is_finite() || !(0.0..1.0).contains(&value) {
        return Err(ParamError::InvalidIcc(format!(
            "{name} must lie in [0, 1), found {value}"
        )));
    }
    Ok(())
}

/// Subject and cluster intercept SDs from either raw SDs or baseline ICCs.
fn intercept_sds(p: &Point, sigma2: f64) -> Result<(f64, f64), ParamError> {
    match (p.icc_pre_subject, p.icc_pre_cluster) {
        (Some(icc_subject), icc_cluster) => {
            let icc_cluster = icc_cluster.unwrap_or(0.0);
            check_share("icc_pre_subject", icc_subject)?;
            check_share("icc_pre_cluster", icc_cluster)?;
            if icc_cluster > icc_subject {
                return Err(ParamError::InvalidIcc(format!(
                    "icc_pre_cluster ({icc_cluster}) cannot exceed icc_pre_subject ({icc_subject})"
                )));
            }
            let total = sigma2 / (1.0 - icc_subject);
            Ok((
                ((icc_subject - icc_cluster) * total).sqrt(),
                (icc_cluster * total).sqrt(),
            ))
        }
        (None, Some(icc_cluster)) => {
            check_share("icc_pre_cluster", icc_cluster)?;
            let sd_u0 = p.sigma_subject_intercept.unwrap_or(0.0);
            let v0 = icc_cluster * (sd_u0 * sd_u0 + sigma2) / (1.0 - icc_cluster);
            Ok((sd_u0, v0.sqrt()))
        }
        (None, None) => Ok((
            p.sigma_subject_intercept.unwrap_or(0.0),
            p.sigma_cluster_intercept.unwrap_or(0.0),
        )),
    }
}

/// Subject and cluster slope SDs from either raw SDs or `var_ratio`/`icc_slope`.
fn slope_sds(p: &Point, sigma2: f64) -> Result<(f64, f64), ParamError> {
    let icc = p.icc_slope.unwrap_or(0.0);
    if p.icc_slope.is_some() {
        check_share("icc_slope", icc)?;
    }
    match p.var_ratio {
        Some(ratio) => {
            if !ratio.is_finite() || ratio < 0.0 {
                return Err(ParamError::InvalidIcc(format!(
                    "var_ratio must be non-negative, found {ratio}"
                )));
            }
            let total = ratio * sigma2;
            Ok((((1.0 - icc) * total).sqrt(), (icc * total).sqrt()))
        }
        None => {
            let sd_u1 = p.sigma_subject_slope.unwrap_or(0.0);
            let sd_v1 = match p.icc_slope {
                Some(icc) => (icc * sd_u1 * sd_u1 / (1.0 - icc)).sqrt(),
                None => p.sigma_cluster_slope.unwrap_or(0.0),
            };
            Ok((sd_u1, sd_v1))
        }
    }
}

/// Iterator over the concrete designs of a parameter grid.
pub struct DesignGrid<'a> {
    params: &'a StudyParameters,
    indices: Box<dyn Iterator<Item = Vec<usize>> + 'a>,
    remaining: usize,
}

impl Iterator for DesignGrid<'_> {
    type Item = Result<StudyDesign, ParamError>;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.indices.next()?;
        self.remaining = self.remaining.saturating_sub(1);
        Some(self.params.design_at(&idx))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for DesignGrid<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::study::DesignLevel;
    use approx::assert_abs_diff_eq;

    fn icc_params() -> StudyParameters {
        StudyParameters {
            n1: 11.into(),
            n2: 10.into(),
            n3: 6.into(),
            sigma_error: 10.0.into(),
            icc_pre_subject: Some(0.5.into()),
            icc_pre_cluster: Some(0.1.into()),
            var_ratio: Some(0.03.into()),
            icc_slope: Some(0.05.into()),
            cor_subject: (-0.5).into(),
            cohend: Some((-0.8).into()),
            ..Default::default()
        }
    }

    #[test]
    fn icc_form_round_trips_through_raw_components() {
        let design = icc_params().build().unwrap();
        assert_abs_diff_eq!(design.icc_pre_subject(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(design.icc_pre_cluster(), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(design.icc_slope(), 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(design.var_ratio(), 0.03, epsilon = 1e-12);
        assert_eq!(design.level(), DesignLevel::ThreeLevel);

        let raw = StudyParameters {
            sigma_subject_intercept: Some(design.subject.sd_intercept.into()),
            sigma_cluster_intercept: Some(design.cluster.sd_intercept.into()),
            sigma_subject_slope: Some(design.subject.sd_slope.into()),
            sigma_cluster_slope: Some(design.cluster.sd_slope.into()),
            icc_pre_subject: None,
            icc_pre_cluster: None,
            var_ratio: None,
            icc_slope: None,
            ..icc_params()
        }
        .build()
        .unwrap();
        assert_abs_diff_eq!(raw.icc_pre_subject(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(raw.var_ratio(), 0.03, epsilon = 1e-12);
    }

    #[test]
    fn grid_expands_lazily_in_order() {
        let params = StudyParameters {
            n2: Grid::many(vec![5, 10, 20]),
            dropout: Some(Grid::many(vec![0.0, 0.3])),
            ..icc_params()
        };
        let grid = params.designs().unwrap();
        assert_eq!(grid.len(), 6);
        let designs: Vec<StudyDesign> = grid.map(Result::unwrap).collect();
        let n2: Vec<usize> = designs
            .iter()
            .map(|d| d.clusters.control.common_size().unwrap())
            .collect();
        assert_eq!(n2, vec![5, 5, 10, 10, 20, 20]);
        assert!(!designs[0].has_dropout());
        assert!(designs[1].has_dropout());
    }

    #[test]
    fn build_rejects_grids() {
        let params = StudyParameters {
            n1: Grid::many(vec![5, 11]),
            ..icc_params()
        };
        assert!(matches!(params.build(), Err(ParamError::NotSingle(2))));
    }

    #[test]
    fn conflicting_options_are_rejected() {
        let params = StudyParameters {
            effect_size: Some(1.0.into()),
            ..icc_params()
        };
        assert!(matches!(
            params.build(),
            Err(ParamError::Conflict("effect_size", "cohend"))
        ));
    }

    #[test]
    fn treatment_overrides_apply_to_the_treatment_arm() {
        let params = StudyParameters {
            n3_treatment: Some(3.into()),
            dropout: Some(0.2.into()),
            dropout_treatment: Some(0.4.into()),
            partially_nested: true,
            ..icc_params()
        };
        let design = params.build().unwrap();
        assert_eq!(design.clusters.treatment.n_clusters(), 3);
        assert_eq!(design.clusters.control.n_clusters(), 6);
        assert_eq!(design.dropout.treatment, Dropout::weibull(0.4, 1.0));
        assert_eq!(design.level(), DesignLevel::PartiallyNested);
    }

    #[test]
    fn study_files_parse_from_toml() {
        let text = r#"
            n1 = 11
            n2 = [10, 20]
            n3 = 6
            T_end = 10
            sigma_error = 10
            icc_pre_subject = 0.5
            icc_pre_cluster = 0
            var_ratio = 0.03
            icc_slope = 0.05
            cohend = -0.8
            dropout = 0.3
            partially_nested = true
            unequal_clusters_treatment = [2, 5, 10, 50]
        "#;
        let params = StudyParameters::from_toml_str(text).unwrap();
        assert_eq!(params.grid_size(), 2);
        let first = params.designs().unwrap().next().unwrap().unwrap();
        assert_eq!(first.n1, 11);
        assert_abs_diff_eq!(first.t_end, 10.0);
        assert_eq!(first.clusters.treatment.n_clusters(), 4);
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(StudyParameters::from_toml_str("n_one = 3").is_err());
    }
}
