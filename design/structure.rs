// design/structure.rs

//! Random-effects structure of a realized (post-dropout) layout.
//!
//! For every grouping factor the builder records which group each observed row
//! belongs to and that row's model-matrix values. The covariance parameters are
//! held as one `ThetaBlock` per factor, relative to the residual SD and packed as
//! the lower-triangular Cholesky factor of the level's covariance matrix. From these
//! the lme4-style `Lind`, `Lambda` and `Zt` can be materialised, and the marginal
//! covariance
//!
//!   V = sigma^2 (I + Z Lambda Lambda' Z')
//!
//! is assembled block by block: rows that share a cluster (or, without a cluster
//! factor, a subject) form one independent block.

use crate::design::dropout;
use crate::design::study::{Arm, DesignLevel, LevelVariance, StudyDesign};
use crate::linalg::{self, LinalgError};
use ndarray::{Array2, s};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StructureError {
    #[error("Invalid design: {0}")]
    InvalidDesign(String),
    #[error("No observed rows for the required {level} grouping factor")]
    EmptyGroup { level: GroupLevel },
    #[error("Linear algebra failure while assembling the covariance: {0}")]
    Linalg(#[from] LinalgError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLevel {
    Subject,
    Cluster,
}

impl fmt::Display for GroupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupLevel::Subject => write!(f, "subject"),
            GroupLevel::Cluster => write!(f, "cluster"),
        }
    }
}

// --- Layout ---

/// One (subject, time) cell of a realized dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutRow {
    pub subject: usize,
    /// `None` for subjects of an unclustered arm.
    pub cluster: Option<usize>,
    pub arm: Arm,
    pub time_index: usize,
    pub time: f64,
    pub observed: bool,
}

/// The layout the analytical engine works on: expected cluster sizes with the
/// expected dropout pattern applied to each cluster (to the whole arm when the arm
/// is unclustered).
pub fn expected_layout(design: &StudyDesign) -> Vec<LayoutRow> {
    let time = design.time_points();
    let mut rows = Vec::new();
    let mut subject = 0usize;
    let mut next_cluster = 0usize;
    for arm in Arm::BOTH {
        let cumulative = design.dropout_curve(arm);
        let sizes = design.clusters.get(arm).expected_sizes();
        let groups: Vec<(Option<usize>, usize)> = if design.arm_is_clustered(arm) {
            sizes
                .iter()
                .map(|&m| {
                    let id = next_cluster;
                    next_cluster += 1;
                    (Some(id), m)
                })
                .collect()
        } else {
            vec![(None, sizes.iter().sum())]
        };
        for (cluster, m) in groups {
            let observed = dropout::expected_observed_counts(m, &cumulative);
            for s in 0..m {
                for (k, &t) in time.iter().enumerate() {
                    rows.push(LayoutRow {
                        subject,
                        cluster,
                        arm,
                        time_index: k,
                        time: t,
                        observed: s < observed[k],
                    });
                }
                subject += 1;
            }
        }
    }
    rows
}

// --- Random-effects terms ---

/// Which random terms a grouping factor carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReTerms {
    /// `(1 | g)`
    Intercept,
    /// `(0 + time | g)`
    Slope,
    /// `(1 + time || g)`
    Uncorrelated,
    /// `(1 + time | g)`
    Correlated,
}

impl ReTerms {
    /// The terms needed to represent a level's variance exactly. Zero-variance
    /// components are dropped; a level with no variance at all is absent.
    pub fn for_level(level: &LevelVariance) -> Option<ReTerms> {
        match (level.sd_intercept > 0.0, level.sd_slope > 0.0) {
            (true, true) => Some(ReTerms::Correlated),
            (true, false) => Some(ReTerms::Intercept),
            (false, true) => Some(ReTerms::Slope),
            (false, false) => None,
        }
    }

    /// These terms without the ones whose fitted variance is zero.
    pub fn restrict(self, level: &LevelVariance) -> Option<ReTerms> {
        let present = ReTerms::for_level(level)?;
        match (self, present) {
            (ReTerms::Intercept, ReTerms::Slope) | (ReTerms::Slope, ReTerms::Intercept) => None,
            (ReTerms::Intercept | ReTerms::Slope, _) => Some(self),
            (_, ReTerms::Correlated) => Some(self),
            (_, collapsed) => Some(collapsed),
        }
    }

    pub fn n_terms(self) -> usize {
        match self {
            ReTerms::Intercept | ReTerms::Slope => 1,
            ReTerms::Uncorrelated | ReTerms::Correlated => 2,
        }
    }

    pub fn n_theta(self) -> usize {
        self.positions().len()
    }

    /// Positions of the theta entries in the relative factor, column-major.
    fn positions(self) -> &'static [(usize, usize)] {
        match self {
            ReTerms::Intercept | ReTerms::Slope => &[(0, 0)],
            ReTerms::Uncorrelated => &[(0, 0), (1, 1)],
            ReTerms::Correlated => &[(0, 0), (1, 0), (1, 1)],
        }
    }

    fn z_values(self, t: f64) -> [f64; 2] {
        match self {
            ReTerms::Intercept => [1.0, 0.0],
            ReTerms::Slope => [t, 0.0],
            ReTerms::Uncorrelated | ReTerms::Correlated => [1.0, t],
        }
    }
}

/// Random-effects part of a model: the terms carried by each grouping level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReStructure {
    pub subject: Option<ReTerms>,
    pub cluster: Option<ReTerms>,
}

impl ReStructure {
    /// The structure that represents the design's generating model.
    pub fn from_design(design: &StudyDesign) -> Self {
        ReStructure {
            subject: ReTerms::for_level(&design.subject),
            cluster: if design.level() == DesignLevel::TwoLevel {
                None
            } else {
                ReTerms::for_level(&design.cluster)
            },
        }
    }

    /// Drops random terms whose variance in `components` is zero. Such terms sit
    /// on the boundary of the parameter space and make the information singular.
    pub fn restrict(&self, components: &VarianceComponents) -> Self {
        ReStructure {
            subject: self.subject.and_then(|t| t.restrict(&components.subject)),
            cluster: self.cluster.and_then(|t| t.restrict(&components.cluster)),
        }
    }

    pub fn n_theta(&self) -> usize {
        self.levels().map(|(_, terms)| terms.n_theta()).sum()
    }

    /// Present levels in factor order: subject before cluster.
    pub fn levels(&self) -> impl Iterator<Item = (GroupLevel, ReTerms)> + '_ {
        [
            (GroupLevel::Subject, self.subject),
            (GroupLevel::Cluster, self.cluster),
        ]
        .into_iter()
        .filter_map(|(level, terms)| terms.map(|t| (level, t)))
    }
}

/// Relative Cholesky factor of one level's random-effects covariance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThetaBlock {
    Intercept { sd: f64 },
    Slope { sd: f64 },
    InterceptSlope { intercept: f64, slope: f64 },
    Correlated { l11: f64, l21: f64, l22: f64 },
}

impl ThetaBlock {
    pub fn terms(&self) -> ReTerms {
        match self {
            ThetaBlock::Intercept { .. } => ReTerms::Intercept,
            ThetaBlock::Slope { .. } => ReTerms::Slope,
            ThetaBlock::InterceptSlope { .. } => ReTerms::Uncorrelated,
            ThetaBlock::Correlated { .. } => ReTerms::Correlated,
        }
    }

    pub fn values(&self) -> Vec<f64> {
        match *self {
            ThetaBlock::Intercept { sd } | ThetaBlock::Slope { sd } => vec![sd],
            ThetaBlock::InterceptSlope { intercept, slope } => vec![intercept, slope],
            ThetaBlock::Correlated { l11, l21, l22 } => vec![l11, l21, l22],
        }
    }

    pub fn from_values(terms: ReTerms, values: &[f64]) -> Result<Self, StructureError> {
        if values.len() != terms.n_theta() {
            return Err(StructureError::InvalidDesign(format!(
                "{terms:?} terms need {} theta values, found {}",
                terms.n_theta(),
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(StructureError::InvalidDesign(format!(
                "theta must be finite, found {values:?}"
            )));
        }
        for (idx, &(row, col)) in terms.positions().iter().enumerate() {
            if row == col && values[idx] < 0.0 {
                return Err(StructureError::InvalidDesign(format!(
                    "diagonal theta entries must be non-negative, found {values:?}"
                )));
            }
        }
        Ok(match terms {
            ReTerms::Intercept => ThetaBlock::Intercept { sd: values[0] },
            ReTerms::Slope => ThetaBlock::Slope { sd: values[0] },
            ReTerms::Uncorrelated => ThetaBlock::InterceptSlope {
                intercept: values[0],
                slope: values[1],
            },
            ReTerms::Correlated => ThetaBlock::Correlated {
                l11: values[0],
                l21: values[1],
                l22: values[2],
            },
        })
    }

    /// Projects a level's variance onto `terms`, relative to `sigma`. Variance the
    /// terms cannot carry (a dropped slope, a dropped correlation) is discarded.
    pub fn project(terms: ReTerms, level: &LevelVariance, sigma: f64) -> Self {
        let sd0 = level.sd_intercept / sigma;
        let sd1 = level.sd_slope / sigma;
        match terms {
            ReTerms::Intercept => ThetaBlock::Intercept { sd: sd0 },
            ReTerms::Slope => ThetaBlock::Slope { sd: sd1 },
            ReTerms::Uncorrelated => ThetaBlock::InterceptSlope {
                intercept: sd0,
                slope: sd1,
            },
            ReTerms::Correlated => ThetaBlock::Correlated {
                l11: sd0,
                l21: level.cor * sd1,
                l22: sd1 * (1.0 - level.cor * level.cor).max(0.0).sqrt(),
            },
        }
    }

    /// Lower-triangular relative factor (q x q).
    pub fn factor(&self) -> Array2<f64> {
        factor_from(self.terms(), &self.values())
    }

    /// Back to standard deviations and correlation on the outcome scale.
    pub fn level_variance(&self, sigma: f64) -> LevelVariance {
        let relative = match *self {
            ThetaBlock::Intercept { sd } => LevelVariance::new(sd, 0.0, 0.0),
            ThetaBlock::Slope { sd } => LevelVariance::new(0.0, sd, 0.0),
            ThetaBlock::InterceptSlope { intercept, slope } => {
                LevelVariance::new(intercept, slope, 0.0)
            }
            ThetaBlock::Correlated { l11, l21, l22 } => {
                let sd0 = l11.abs();
                let sd1 = (l21 * l21 + l22 * l22).sqrt();
                let cor = if sd0 > 0.0 && sd1 > 0.0 {
                    (l11 * l21 / (sd0 * sd1)).clamp(-1.0, 1.0)
                } else {
                    0.0
                };
                LevelVariance::new(sd0, sd1, cor)
            }
        };
        LevelVariance::new(
            relative.sd_intercept * sigma,
            relative.sd_slope * sigma,
            relative.cor,
        )
    }
}

fn factor_from(terms: ReTerms, values: &[f64]) -> Array2<f64> {
    let q = terms.n_terms();
    let mut factor = Array2::zeros((q, q));
    for (&(row, col), &v) in terms.positions().iter().zip(values) {
        factor[(row, col)] = v;
    }
    factor
}

/// Variance components on the outcome scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponents {
    pub subject: LevelVariance,
    pub cluster: LevelVariance,
    pub sigma_error: f64,
}

impl VarianceComponents {
    pub fn from_design(design: &StudyDesign) -> Self {
        VarianceComponents {
            subject: design.subject,
            cluster: if design.level() == DesignLevel::TwoLevel {
                LevelVariance::default()
            } else {
                design.cluster
            },
            sigma_error: design.sigma_error,
        }
    }

    pub fn level(&self, level: GroupLevel) -> &LevelVariance {
        match level {
            GroupLevel::Subject => &self.subject,
            GroupLevel::Cluster => &self.cluster,
        }
    }
}

// --- Grouping factors ---

/// Group membership of the observed rows for one random-effects factor.
#[derive(Debug, Clone)]
pub struct GroupingFactor {
    level: GroupLevel,
    terms: ReTerms,
    groups: Vec<Option<usize>>,
    n_groups: usize,
    rows_per_group: Vec<usize>,
    z: Vec<[f64; 2]>,
}

impl GroupingFactor {
    fn new(level: GroupLevel, terms: ReTerms, rows: &[LayoutRow]) -> Result<Self, StructureError> {
        let keys: Vec<Option<usize>> = rows
            .iter()
            .map(|row| match level {
                GroupLevel::Subject => Some(row.subject),
                GroupLevel::Cluster => row.cluster,
            })
            .collect();
        let ids: BTreeSet<usize> = keys.iter().flatten().copied().collect();
        if ids.is_empty() {
            return Err(StructureError::EmptyGroup { level });
        }
        // Groups are numbered by sorted original id, like factor levels.
        let dense: BTreeMap<usize, usize> = ids
            .iter()
            .enumerate()
            .map(|(dense_id, &key)| (key, dense_id))
            .collect();
        let groups: Vec<Option<usize>> = keys
            .iter()
            .map(|key| key.and_then(|k| dense.get(&k).copied()))
            .collect();
        let mut rows_per_group = vec![0usize; dense.len()];
        for g in groups.iter().flatten() {
            rows_per_group[*g] += 1;
        }
        let z = rows.iter().map(|row| terms.z_values(row.time)).collect();
        Ok(GroupingFactor {
            level,
            terms,
            groups,
            n_groups: dense.len(),
            rows_per_group,
            z,
        })
    }

    pub fn level(&self) -> GroupLevel {
        self.level
    }

    pub fn terms(&self) -> ReTerms {
        self.terms
    }

    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    pub fn n_obs(&self) -> usize {
        self.groups.len()
    }

    pub fn rows_per_group(&self) -> &[usize] {
        &self.rows_per_group
    }

    /// Group of an observed row; `None` when the row has no incidence on this factor.
    pub fn group_of(&self, row: usize) -> Option<usize> {
        self.groups[row]
    }

    /// n_obs x n_groups 0/1 membership matrix.
    pub fn incidence(&self) -> Array2<f64> {
        let mut incidence = Array2::zeros((self.n_obs(), self.n_groups));
        for (row, group) in self.groups.iter().enumerate() {
            if let Some(g) = group {
                incidence[(row, *g)] = 1.0;
            }
        }
        incidence
    }

    /// n_obs x (n_groups * q) random-effects model matrix, group-major columns.
    pub fn z(&self) -> Array2<f64> {
        let q = self.terms.n_terms();
        let mut z = Array2::zeros((self.n_obs(), self.n_groups * q));
        for (row, group) in self.groups.iter().enumerate() {
            if let Some(g) = group {
                for term in 0..q {
                    z[(row, g * q + term)] = self.z[row][term];
                }
            }
        }
        z
    }
}

// --- The structure ---

#[derive(Debug, Clone)]
pub struct VarianceStructure {
    rows: Vec<LayoutRow>,
    factors: Vec<GroupingFactor>,
    theta: Vec<ThetaBlock>,
    sigma: f64,
    blocks: Vec<Vec<usize>>,
}

impl VarianceStructure {
    /// Structure of the design's generating model on `layout`.
    pub fn build(design: &StudyDesign, layout: &[LayoutRow]) -> Result<Self, StructureError> {
        Self::for_model(
            &ReStructure::from_design(design),
            &VarianceComponents::from_design(design),
            layout,
        )
    }

    /// Structure implied by a model's random-effects part, with covariance
    /// parameters projected from `components`.
    pub fn for_model(
        re: &ReStructure,
        components: &VarianceComponents,
        layout: &[LayoutRow],
    ) -> Result<Self, StructureError> {
        let sigma = components.sigma_error;
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(StructureError::InvalidDesign(format!(
                "residual SD must be positive and finite, found {sigma}"
            )));
        }
        for (level, _) in re.levels() {
            check_psd(level, components.level(level))?;
        }

        let rows: Vec<LayoutRow> = layout.iter().filter(|row| row.observed).copied().collect();
        if rows.is_empty() {
            return Err(StructureError::EmptyGroup {
                level: GroupLevel::Subject,
            });
        }

        let mut factors = Vec::new();
        let mut theta = Vec::new();
        for (level, terms) in re.levels() {
            factors.push(GroupingFactor::new(level, terms, &rows)?);
            theta.push(ThetaBlock::project(terms, components.level(level), sigma));
        }

        let cluster_factor = factors.iter().find(|f| f.level == GroupLevel::Cluster);
        let mut keyed: BTreeMap<(u8, usize), Vec<usize>> = BTreeMap::new();
        for (idx, row) in rows.iter().enumerate() {
            let key = match cluster_factor.and_then(|f| f.group_of(idx)) {
                Some(g) => (1, g),
                None => (0, row.subject),
            };
            keyed.entry(key).or_default().push(idx);
        }
        let blocks = keyed.into_values().collect();

        Ok(VarianceStructure {
            rows,
            factors,
            theta,
            sigma,
            blocks,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.rows.len()
    }

    /// The observed rows, in layout order.
    pub fn rows(&self) -> &[LayoutRow] {
        &self.rows
    }

    pub fn factors(&self) -> &[GroupingFactor] {
        &self.factors
    }

    pub fn factor(&self, level: GroupLevel) -> Option<&GroupingFactor> {
        self.factors.iter().find(|f| f.level == level)
    }

    pub fn theta_blocks(&self) -> &[ThetaBlock] {
        &self.theta
    }

    pub fn theta(&self) -> Vec<f64> {
        self.theta.iter().flat_map(|block| block.values()).collect()
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Covariance parameters `(theta..., sigma)`.
    pub fn params(&self) -> Vec<f64> {
        let mut params = self.theta();
        params.push(self.sigma);
        params
    }

    pub fn n_params(&self) -> usize {
        self.factors.iter().map(|f| f.terms.n_theta()).sum::<usize>() + 1
    }

    /// Row indices of the independent blocks of `V`.
    pub fn blocks(&self) -> &[Vec<usize>] {
        &self.blocks
    }

    /// Map from the non-zero entries of `Lambda` (factor by factor, group by group,
    /// column-major inside a group) to positions in `theta`.
    pub fn lind(&self) -> Vec<usize> {
        let mut lind = Vec::new();
        let mut offset = 0;
        for factor in &self.factors {
            let n_theta = factor.terms.n_theta();
            for _ in 0..factor.n_groups {
                lind.extend(offset..offset + n_theta);
            }
            offset += n_theta;
        }
        lind
    }

    /// Relative covariance factor: block diagonal with one copy of the level's
    /// factor per group.
    pub fn lambda(&self) -> Array2<f64> {
        let dim: usize = self
            .factors
            .iter()
            .map(|f| f.n_groups * f.terms.n_terms())
            .sum();
        let mut lambda = Array2::zeros((dim, dim));
        let mut start = 0;
        for (factor, block) in self.factors.iter().zip(&self.theta) {
            let q = factor.terms.n_terms();
            let local = block.factor();
            for _ in 0..factor.n_groups {
                lambda
                    .slice_mut(s![start..start + q, start..start + q])
                    .assign(&local);
                start += q;
            }
        }
        lambda
    }

    /// Transposed random-effects model matrix over all factors.
    pub fn zt(&self) -> Array2<f64> {
        let columns: Vec<Array2<f64>> = self.factors.iter().map(|f| f.z()).collect();
        let dim: usize = columns.iter().map(|z| z.ncols()).sum();
        let mut zt = Array2::zeros((dim, self.n_obs()));
        let mut start = 0;
        for z in &columns {
            zt.slice_mut(s![start..start + z.ncols(), ..]).assign(&z.t());
            start += z.ncols();
        }
        zt
    }

    fn split_params(&self, params: &[f64]) -> Result<(Vec<Array2<f64>>, f64), StructureError> {
        if params.len() != self.n_params() {
            return Err(StructureError::InvalidDesign(format!(
                "expected {} covariance parameters, found {}",
                self.n_params(),
                params.len()
            )));
        }
        let sigma = params[params.len() - 1];
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(StructureError::InvalidDesign(format!(
                "residual SD must be positive and finite, found {sigma}"
            )));
        }
        let mut factors = Vec::with_capacity(self.factors.len());
        let mut offset = 0;
        for factor in &self.factors {
            let n_theta = factor.terms.n_theta();
            let block = ThetaBlock::from_values(factor.terms, &params[offset..offset + n_theta])?;
            factors.push(block.factor());
            offset += n_theta;
        }
        Ok((factors, sigma))
    }

    /// `sum over factors sharing a group of z_i' M z_j`, with `M` one q x q matrix
    /// per factor.
    fn shared_form(&self, matrices: &[Option<Array2<f64>>], i: usize, j: usize) -> f64 {
        let mut total = 0.0;
        for (factor, matrix) in self.factors.iter().zip(matrices) {
            let Some(m) = matrix else { continue };
            match (factor.groups[i], factor.groups[j]) {
                (Some(gi), Some(gj)) if gi == gj => {
                    let q = factor.terms.n_terms();
                    let (zi, zj) = (factor.z[i], factor.z[j]);
                    for a in 0..q {
                        for b in 0..q {
                            total += zi[a] * m[(a, b)] * zj[b];
                        }
                    }
                }
                _ => {}
            }
        }
        total
    }

    fn block_matrix(&self, block: usize, matrices: &[Option<Array2<f64>>], scale: f64, nugget: f64) -> Array2<f64> {
        let rows = &self.blocks[block];
        let n = rows.len();
        let mut out = Array2::zeros((n, n));
        for a in 0..n {
            for b in a..n {
                let mut value = scale * self.shared_form(matrices, rows[a], rows[b]);
                if a == b {
                    value += nugget;
                }
                out[(a, b)] = value;
                out[(b, a)] = value;
            }
        }
        out
    }

    /// Marginal covariance of one block at `params = (theta..., sigma)`.
    pub fn marginal_block(&self, block: usize, params: &[f64]) -> Result<Array2<f64>, StructureError> {
        let (factors, sigma) = self.split_params(params)?;
        let covs: Vec<Option<Array2<f64>>> =
            factors.iter().map(|l| Some(l.dot(&l.t()))).collect();
        let sigma2 = sigma * sigma;
        Ok(self.block_matrix(block, &covs, sigma2, sigma2))
    }

    /// Derivatives of one block's marginal covariance with respect to each
    /// parameter in `(theta..., sigma)` order.
    pub fn marginal_derivatives(
        &self,
        block: usize,
        params: &[f64],
    ) -> Result<Vec<Array2<f64>>, StructureError> {
        let (factors, sigma) = self.split_params(params)?;
        let sigma2 = sigma * sigma;
        let mut derivatives = Vec::with_capacity(self.n_params());
        for (f_idx, factor) in self.factors.iter().enumerate() {
            let l = &factors[f_idx];
            for &(row, col) in factor.terms.positions() {
                // d(L L') / dL[row, col] = E L' + L E'
                let mut e = Array2::zeros(l.dim());
                e[(row, col)] = 1.0;
                let d = e.dot(&l.t()) + l.dot(&e.t());
                let mut matrices: Vec<Option<Array2<f64>>> = vec![None; self.factors.len()];
                matrices[f_idx] = Some(d);
                derivatives.push(self.block_matrix(block, &matrices, sigma2, 0.0));
            }
        }
        let v = self.block_matrix(
            block,
            &factors.iter().map(|l| Some(l.dot(&l.t()))).collect::<Vec<_>>(),
            sigma2,
            sigma2,
        );
        derivatives.push(v * (2.0 / sigma));
        Ok(derivatives)
    }

    /// Full n_obs x n_obs marginal covariance at the current parameters.
    pub fn marginal_covariance(&self) -> Result<Array2<f64>, StructureError> {
        let params = self.params();
        let n = self.n_obs();
        let mut v = Array2::zeros((n, n));
        for (b, rows) in self.blocks.iter().enumerate() {
            let block = self.marginal_block(b, &params)?;
            for (a, &i) in rows.iter().enumerate() {
                for (c, &j) in rows.iter().enumerate() {
                    v[(i, j)] = block[(a, c)];
                }
            }
        }
        Ok(v)
    }
}

fn check_psd(level: GroupLevel, variance: &LevelVariance) -> Result<(), StructureError> {
    let values = [variance.sd_intercept, variance.sd_slope, variance.cor];
    if values.iter().any(|v| !v.is_finite())
        || variance.sd_intercept < 0.0
        || variance.sd_slope < 0.0
        || variance.cor.abs() > 1.0
    {
        return Err(StructureError::InvalidDesign(format!(
            "{level} variance components are out of range: {variance:?}"
        )));
    }
    let cov = variance.covariance();
    let scale = cov[(0, 0)].max(cov[(1, 1)]).max(1.0);
    let min_eig = linalg::min_eigenvalue(&cov)?;
    if min_eig < -1e-10 * scale {
        return Err(StructureError::InvalidDesign(format!(
            "{level} covariance is not positive semi-definite"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::dropout::Dropout;
    use crate::design::study::{ClusterSizes, EffectSize, PerArm};
    use approx::assert_abs_diff_eq;

    fn design(partially_nested: bool) -> StudyDesign {
        StudyDesign {
            n1: 4,
            t_end: 3.0,
            clusters: PerArm::same(ClusterSizes::Equal { n2: 3, n3: 2 }),
            fixed_intercept: 0.0,
            fixed_slope: 0.0,
            subject: LevelVariance::new(1.5, 0.4, 0.3),
            cluster: LevelVariance::new(0.8, 0.2, -0.2),
            sigma_error: 2.0,
            effect: EffectSize::Raw(1.0),
            dropout: PerArm::same(Dropout::None),
            deterministic_dropout: false,
            partially_nested,
        }
        .validated()
        .unwrap()
    }

    fn dense_v(structure: &VarianceStructure) -> Array2<f64> {
        let z = structure.zt().t().to_owned();
        let lambda = structure.lambda();
        let zl = z.dot(&lambda);
        let sigma2 = structure.sigma().powi(2);
        (Array2::eye(structure.n_obs()) + zl.dot(&zl.t())) * sigma2
    }

    #[test]
    fn blockwise_covariance_matches_dense_formula() {
        for nested in [false, true] {
            let d = design(nested);
            let structure = VarianceStructure::build(&d, &expected_layout(&d)).unwrap();
            let dense = dense_v(&structure);
            let blockwise = structure.marginal_covariance().unwrap();
            for i in 0..structure.n_obs() {
                for j in 0..structure.n_obs() {
                    assert_abs_diff_eq!(dense[(i, j)], blockwise[(i, j)], epsilon = 1e-10);
                }
            }
        }
    }

    #[test]
    fn theta_is_relative_cholesky_packing() {
        let d = design(false);
        let structure = VarianceStructure::build(&d, &expected_layout(&d)).unwrap();
        let theta = structure.theta();
        assert_eq!(theta.len(), 6);
        assert_abs_diff_eq!(theta[0], 1.5 / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(theta[1], 0.3 * 0.4 / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(theta[2], 0.4 * (1.0 - 0.09_f64).sqrt() / 2.0, epsilon = 1e-12);

        let back = structure.theta_blocks()[0].level_variance(2.0);
        assert_abs_diff_eq!(back.sd_intercept, 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(back.sd_slope, 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(back.cor, 0.3, epsilon = 1e-12);
    }

    #[test]
    fn zero_slope_variance_collapses_to_intercepts() {
        let d = design(false)
            .update(|d| {
                d.subject.sd_slope = 0.0;
                d.cluster.sd_slope = 0.0;
            })
            .unwrap();
        let structure = VarianceStructure::build(&d, &expected_layout(&d)).unwrap();
        assert_eq!(structure.theta().len(), 2);
        assert!(
            structure
                .theta_blocks()
                .iter()
                .all(|block| matches!(block, ThetaBlock::Intercept { .. }))
        );
        assert_eq!(structure.lind().len(), 6 * 2 + 4);
    }

    #[test]
    fn restricting_drops_boundary_terms() {
        let full = ReStructure {
            subject: Some(ReTerms::Correlated),
            cluster: Some(ReTerms::Correlated),
        };
        let components = VarianceComponents {
            subject: LevelVariance::new(1.0, 0.3, 0.2),
            cluster: LevelVariance::new(0.5, 0.0, 0.0),
            sigma_error: 1.0,
        };
        let restricted = full.restrict(&components);
        assert_eq!(restricted.subject, Some(ReTerms::Correlated));
        assert_eq!(restricted.cluster, Some(ReTerms::Intercept));
        assert_eq!(restricted.n_theta(), 4);

        let slope_only = ReStructure {
            subject: Some(ReTerms::Slope),
            cluster: Some(ReTerms::Uncorrelated),
        };
        let no_slopes = VarianceComponents {
            subject: LevelVariance::new(1.0, 0.0, 0.0),
            cluster: LevelVariance::default(),
            sigma_error: 1.0,
        };
        assert_eq!(slope_only.restrict(&no_slopes), ReStructure::default());
    }

    #[test]
    fn partially_nested_control_rows_have_no_cluster_incidence() {
        let d = design(true);
        let structure = VarianceStructure::build(&d, &expected_layout(&d)).unwrap();
        let cluster = structure.factor(GroupLevel::Cluster).unwrap();
        assert_eq!(cluster.n_groups(), 2);
        let incidence = cluster.incidence();
        for (idx, row) in structure.rows().iter().enumerate() {
            let total: f64 = incidence.row(idx).sum();
            match row.arm {
                Arm::Control => assert_eq!(total, 0.0),
                Arm::Treatment => assert_eq!(total, 1.0),
            }
        }
        // Six control subjects form their own blocks; two treatment clusters.
        assert_eq!(structure.blocks().len(), 8);
    }

    #[test]
    fn dropped_rows_are_excluded() {
        let d = design(true)
            .update(|d| d.dropout = PerArm::same(Dropout::weibull(0.5, 1.0)))
            .unwrap();
        let layout = expected_layout(&d);
        let observed = layout.iter().filter(|r| r.observed).count();
        assert!(observed < layout.len());
        let structure = VarianceStructure::build(&d, &layout).unwrap();
        assert_eq!(structure.n_obs(), observed);
        for factor in structure.factors() {
            assert_eq!(factor.incidence().nrows(), observed);
            assert_eq!(factor.z().nrows(), observed);
        }
        assert_eq!(structure.zt().ncols(), observed);
    }

    #[test]
    fn unequal_clusters_have_varying_row_counts() {
        let d = design(false)
            .update(|d| {
                d.clusters = PerArm::same(ClusterSizes::Unequal {
                    sizes: vec![2, 5, 10, 50],
                })
            })
            .unwrap();
        let structure = VarianceStructure::build(&d, &expected_layout(&d)).unwrap();
        let cluster = structure.factor(GroupLevel::Cluster).unwrap();
        assert_eq!(cluster.rows_per_group(), &[8, 20, 40, 200, 8, 20, 40, 200]);
        assert_eq!(structure.factor(GroupLevel::Subject).unwrap().n_groups(), 134);
    }

    #[test]
    fn missing_cluster_factor_is_an_empty_group() {
        let d = design(false);
        let layout: Vec<LayoutRow> = expected_layout(&d)
            .into_iter()
            .map(|row| LayoutRow {
                cluster: None,
                ..row
            })
            .collect();
        let re = ReStructure::from_design(&d);
        let result =
            VarianceStructure::for_model(&re, &VarianceComponents::from_design(&d), &layout);
        assert!(matches!(
            result,
            Err(StructureError::EmptyGroup {
                level: GroupLevel::Cluster
            })
        ));
    }

    #[test]
    fn derivative_of_sigma_is_twice_v_over_sigma() {
        let d = design(false);
        let structure = VarianceStructure::build(&d, &expected_layout(&d)).unwrap();
        let params = structure.params();
        let v = structure.marginal_block(0, &params).unwrap();
        let derivs = structure.marginal_derivatives(0, &params).unwrap();
        assert_eq!(derivs.len(), structure.n_params());
        let dsigma = derivs.last().unwrap();
        for ((i, j), value) in dsigma.indexed_iter() {
            assert_abs_diff_eq!(*value, 2.0 * v[(i, j)] / 2.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn theta_derivatives_match_finite_differences() {
        let d = design(false);
        let structure = VarianceStructure::build(&d, &expected_layout(&d)).unwrap();
        let params = structure.params();
        let derivs = structure.marginal_derivatives(1, &params).unwrap();
        let h = 1e-6;
        for m in 0..params.len() {
            let mut up = params.clone();
            let mut down = params.clone();
            up[m] += h;
            down[m] -= h;
            let numeric = (structure.marginal_block(1, &up).unwrap()
                - structure.marginal_block(1, &down).unwrap())
                / (2.0 * h);
            for ((i, j), value) in numeric.indexed_iter() {
                assert_abs_diff_eq!(*value, derivs[m][(i, j)], epsilon = 1e-6);
            }
        }
    }
}
