// simulate/data.rs

//! Realized datasets drawn from a study design's generative model.
//!
//! One replication draws cluster sizes (for Poisson designs), random effects and
//! residuals, producing a complete long-format dataset; dropout is applied as a
//! separate step so that the complete data can be inspected in tests.

use crate::design::dropout;
use crate::design::structure::LayoutRow;
use crate::design::study::{Arm, ClusterSizes, LevelVariance, StudyDesign};
use ndarray::Array1;
use rand::Rng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Poisson, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Cluster sizes could not be drawn: {0}")]
    ClusterSizes(String),
}

/// One (subject, time) observation. `y` is `None` after dropout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub subject: usize,
    pub cluster: Option<usize>,
    pub arm: Arm,
    pub time_index: usize,
    pub time: f64,
    pub y: Option<f64>,
}

impl DataRow {
    pub fn treatment(&self) -> f64 {
        self.arm.indicator()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealizedDataset {
    rows: Vec<DataRow>,
}

fn draw_pair<R: Rng + ?Sized>(level: &LevelVariance, rng: &mut R) -> (f64, f64) {
    let z1: f64 = rng.sample(StandardNormal);
    let z2: f64 = rng.sample(StandardNormal);
    let intercept = level.sd_intercept * z1;
    let slope = level.sd_slope * (level.cor * z1 + (1.0 - level.cor * level.cor).max(0.0).sqrt() * z2);
    (intercept, slope)
}

fn draw_sizes<R: Rng + ?Sized>(sizes: &ClusterSizes, rng: &mut R) -> Result<Vec<usize>, DataError> {
    match sizes {
        ClusterSizes::Poisson { mean, n3 } => {
            let poisson = Poisson::new(*mean).map_err(|e| DataError::ClusterSizes(e.to_string()))?;
            Ok((0..*n3)
                .map(|_| (poisson.sample(rng) as usize).max(1))
                .collect())
        }
        other => Ok(other.expected_sizes()),
    }
}

impl RealizedDataset {
    pub fn from_rows(rows: Vec<DataRow>) -> Self {
        RealizedDataset { rows }
    }

    /// Complete data for one replication, control arm first.
    pub fn generate<R: Rng + ?Sized>(design: &StudyDesign, rng: &mut R) -> Result<Self, DataError> {
        let time = design.time_points();
        let delta = design.slope_difference();
        let mut rows = Vec::new();
        let mut subject = 0usize;
        let mut next_cluster = 0usize;

        for arm in Arm::BOTH {
            let sizes = draw_sizes(design.clusters.get(arm), rng)?;
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
            let trt = arm.indicator();

            for (cluster, m) in groups {
                let (v0, v1) = if cluster.is_some() && design.arm_has_cluster_effect(arm) {
                    draw_pair(&design.cluster, rng)
                } else {
                    (0.0, 0.0)
                };
                for _ in 0..m {
                    let (u0, u1) = draw_pair(&design.subject, rng);
                    for (k, &t) in time.iter().enumerate() {
                        let e: f64 = rng.sample::<f64, _>(StandardNormal) * design.sigma_error;
                        let y = design.fixed_intercept
                            + design.fixed_slope * t
                            + trt * delta * t
                            + v0
                            + v1 * t
                            + u0
                            + u1 * t
                            + e;
                        rows.push(DataRow {
                            subject,
                            cluster,
                            arm,
                            time_index: k,
                            time: t,
                            y: Some(y),
                        });
                    }
                    subject += 1;
                }
            }
        }
        Ok(RealizedDataset { rows })
    }

    /// Applies each arm's dropout curve, control arm first. Deterministic dropout
    /// removes exactly the rounded expected number of subjects by each time point;
    /// random dropout draws one uniform per subject. A subject missing at one time
    /// point stays missing afterwards.
    pub fn apply_dropout<R: Rng + ?Sized>(&mut self, design: &StudyDesign, rng: &mut R) {
        let mut first_missing: BTreeMap<usize, usize> = BTreeMap::new();
        for arm in Arm::BOTH {
            if design.dropout.get(arm).is_none() {
                continue;
            }
            let cumulative = design.dropout_curve(arm);
            let mut subjects: Vec<usize> = self
                .rows
                .iter()
                .filter(|row| row.arm == arm)
                .map(|row| row.subject)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            if design.deterministic_dropout {
                subjects.shuffle(rng);
                let missing = dropout::deterministic_missing_counts(subjects.len(), &cumulative);
                for (position, &subject) in subjects.iter().enumerate() {
                    if let Some(k) = missing.iter().position(|&count| position < count) {
                        first_missing.insert(subject, k);
                    }
                }
            } else {
                for &subject in &subjects {
                    let u: f64 = rng.random();
                    if let Some(k) = cumulative.iter().position(|&p| u < p) {
                        first_missing.insert(subject, k);
                    }
                }
            }
        }
        for row in &mut self.rows {
            if let Some(&k) = first_missing.get(&row.subject) {
                if row.time_index >= k {
                    row.y = None;
                }
            }
        }
    }

    /// Cross-section at the last time point.
    pub fn posttest(&self) -> RealizedDataset {
        let last = self.rows.iter().map(|row| row.time_index).max().unwrap_or(0);
        RealizedDataset {
            rows: self
                .rows
                .iter()
                .filter(|row| row.time_index == last)
                .copied()
                .collect(),
        }
    }

    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    pub fn n_observed(&self) -> usize {
        self.rows.iter().filter(|row| row.y.is_some()).count()
    }

    pub fn n_subjects(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.subject)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn layout(&self) -> Vec<LayoutRow> {
        self.rows
            .iter()
            .map(|row| LayoutRow {
                subject: row.subject,
                cluster: row.cluster,
                arm: row.arm,
                time_index: row.time_index,
                time: row.time,
                observed: row.y.is_some(),
            })
            .collect()
    }

    /// Outcomes of the observed rows, in row order.
    pub fn observed_y(&self) -> Array1<f64> {
        self.rows.iter().filter_map(|row| row.y).collect()
    }
}
