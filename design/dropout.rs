// design/dropout.rs

//! Monotone dropout specifications.
//!
//! A dropout specification maps the design's time points to the cumulative
//! proportion of subjects lost by that time. Nobody is lost at the first time point
//! and a subject that is missing once stays missing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DropoutError {
    #[error("Dropout proportion must lie in [0, 1), found {0}")]
    ProportionOutOfRange(f64),
    #[error("Weibull dropout rate must be positive and finite, found {0}")]
    RateNotPositive(f64),
    #[error("Manual dropout needs one value per time point: expected {expected}, found {found}")]
    ManualLength { expected: usize, found: usize },
    #[error("Manual dropout must start at 0 at the first time point, found {0}")]
    ManualStartsAboveZero(f64),
    #[error("Manual dropout must be non-decreasing over time")]
    ManualNotMonotone,
}

/// Cumulative dropout as a function of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dropout {
    #[default]
    None,
    /// Weibull-survival shaped dropout. `proportion` is the share lost by the last
    /// time point, `rate` is the Weibull shape: values below 1 front-load dropout,
    /// values above 1 push it towards the end of the study.
    Weibull { proportion: f64, rate: f64 },
    /// Explicit cumulative dropout per time point.
    Manual { cumulative: Vec<f64> },
}

impl Dropout {
    pub fn weibull(proportion: f64, rate: f64) -> Self {
        Dropout::Weibull { proportion, rate }
    }

    pub fn validate(&self, n1: usize) -> Result<(), DropoutError> {
        match self {
            Dropout::None => Ok(()),
            Dropout::Weibull { proportion, rate } => {
                if !proportion.is_finite() || !(0.0..1.0).contains(proportion) {
                    return Err(DropoutError::ProportionOutOfRange(*proportion));
                }
                if !rate.is_finite() || *rate <= 0.0 {
                    return Err(DropoutError::RateNotPositive(*rate));
                }
                Ok(())
            }
            Dropout::Manual { cumulative } => {
                if cumulative.len() != n1 {
                    return Err(DropoutError::ManualLength {
                        expected: n1,
                        found: cumulative.len(),
                    });
                }
                if let Some(&first) = cumulative.first() {
                    if first != 0.0 {
                        return Err(DropoutError::ManualStartsAboveZero(first));
                    }
                }
                for &p in cumulative {
                    if !p.is_finite() || !(0.0..1.0).contains(&p) {
                        return Err(DropoutError::ProportionOutOfRange(p));
                    }
                }
                if cumulative.windows(2).any(|w| w[1] < w[0]) {
                    return Err(DropoutError::ManualNotMonotone);
                }
                Ok(())
            }
        }
    }

    /// Cumulative dropout at each of `time`, which must be sorted with the first
    /// element at baseline.
    pub fn cumulative(&self, time: &[f64]) -> Vec<f64> {
        match self {
            Dropout::None => vec![0.0; time.len()],
            Dropout::Weibull { proportion, rate } => {
                let t_first = time.first().copied().unwrap_or(0.0);
                let t_last = time.last().copied().unwrap_or(0.0);
                let span = t_last - t_first;
                time.iter()
                    .enumerate()
                    .map(|(k, &t)| {
                        if k == 0 || *proportion == 0.0 || span <= 0.0 {
                            return 0.0;
                        }
                        // With scale chosen so F(1) = proportion the Weibull CDF
                        // reduces to 1 - (1 - proportion)^(u^rate).
                        let u = (t - t_first) / span;
                        1.0 - (1.0 - proportion).powf(u.powf(*rate))
                    })
                    .collect()
            }
            Dropout::Manual { cumulative } => cumulative.clone(),
        }
    }

    pub fn is_none(&self) -> bool {
        match self {
            Dropout::None => true,
            Dropout::Weibull { proportion, .. } => *proportion == 0.0,
            Dropout::Manual { cumulative } => cumulative.iter().all(|&p| p == 0.0),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Dropout::None => "none".to_string(),
            Dropout::Weibull { proportion, rate } => {
                format!("weibull(p={proportion}, rate={rate})")
            }
            Dropout::Manual { cumulative } => format!("manual({cumulative:?})"),
        }
    }
}

/// Number of subjects lost by each time point under deterministic dropout.
/// Non-decreasing whenever `cumulative` is.
pub fn deterministic_missing_counts(n_subjects: usize, cumulative: &[f64]) -> Vec<usize> {
    let mut counts = Vec::with_capacity(cumulative.len());
    let mut previous = 0usize;
    for &p in cumulative {
        let count = ((n_subjects as f64) * p).round() as usize;
        let count = count.clamp(previous, n_subjects);
        counts.push(count);
        previous = count;
    }
    counts
}

/// Subjects still observed at each time point when `n_subjects` follow the
/// expected dropout pattern exactly.
pub fn expected_observed_counts(n_subjects: usize, cumulative: &[f64]) -> Vec<usize> {
    deterministic_missing_counts(n_subjects, cumulative)
        .into_iter()
        .map(|missing| n_subjects - missing)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn time(n1: usize) -> Vec<f64> {
        (0..n1).map(|k| k as f64).collect()
    }

    #[test]
    fn weibull_reaches_requested_proportion_at_the_end() {
        let dropout = Dropout::weibull(0.3, 1.0);
        let p = dropout.cumulative(&time(11));
        assert_eq!(p[0], 0.0);
        assert_abs_diff_eq!(p[10], 0.3, epsilon = 1e-12);
        assert!(p.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn weibull_shape_moves_dropout_earlier_or_later() {
        let early = Dropout::weibull(0.4, 0.3).cumulative(&time(6));
        let late = Dropout::weibull(0.4, 3.0).cumulative(&time(6));
        assert!(early[1] > late[1]);
        assert_abs_diff_eq!(early[5], late[5], epsilon = 1e-12);
    }

    #[test]
    fn manual_dropout_is_validated() {
        let ok = Dropout::Manual {
            cumulative: vec![0.0, 0.1, 0.2],
        };
        assert!(ok.validate(3).is_ok());

        let wrong_length = Dropout::Manual {
            cumulative: vec![0.0, 0.1],
        };
        assert_eq!(
            wrong_length.validate(3),
            Err(DropoutError::ManualLength {
                expected: 3,
                found: 2
            })
        );

        let decreasing = Dropout::Manual {
            cumulative: vec![0.0, 0.3, 0.2],
        };
        assert_eq!(decreasing.validate(3), Err(DropoutError::ManualNotMonotone));

        let starts_high = Dropout::Manual {
            cumulative: vec![0.1, 0.3, 0.4],
        };
        assert_eq!(
            starts_high.validate(3),
            Err(DropoutError::ManualStartsAboveZero(0.1))
        );
    }

    #[test]
    fn proportion_of_one_is_rejected() {
        assert_eq!(
            Dropout::weibull(1.0, 1.0).validate(4),
            Err(DropoutError::ProportionOutOfRange(1.0))
        );
    }

    #[test]
    fn deterministic_counts_are_monotone_and_bounded() {
        let counts = deterministic_missing_counts(10, &[0.0, 0.14, 0.26, 0.31, 0.99]);
        assert_eq!(counts, vec![0, 1, 3, 3, 10]);
    }
}
