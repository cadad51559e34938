// simulate/summary.rs

//! Aggregation of simulation records into power, bias and convergence summaries,
//! optionally over the winners of a forward model-selection strategy.

use crate::design::formula::{Formula, FormulaError};
use crate::power::monte_carlo_se;
use crate::simulate::records::{DesignPoint, FitRecord, FitStatus, SimulationResult};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("Unknown model '{0}'")]
    UnknownModel(String),
    #[error("Model '{model}' has no coefficient named '{name}'")]
    UnknownCoefficient { model: String, name: String },
    #[error(
        "Forward selection needs strictly increasing covariance parameters: '{previous}' has {previous_count}, '{next}' has {next_count}"
    )]
    NotNested {
        previous: String,
        previous_count: usize,
        next: String,
        next_count: usize,
    },
    #[error("Forward selection needs the same number of coefficients from every model")]
    MismatchedTargets,
    #[error("{what} must lie in {range}, found {value}")]
    InvalidLevel {
        what: &'static str,
        range: &'static str,
        value: f64,
    },
    #[error("Stored formula could not be parsed: {0}")]
    Formula(#[from] FormulaError),
}

/// Which coefficients to summarise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParaSelection {
    /// Each model's tested coefficient.
    #[default]
    Tested,
    /// The same coefficient names in every model.
    Coefficients(Vec<String>),
    /// One coefficient per model, for models naming the same test differently.
    PerModel(Vec<(String, String)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSelection {
    /// Forward selection by likelihood-ratio tests in declared model order.
    Forward,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOptions {
    pub alpha: f64,
    pub para: ParaSelection,
    /// Restrict the summary (and the selection) to these models, in this order.
    pub models: Option<Vec<String>>,
    pub model_selection: Option<ModelSelection>,
    pub lrt_alpha: f64,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        SummaryOptions {
            alpha: 0.05,
            para: ParaSelection::Tested,
            models: None,
            model_selection: None,
            lrt_alpha: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSummary {
    pub name: String,
    pub true_value: Option<f64>,
    pub mean_estimate: f64,
    pub empirical_sd: f64,
    pub mean_se: f64,
    pub bias: Option<f64>,
    pub power: f64,
    pub power_satterthwaite: Option<f64>,
    /// Half-width of the 95% Monte Carlo interval of `power`.
    pub mcse: f64,
    pub valid: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceSummary {
    pub name: String,
    pub true_value: Option<f64>,
    pub mean: f64,
    pub sd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model: String,
    pub coefficients: Vec<CoefficientSummary>,
    pub variance: Vec<VarianceSummary>,
    pub converged: usize,
    pub convergence_warnings: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSummary {
    pub lrt_alpha: f64,
    /// How often each model was selected, in model order.
    pub selected: Vec<(String, usize)>,
    pub coefficients: Vec<CoefficientSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSummary {
    pub label: String,
    pub analytical_power: Option<f64>,
    pub replications: usize,
    pub failed_replications: usize,
    pub models: Vec<ModelSummary>,
    pub selection: Option<SelectionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub alpha: f64,
    pub designs: Vec<DesignSummary>,
}

// --- Statistics ---

fn mean_sd(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, f64::NAN);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// One fit's contribution to a coefficient summary: the coefficient it reports
/// and the value that coefficient has under the generating design.
type Contribution<'a> = (&'a FitRecord, &'a str, Option<f64>);

/// Coefficient statistics over fits that produced estimates. Bias averages each
/// estimate against its own true value, so contributions may come from models
/// whose coefficients mean different things.
fn coefficient_summary(name: &str, fits: &[Contribution<'_>], alpha: f64) -> CoefficientSummary {
    let coefs: Vec<_> = fits
        .iter()
        .filter(|(fit, _, _)| fit.status.has_estimates())
        .filter_map(|&(fit, coef, truth)| fit.coefficient(coef).map(|c| (c, truth)))
        .filter(|(c, _)| c.estimate.is_finite())
        .collect();
    let estimates: Vec<f64> = coefs.iter().map(|(c, _)| c.estimate).collect();
    let (mean_estimate, empirical_sd) = mean_sd(&estimates);
    let (mean_se, _) = mean_sd(&coefs.iter().map(|(c, _)| c.se).collect::<Vec<_>>());
    let valid = coefs.len();
    let power = if valid == 0 {
        f64::NAN
    } else {
        coefs.iter().filter(|(c, _)| c.p_value < alpha).count() as f64 / valid as f64
    };
    let satterthwaite: Vec<f64> = coefs
        .iter()
        .filter_map(|(c, _)| c.p_value_satterthwaite)
        .collect();
    let power_satterthwaite = (!satterthwaite.is_empty()).then(|| {
        satterthwaite.iter().filter(|&&p| p < alpha).count() as f64 / satterthwaite.len() as f64
    });

    // None as soon as one valid estimate has no known truth.
    let truths: Option<Vec<f64>> = coefs.iter().map(|&(_, truth)| truth).collect();
    let truths = truths.filter(|t| !t.is_empty());
    let bias = truths.as_ref().map(|t| {
        let errors: Vec<f64> = estimates.iter().zip(t).map(|(e, t)| e - t).collect();
        mean_sd(&errors).0
    });
    let shared = fits
        .first()
        .map(|&(_, _, truth)| truth)
        .filter(|&first| fits.iter().all(|&(_, _, truth)| truth == first))
        .flatten();
    let true_value = shared.or_else(|| truths.map(|t| mean_sd(&t).0));

    CoefficientSummary {
        name: name.to_string(),
        true_value,
        mean_estimate,
        empirical_sd,
        mean_se,
        bias,
        power,
        power_satterthwaite,
        mcse: if valid == 0 {
            f64::NAN
        } else {
            monte_carlo_se(power, valid)
        },
        valid,
    }
}

// --- Targets ---

struct ModelInfo {
    name: String,
    n_covariance_params: usize,
    targets: Vec<String>,
}

fn resolve_models(
    result: &SimulationResult,
    options: &SummaryOptions,
) -> Result<Vec<ModelInfo>, SummaryError> {
    let names: Vec<String> = match &options.models {
        Some(models) => models.clone(),
        None => result.formulas.iter().map(|f| f.name.clone()).collect(),
    };
    let mut infos = Vec::with_capacity(names.len());
    for name in names {
        let description = result
            .formulas
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| SummaryError::UnknownModel(name.clone()))?;
        let formula: Formula = description.formula.parse()?;
        let available = formula.coefficient_names();
        let targets = match &options.para {
            ParaSelection::Tested => vec![description.test.clone()],
            ParaSelection::Coefficients(coefs) => coefs.clone(),
            ParaSelection::PerModel(pairs) => {
                let coef = pairs
                    .iter()
                    .find(|(model, _)| *model == name)
                    .map(|(_, coef)| coef.clone())
                    .ok_or_else(|| SummaryError::UnknownModel(name.clone()))?;
                vec![coef]
            }
        };
        for target in &targets {
            if !available.contains(target) {
                return Err(SummaryError::UnknownCoefficient {
                    model: name.clone(),
                    name: target.clone(),
                });
            }
        }
        infos.push(ModelInfo {
            name,
            n_covariance_params: description.n_covariance_params,
            targets,
        });
    }
    if let ParaSelection::PerModel(pairs) = &options.para {
        let known = |m: &String| result.formulas.iter().any(|f| f.name == *m);
        if let Some((model, _)) = pairs.iter().find(|(m, _)| !known(m)) {
            return Err(SummaryError::UnknownModel(model.clone()));
        }
    }
    Ok(infos)
}

fn check_nested(models: &[ModelInfo]) -> Result<(), SummaryError> {
    for pair in models.windows(2) {
        if pair[1].n_covariance_params <= pair[0].n_covariance_params {
            return Err(SummaryError::NotNested {
                previous: pair[0].name.clone(),
                previous_count: pair[0].n_covariance_params,
                next: pair[1].name.clone(),
                next_count: pair[1].n_covariance_params,
            });
        }
    }
    if models.windows(2).any(|pair| pair[0].targets.len() != pair[1].targets.len()) {
        return Err(SummaryError::MismatchedTargets);
    }
    Ok(())
}

/// Likelihood-ratio p-value of `next` against `current`.
fn lrt_p_value(current: &FitRecord, next: &FitRecord) -> Option<f64> {
    let df = next.n_covariance_params.checked_sub(current.n_covariance_params)?;
    let lr = (2.0 * (next.loglik? - current.loglik?)).max(0.0);
    let chi2 = ChiSquared::new(df as f64).ok()?;
    Some(1.0 - chi2.cdf(lr))
}

/// Index (into `models`) of the model forward selection keeps in one replication.
fn forward_select(
    fits: &[Option<&FitRecord>],
    lrt_alpha: f64,
) -> Option<usize> {
    let mut candidates = fits
        .iter()
        .enumerate()
        .filter_map(|(i, fit)| fit.filter(|f| f.status == FitStatus::Completed).map(|f| (i, f)));
    let (mut current, mut current_fit) = candidates.next()?;
    for (i, fit) in candidates {
        let accept = lrt_alpha >= 1.0
            || lrt_p_value(current_fit, fit).is_some_and(|p| p < lrt_alpha);
        if !accept {
            break;
        }
        current = i;
        current_fit = fit;
    }
    Some(current)
}

fn summarize_design(
    point: &DesignPoint,
    models: &[ModelInfo],
    options: &SummaryOptions,
) -> DesignSummary {
    let usable: Vec<_> = point
        .replications
        .iter()
        .filter(|r| r.failure.is_none())
        .collect();

    let mut model_summaries = Vec::with_capacity(models.len());
    for model in models {
        let fits: Vec<&FitRecord> = usable.iter().filter_map(|r| r.fit(&model.name)).collect();
        let truth = point.truth(&model.name);
        let coefficients = model
            .targets
            .iter()
            .map(|target| {
                let value = truth.and_then(|t| t.coefficient(target));
                let contributions: Vec<Contribution<'_>> =
                    fits.iter().map(|&f| (f, target.as_str(), value)).collect();
                coefficient_summary(target, &contributions, options.alpha)
            })
            .collect();

        let mut by_name: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        let mut order: Vec<&str> = Vec::new();
        for fit in fits.iter().filter(|f| f.status.has_estimates()) {
            for value in &fit.variance {
                if !by_name.contains_key(value.name.as_str()) {
                    order.push(value.name.as_str());
                }
                by_name.entry(value.name.as_str()).or_default().push(value.value);
            }
        }
        let variance = order
            .iter()
            .map(|&name| {
                let (mean, sd) = mean_sd(&by_name[name]);
                VarianceSummary {
                    name: name.to_string(),
                    true_value: truth.and_then(|t| t.variance(name)),
                    mean,
                    sd,
                }
            })
            .collect();

        let count = |status: FitStatus| fits.iter().filter(|f| f.status == status).count();
        model_summaries.push(ModelSummary {
            model: model.name.clone(),
            coefficients,
            variance,
            converged: count(FitStatus::Completed),
            convergence_warnings: count(FitStatus::ConvergenceWarning),
            failed: count(FitStatus::FitFailed),
        });
    }

    let selection = options.model_selection.map(|ModelSelection::Forward| {
        let mut selected = vec![0usize; models.len()];
        let mut winners: Vec<(&FitRecord, usize)> = Vec::new();
        for rep in &usable {
            let fits: Vec<Option<&FitRecord>> = models.iter().map(|m| rep.fit(&m.name)).collect();
            if let Some(idx) = forward_select(&fits, options.lrt_alpha) {
                selected[idx] += 1;
                if let Some(fit) = fits[idx] {
                    winners.push((fit, idx));
                }
            }
        }
        let n_targets = models.first().map_or(0, |m| m.targets.len());
        let coefficients = (0..n_targets)
            .map(|k| {
                let contributions: Vec<Contribution<'_>> = winners
                    .iter()
                    .map(|&(fit, idx)| {
                        let target = models[idx].targets[k].as_str();
                        let truth = point
                            .truth(&models[idx].name)
                            .and_then(|t| t.coefficient(target));
                        (fit, target, truth)
                    })
                    .collect();
                coefficient_summary(&models[0].targets[k], &contributions, options.alpha)
            })
            .collect();
        SelectionSummary {
            lrt_alpha: options.lrt_alpha,
            selected: models
                .iter()
                .zip(selected)
                .map(|(m, n)| (m.name.clone(), n))
                .collect(),
            coefficients,
        }
    });

    DesignSummary {
        label: point.label.clone(),
        analytical_power: point.analytical_power,
        replications: point.replications.len(),
        failed_replications: point.failed_replications(),
        models: model_summaries,
        selection,
    }
}

/// Summarises every design point of `result`.
pub fn summarize(result: &SimulationResult, options: &SummaryOptions) -> Result<Summary, SummaryError> {
    if !(options.alpha > 0.0 && options.alpha < 1.0) {
        return Err(SummaryError::InvalidLevel {
            what: "alpha",
            range: "(0, 1)",
            value: options.alpha,
        });
    }
    if !(options.lrt_alpha >= 0.0) {
        return Err(SummaryError::InvalidLevel {
            what: "LRT alpha",
            range: "[0, inf)",
            value: options.lrt_alpha,
        });
    }
    let models = resolve_models(result, options)?;
    if models.is_empty() {
        return Err(FormulaError::NoModels.into());
    }
    if options.model_selection.is_some() {
        check_nested(&models)?;
    }
    Ok(Summary {
        alpha: options.alpha,
        designs: result
            .designs
            .iter()
            .map(|point| summarize_design(point, &models, options))
            .collect(),
    })
}

// --- Display ---

fn fmt_opt(value: Option<f64>, width: usize) -> String {
    match value {
        Some(v) => format!("{v:>width$.4}"),
        None => format!("{:>width$}", "-"),
    }
}

fn write_coefficients(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    coefficients: &[CoefficientSummary],
) -> fmt::Result {
    for c in coefficients {
        writeln!(
            f,
            "  {:<12} {:<16} {} {:>9.4} {:>9.4} {:>9.4} {} {:>7.3} {} {:>7.4} {:>6}",
            label,
            c.name,
            fmt_opt(c.true_value, 9),
            c.mean_estimate,
            c.empirical_sd,
            c.mean_se,
            fmt_opt(c.bias, 9),
            c.power,
            fmt_opt(c.power_satterthwaite, 7),
            c.mcse,
            c.valid
        )?;
    }
    Ok(())
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, design) in self.designs.iter().enumerate() {
            writeln!(f, "Design {}: {}", i + 1, design.label)?;
            writeln!(
                f,
                "  replications: {} ({} failed), analytical power: {}, alpha: {}",
                design.replications,
                design.failed_replications,
                fmt_opt(design.analytical_power, 0).trim(),
                self.alpha
            )?;
            writeln!(
                f,
                "  {:<12} {:<16} {:>9} {:>9} {:>9} {:>9} {:>9} {:>7} {:>7} {:>7} {:>6}",
                "model", "coefficient", "true", "estimate", "emp_sd", "mean_se", "bias", "power",
                "satt", "mcse", "valid"
            )?;
            for model in &design.models {
                write_coefficients(f, &model.model, &model.coefficients)?;
            }
            if let Some(selection) = &design.selection {
                write_coefficients(f, "FW", &selection.coefficients)?;
                let counts: Vec<String> = selection
                    .selected
                    .iter()
                    .map(|(name, n)| format!("{name}={n}"))
                    .collect();
                writeln!(
                    f,
                    "  forward selection (LRT alpha {}): {}",
                    selection.lrt_alpha,
                    counts.join(", ")
                )?;
            }
            for model in &design.models {
                writeln!(
                    f,
                    "  {} fits: {} converged, {} convergence warnings, {} failed",
                    model.model, model.converged, model.convergence_warnings, model.failed
                )?;
                for v in &model.variance {
                    writeln!(
                        f,
                        "    {:<22} {} {:>9.4} {:>9.4}",
                        v.name,
                        fmt_opt(v.true_value, 9),
                        v.mean,
                        v.sd
                    )?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::dropout::Dropout;
    use crate::design::formula::FormulaDescription;
    use crate::design::study::{ClusterSizes, EffectSize, LevelVariance, PerArm, StudyDesign};
    use crate::simulate::records::{
        CoefficientRecord, ModelTruth, NamedValue, ReplicationRecord, RunInfo,
    };
    use approx::assert_abs_diff_eq;

    fn fit(model: &str, k: usize, estimate: f64, p: f64, loglik: f64) -> FitRecord {
        FitRecord {
            model: model.to_string(),
            status: FitStatus::Completed,
            warnings: Vec::new(),
            error: None,
            coefficients: vec![CoefficientRecord {
                name: "time:treatment".to_string(),
                estimate,
                se: 0.1,
                p_value: p,
                df: None,
                p_value_satterthwaite: None,
                df_warning: None,
            }],
            variance: vec![NamedValue::new("error.sd", 1.0)],
            loglik: Some(loglik),
            n_covariance_params: k,
            n_obs: 10,
        }
    }

    fn description(name: &str, formula: &str, k: usize) -> FormulaDescription {
        FormulaDescription {
            name: name.to_string(),
            formula: formula.to_string(),
            test: "time:treatment".to_string(),
            transform: "identity".to_string(),
            n_covariance_params: k,
        }
    }

    fn result(replications: Vec<ReplicationRecord>) -> SimulationResult {
        let design = StudyDesign::two_level(5, 10, LevelVariance::new(1.0, 0.1, 0.0), 1.0)
            .update(|d| {
                d.effect = EffectSize::Raw(0.4);
                d.dropout = PerArm::same(Dropout::None);
                d.clusters = PerArm::same(ClusterSizes::Equal { n2: 10, n3: 1 });
            })
            .unwrap();
        SimulationResult {
            run: RunInfo {
                nsim: replications.len(),
                seed: 1,
                cores: 1,
                satterthwaite: false,
            },
            formulas: vec![
                description("m0", "y ~ time * treatment + (1 | subject)", 2),
                description("m1", "y ~ time * treatment + (1 + time | subject)", 4),
            ],
            designs: vec![DesignPoint {
                index: 0,
                label: "test".to_string(),
                analytical_power: Some(0.5),
                truth: vec![ModelTruth {
                    model: "m0".to_string(),
                    coefficients: vec![NamedValue::new("time:treatment", 0.1)],
                    variance: vec![NamedValue::new("error.sd", 1.0)],
                }],
                design,
                replications,
            }],
        }
    }

    fn rep(i: usize, fits: Vec<FitRecord>) -> ReplicationRecord {
        ReplicationRecord {
            replication: i,
            seed: i as u64,
            failure: None,
            fits,
        }
    }

    #[test]
    fn power_bias_and_sd_per_model() {
        let r = result(vec![
            rep(0, vec![fit("m0", 2, 0.1, 0.01, -10.0), fit("m1", 4, 0.2, 0.2, -9.0)]),
            rep(1, vec![fit("m0", 2, 0.3, 0.20, -10.0), fit("m1", 4, 0.2, 0.2, -9.0)]),
        ]);
        let summary = summarize(&r, &SummaryOptions::default()).unwrap();
        let m0 = &summary.designs[0].models[0].coefficients[0];
        assert_abs_diff_eq!(m0.mean_estimate, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(m0.bias.unwrap(), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(m0.empirical_sd, (0.02f64).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(m0.power, 0.5, epsilon = 1e-12);
        assert_eq!(m0.valid, 2);
        let m1 = &summary.designs[0].models[1].coefficients[0];
        assert_eq!(m1.power, 0.0);
        assert!(m1.true_value.is_none());
        assert!(summary.to_string().contains("time:treatment"));
    }

    #[test]
    fn failed_fits_and_replications_are_excluded() {
        let failed = FitRecord::failed("m0", 2, 10, "boom".to_string());
        let r = result(vec![
            rep(0, vec![fit("m0", 2, 0.1, 0.01, -10.0), fit("m1", 4, 0.1, 0.01, -9.0)]),
            rep(1, vec![failed, fit("m1", 4, 0.1, 0.01, -9.0)]),
            ReplicationRecord {
                replication: 2,
                seed: 2,
                failure: Some("empty".to_string()),
                fits: Vec::new(),
            },
        ]);
        let summary = summarize(&r, &SummaryOptions::default()).unwrap();
        let design = &summary.designs[0];
        assert_eq!(design.failed_replications, 1);
        assert_eq!(design.models[0].coefficients[0].valid, 1);
        assert_eq!(design.models[0].failed, 1);
        assert_eq!(design.models[1].converged, 2);
    }

    #[test]
    fn forward_selection_follows_the_lrt() {
        // LR = 2 on 2 df gives p = exp(-1) = 0.37; LR = 20 gives p < 0.001.
        let r = result(vec![
            rep(0, vec![fit("m0", 2, 0.1, 0.01, -10.0), fit("m1", 4, 0.5, 0.5, -9.0)]),
            rep(1, vec![fit("m0", 2, 0.1, 0.01, -20.0), fit("m1", 4, 0.5, 0.5, -10.0)]),
        ]);
        let options = SummaryOptions {
            model_selection: Some(ModelSelection::Forward),
            lrt_alpha: 0.1,
            ..Default::default()
        };
        let summary = summarize(&r, &options).unwrap();
        let selection = summary.designs[0].selection.as_ref().unwrap();
        assert_eq!(
            selection.selected,
            vec![("m0".to_string(), 1), ("m1".to_string(), 1)]
        );
        assert_abs_diff_eq!(selection.coefficients[0].mean_estimate, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(selection.coefficients[0].power, 0.5, epsilon = 1e-12);

        let always = summarize(
            &r,
            &SummaryOptions {
                lrt_alpha: 1.0,
                ..options.clone()
            },
        )
        .unwrap();
        let selection = always.designs[0].selection.as_ref().unwrap();
        assert_eq!(selection.selected[1].1, 2);
    }

    #[test]
    fn zero_lrt_alpha_never_leaves_the_first_model() {
        let r = result(vec![
            rep(0, vec![fit("m0", 2, 0.1, 0.01, -10.0), fit("m1", 4, 0.5, 0.5, -9.0)]),
            rep(1, vec![fit("m0", 2, 0.1, 0.01, -200.0), fit("m1", 4, 0.5, 0.5, -10.0)]),
        ]);
        let options = SummaryOptions {
            model_selection: Some(ModelSelection::Forward),
            lrt_alpha: 0.0,
            ..Default::default()
        };
        let summary = summarize(&r, &options).unwrap();
        let selection = summary.designs[0].selection.as_ref().unwrap();
        assert_eq!(
            selection.selected,
            vec![("m0".to_string(), 2), ("m1".to_string(), 0)]
        );

        let negative = SummaryOptions {
            lrt_alpha: -0.1,
            ..options
        };
        assert!(matches!(
            summarize(&r, &negative),
            Err(SummaryError::InvalidLevel { .. })
        ));
    }

    #[test]
    fn selected_estimates_are_compared_with_their_own_model_truth() {
        let mut r = result(vec![
            rep(0, vec![fit("m0", 2, 0.1, 0.01, -10.0), fit("m1", 4, 0.5, 0.5, -9.0)]),
            rep(1, vec![fit("m0", 2, 0.1, 0.01, -20.0), fit("m1", 4, 0.5, 0.5, -10.0)]),
        ]);
        r.designs[0].truth.push(ModelTruth {
            model: "m1".to_string(),
            coefficients: vec![NamedValue::new("time:treatment", 0.4)],
            variance: vec![NamedValue::new("error.sd", 1.0)],
        });
        let options = SummaryOptions {
            model_selection: Some(ModelSelection::Forward),
            lrt_alpha: 0.1,
            ..Default::default()
        };
        let summary = summarize(&r, &options).unwrap();
        let selected = &summary.designs[0].selection.as_ref().unwrap().coefficients[0];
        // m0 wins once (0.1 against 0.1), m1 once (0.5 against 0.4).
        assert_abs_diff_eq!(selected.bias.unwrap(), 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(selected.true_value.unwrap(), 0.25, epsilon = 1e-12);

        let m1 = &summary.designs[0].models[1].coefficients[0];
        assert_abs_diff_eq!(m1.true_value.unwrap(), 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(m1.bias.unwrap(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn forward_selection_rejects_unordered_models() {
        let r = result(vec![rep(0, vec![fit("m0", 2, 0.1, 0.01, -10.0)])]);
        let options = SummaryOptions {
            models: Some(vec!["m1".to_string(), "m0".to_string()]),
            model_selection: Some(ModelSelection::Forward),
            ..Default::default()
        };
        assert!(matches!(
            summarize(&r, &options),
            Err(SummaryError::NotNested { .. })
        ));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let r = result(vec![rep(0, vec![fit("m0", 2, 0.1, 0.01, -10.0)])]);
        let err = summarize(
            &r,
            &SummaryOptions {
                para: ParaSelection::Coefficients(vec!["slope".to_string()]),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(SummaryError::UnknownCoefficient { .. })));
        let err = summarize(
            &r,
            &SummaryOptions {
                models: Some(vec!["nope".to_string()]),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(SummaryError::UnknownModel(_))));
    }
}
