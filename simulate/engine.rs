// simulate/engine.rs

//! Monte Carlo driver.
//!
//! For every design point and replication: draw a dataset, apply dropout, then for
//! each model apply its data transform, fit it through the collaborator and record
//! the outcome. Failures inside a replication are recorded and never abort the
//! batch; user errors (bad formulas, no models, `nsim = 0`) are rejected before the
//! first replication runs.

use crate::design::formula::{FixedTerm, FormulaError, SimFormula, SimFormulaCompare};
use crate::design::params::{ParamError, StudyParameters};
use crate::design::structure::{GroupLevel, VarianceComponents, VarianceStructure};
use crate::design::study::StudyDesign;
use crate::linalg;
use crate::power::{self, PowerOptions};
use crate::satterthwaite::{self, DfError};
use crate::simulate::data::RealizedDataset;
use crate::simulate::fit::{FitOutput, FitRequest, ModelFitter};
use crate::simulate::records::{
    CoefficientRecord, DesignPoint, FitRecord, FitStatus, ModelTruth, NamedValue, RecordError,
    ReplicationRecord, RunInfo, SimulationResult, variance_values,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use std::io::IsTerminal;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("nsim must be at least 1")]
    NoReplications,
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(String),
    #[error("Failed to save the simulation result: {0}")]
    Save(#[from] RecordError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimOptions {
    pub nsim: usize,
    /// Worker threads; one or fewer runs serially.
    pub cores: usize,
    pub seed: u64,
    /// Compute Satterthwaite df and p-values for each model's tested coefficient.
    pub satterthwaite: bool,
    pub save: Option<PathBuf>,
    pub progress: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            nsim: 100,
            cores: 1,
            seed: 1,
            satterthwaite: false,
            save: None,
            progress: false,
        }
    }
}

/// A single design or a parameter grid expanded lazily.
#[derive(Debug, Clone)]
pub enum SimulationInput {
    Design(Box<StudyDesign>),
    Grid(StudyParameters),
}

impl From<StudyDesign> for SimulationInput {
    fn from(design: StudyDesign) -> Self {
        SimulationInput::Design(Box::new(design))
    }
}

impl From<StudyParameters> for SimulationInput {
    fn from(params: StudyParameters) -> Self {
        SimulationInput::Grid(params)
    }
}

impl SimulationInput {
    fn len(&self) -> usize {
        match self {
            SimulationInput::Design(_) => 1,
            SimulationInput::Grid(params) => params.grid_size(),
        }
    }

    fn designs(&self) -> Result<Box<dyn Iterator<Item = Result<StudyDesign, ParamError>> + '_>, ParamError> {
        Ok(match self {
            SimulationInput::Design(design) => Box::new(std::iter::once(Ok((**design).clone()))),
            SimulationInput::Grid(params) => Box::new(params.designs()?),
        })
    }
}

// --- Seeds ---

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed of one replication; independent of the worker that runs it. Kept within
/// 63 bits so saved results remain valid TOML integers.
pub fn replication_seed(seed: u64, design_index: usize, replication: usize) -> u64 {
    splitmix64(splitmix64(seed ^ splitmix64(design_index as u64)) ^ replication as u64) >> 1
}

fn create_progress_bar(len: u64, show: bool) -> ProgressBar {
    let draw_target = if show && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb
}

// --- Truth ---

/// Value of `term` under the generating model, as seen by a formula that does or
/// does not model time. Cross-sectional formulas see the last time point.
pub fn true_coefficient(design: &StudyDesign, term: FixedTerm, uses_time: bool) -> f64 {
    let t_last = design.t_end;
    match (term, uses_time) {
        (FixedTerm::Intercept, true) => design.fixed_intercept,
        (FixedTerm::Intercept, false) => design.fixed_intercept + design.fixed_slope * t_last,
        (FixedTerm::Treatment, true) => 0.0,
        (FixedTerm::Treatment, false) => design.effect_at_end(),
        (FixedTerm::Time, _) => design.fixed_slope,
        (FixedTerm::TimeTreatment, _) => design.slope_difference(),
    }
}

fn model_levels(sim: &SimFormula) -> Vec<GroupLevel> {
    sim.formula.re_structure().levels().map(|(level, _)| level).collect()
}

fn model_truth(design: &StudyDesign, name: &str, sim: &SimFormula) -> ModelTruth {
    let uses_time = sim.formula.uses_time();
    ModelTruth {
        model: name.to_string(),
        coefficients: sim
            .formula
            .fixed_terms()
            .iter()
            .map(|&term| NamedValue::new(term.name(), true_coefficient(design, term, uses_time)))
            .collect(),
        variance: variance_values(&VarianceComponents::from_design(design), &model_levels(sim)),
    }
}

// --- One replication ---

struct Context<'a> {
    design: &'a StudyDesign,
    design_index: usize,
    formulas: &'a SimFormulaCompare,
    options: &'a SimOptions,
    fitter: &'a dyn ModelFitter,
}

fn wald_p_value(z: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => 2.0 * (1.0 - normal.cdf(z.abs())),
        Err(_) => f64::NAN,
    }
}

fn t_p_value(t: f64, df: f64) -> Option<f64> {
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some(2.0 * (1.0 - dist.cdf(t.abs())))
}

/// Satterthwaite df of the tested coefficient at the fitted variance components.
fn fitted_df(sim: &SimFormula, data: &RealizedDataset, out: &FitOutput) -> Result<f64, DfError> {
    let re = sim.formula.re_structure().restrict(&out.variance_components);
    let structure = VarianceStructure::for_model(
        &re,
        &out.variance_components,
        &data.layout(),
    )?;
    let x = sim.formula.design_matrix(structure.rows());
    let contrast = sim
        .contrast()
        .map_err(|e| DfError::DfNotFinite(e.to_string()))?;
    let params = structure.params();
    let info = satterthwaite::information_matrix(&structure, &x, &params)?;
    let acov = linalg::spd_inverse(&info)?;
    let estimate = satterthwaite::degrees_of_freedom(&params, &acov, |p| {
        satterthwaite::contrast_variance(&structure, &x, &contrast, p)
    })?;
    Ok(estimate.df)
}

fn record_fit(
    ctx: &Context<'_>,
    name: &str,
    sim: &SimFormula,
    data: &RealizedDataset,
    out: FitOutput,
) -> FitRecord {
    let n_cov = sim.formula.n_covariance_params();
    let n_obs = data.n_observed();
    let p = out.coefficient_names.len();
    if out.beta.len() != p || out.vcov.dim() != (p, p) {
        return FitRecord::failed(
            name,
            n_cov,
            n_obs,
            format!(
                "fitter returned {} names, {} estimates and a {:?} covariance",
                p,
                out.beta.len(),
                out.vcov.dim()
            ),
        );
    }

    let test_name = sim.test.name();
    let df_result = ctx
        .options
        .satterthwaite
        .then(|| fitted_df(sim, data, &out));

    let coefficients = out
        .coefficient_names
        .iter()
        .enumerate()
        .map(|(i, coef)| {
            let estimate = out.beta[i];
            let se = out.vcov[(i, i)].max(0.0).sqrt();
            let z = estimate / se;
            let mut record = CoefficientRecord {
                name: coef.clone(),
                estimate,
                se,
                p_value: wald_p_value(z),
                df: None,
                p_value_satterthwaite: None,
                df_warning: None,
            };
            if coef == test_name {
                match &df_result {
                    Some(Ok(df)) => {
                        record.df = Some(*df);
                        record.p_value_satterthwaite = t_p_value(z, *df);
                    }
                    Some(Err(err)) => record.df_warning = Some(err.to_string()),
                    None => {}
                }
            }
            record
        })
        .collect();

    let status = if out.converged {
        FitStatus::Completed
    } else {
        FitStatus::ConvergenceWarning
    };
    FitRecord {
        model: name.to_string(),
        status,
        warnings: out.warnings,
        error: None,
        coefficients,
        variance: variance_values(&out.variance_components, &model_levels(sim)),
        loglik: Some(out.loglik),
        n_covariance_params: n_cov,
        n_obs,
    }
}

fn run_replication(ctx: &Context<'_>, replication: usize) -> ReplicationRecord {
    let seed = replication_seed(ctx.options.seed, ctx.design_index, replication);
    let mut rng = StdRng::seed_from_u64(seed);
    let failed = |reason: String| ReplicationRecord {
        replication,
        seed,
        failure: Some(reason),
        fits: Vec::new(),
    };

    let mut data = match RealizedDataset::generate(ctx.design, &mut rng) {
        Ok(data) => data,
        Err(err) => return failed(err.to_string()),
    };
    data.apply_dropout(ctx.design, &mut rng);
    if let Err(err) = VarianceStructure::build(ctx.design, &data.layout()) {
        debug!("Replication {replication} unusable: {err}");
        return failed(err.to_string());
    }

    let fits = ctx
        .formulas
        .iter()
        .map(|(name, sim)| {
            let transformed = sim.transform.apply(&data);
            let request = FitRequest {
                model: name,
                formula: &sim.formula,
                data: &transformed,
                design: ctx.design,
                replication,
            };
            match ctx.fitter.fit(&request) {
                Ok(out) => record_fit(ctx, name, sim, &transformed, out),
                Err(err) => {
                    debug!("Replication {replication}, model {name}: {err}");
                    FitRecord::failed(
                        name,
                        sim.formula.n_covariance_params(),
                        transformed.n_observed(),
                        err.to_string(),
                    )
                }
            }
        })
        .collect();

    ReplicationRecord {
        replication,
        seed,
        failure: None,
        fits,
    }
}

fn analytical_power(design: &StudyDesign) -> Option<f64> {
    match power::get_power(design, &PowerOptions::default()) {
        Ok(result) => Some(result.power_t.unwrap_or(result.power_z)),
        Err(err) => {
            warn!("Analytical power unavailable for {}: {err}", design.label());
            None
        }
    }
}

/// Runs the Monte Carlo evaluation of every design in `input` against every model
/// in `formulas`.
pub fn simulate(
    input: impl Into<SimulationInput>,
    formulas: &SimFormulaCompare,
    options: &SimOptions,
    fitter: &dyn ModelFitter,
) -> Result<SimulationResult, SimError> {
    let input = input.into();
    if options.nsim == 0 {
        return Err(SimError::NoReplications);
    }
    if formulas.is_empty() {
        return Err(FormulaError::NoModels.into());
    }
    for (_, sim) in formulas.iter() {
        sim.contrast()?;
    }
    if let SimulationInput::Grid(params) = &input {
        params.check()?;
    }

    let pool = if options.cores > 1 {
        Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(options.cores)
                .build()
                .map_err(|e| SimError::ThreadPool(e.to_string()))?,
        )
    } else {
        None
    };

    let n_designs = input.len();
    info!(
        "Simulating {} design(s) x {} replications with {} model(s) on {} core(s)",
        n_designs,
        options.nsim,
        formulas.len(),
        options.cores.max(1)
    );
    let pb = create_progress_bar((n_designs * options.nsim) as u64, options.progress);

    let mut points = Vec::with_capacity(n_designs);
    for (design_index, design) in input.designs()?.enumerate() {
        let design = design?;
        let label = design.label();
        pb.set_message(label.clone());
        info!("Design {}/{}: {}", design_index + 1, n_designs, label);

        let ctx = Context {
            design: &design,
            design_index,
            formulas,
            options,
            fitter,
        };
        let run = |replication: usize| {
            let record = run_replication(&ctx, replication);
            pb.inc(1);
            record
        };
        let replications: Vec<ReplicationRecord> = match &pool {
            Some(pool) => pool.install(|| (0..options.nsim).into_par_iter().map(run).collect()),
            None => (0..options.nsim).map(run).collect(),
        };

        let failed = replications.iter().filter(|r| r.failure.is_some()).count();
        if failed > 0 {
            warn!("{failed} of {} replications failed for {label}", options.nsim);
        }
        let fit_failures = replications
            .iter()
            .flat_map(|r| &r.fits)
            .filter(|f| f.status == FitStatus::FitFailed)
            .count();
        if fit_failures > 0 {
            warn!("{fit_failures} model fits failed for {label}");
        }

        points.push(DesignPoint {
            index: design_index,
            label,
            analytical_power: analytical_power(&design),
            truth: formulas
                .iter()
                .map(|(name, sim)| model_truth(&design, name, sim))
                .collect(),
            design,
            replications,
        });
    }
    pb.finish_and_clear();

    let result = SimulationResult {
        run: RunInfo {
            nsim: options.nsim,
            seed: options.seed,
            cores: options.cores.max(1),
            satterthwaite: options.satterthwaite,
        },
        formulas: formulas.describe(),
        designs: points,
    };
    if let Some(path) = &options.save {
        result.save(path)?;
        info!("Saved simulation result to {}", path.display());
    }
    Ok(result)
}

/// Estimates of one coefficient across replications, skipping failed fits.
pub fn estimates(point: &DesignPoint, model: &str, coefficient: &str) -> Array1<f64> {
    point
        .replications
        .iter()
        .filter_map(|r| r.fit(model))
        .filter(|f| f.status.has_estimates())
        .filter_map(|f| f.coefficient(coefficient).map(|c| c.estimate))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::dropout::Dropout;
    use crate::design::study::{ClusterSizes, EffectSize, LevelVariance, PerArm};
    use crate::simulate::fit::{FitError, KnownVarianceFitter};

    fn design() -> StudyDesign {
        StudyDesign {
            n1: 4,
            t_end: 3.0,
            clusters: PerArm::same(ClusterSizes::Equal { n2: 4, n3: 3 }),
            fixed_intercept: 0.0,
            fixed_slope: 0.0,
            subject: LevelVariance::new(1.0, 0.3, 0.0),
            cluster: LevelVariance::new(0.5, 0.2, 0.0),
            sigma_error: 1.0,
            effect: EffectSize::Raw(1.0),
            dropout: PerArm::same(Dropout::weibull(0.2, 1.0)),
            deterministic_dropout: true,
            partially_nested: false,
        }
        .validated()
        .unwrap()
    }

    fn models() -> SimFormulaCompare {
        SimFormulaCompare::from(
            SimFormula::parse("y ~ time * treatment + (1 + time | subject) + (1 + time | cluster)")
                .unwrap(),
        )
    }

    #[test]
    fn seeds_differ_by_design_and_replication() {
        let a = replication_seed(1, 0, 0);
        assert_ne!(a, replication_seed(1, 0, 1));
        assert_ne!(a, replication_seed(1, 1, 0));
        assert_ne!(a, replication_seed(2, 0, 0));
        assert_eq!(a, replication_seed(1, 0, 0));
    }

    #[test]
    fn true_coefficients_follow_the_model_scale() {
        let d = design();
        assert_eq!(true_coefficient(&d, FixedTerm::TimeTreatment, true), 1.0 / 3.0);
        assert_eq!(true_coefficient(&d, FixedTerm::Treatment, true), 0.0);
        assert_eq!(true_coefficient(&d, FixedTerm::Treatment, false), 1.0);
    }

    #[test]
    fn serial_and_parallel_runs_are_identical() {
        let options = SimOptions {
            nsim: 6,
            seed: 99,
            ..Default::default()
        };
        let serial = simulate(design(), &models(), &options, &KnownVarianceFitter).unwrap();
        let parallel = simulate(
            design(),
            &models(),
            &SimOptions {
                cores: 3,
                ..options.clone()
            },
            &KnownVarianceFitter,
        )
        .unwrap();
        assert_eq!(
            serial.designs[0].replications,
            parallel.designs[0].replications
        );
        assert_eq!(serial.designs[0].replications.len(), 6);
    }

    #[test]
    fn failing_fitter_does_not_abort_the_batch() {
        let failing = |_: &FitRequest<'_>| -> Result<FitOutput, FitError> {
            Err(FitError::Failed("did not converge".to_string()))
        };
        let options = SimOptions {
            nsim: 3,
            ..Default::default()
        };
        let result = simulate(design(), &models(), &options, &failing).unwrap();
        let reps = &result.designs[0].replications;
        assert_eq!(reps.len(), 3);
        for rep in reps {
            assert_eq!(rep.fits[0].status, FitStatus::FitFailed);
            assert!(rep.fits[0].error.as_deref().unwrap().contains("did not converge"));
        }
    }

    #[test]
    fn user_errors_fail_before_running() {
        let err = simulate(
            design(),
            &models(),
            &SimOptions {
                nsim: 0,
                ..Default::default()
            },
            &KnownVarianceFitter,
        );
        assert!(matches!(err, Err(SimError::NoReplications)));
        let err = simulate(
            design(),
            &SimFormulaCompare::new(),
            &SimOptions::default(),
            &KnownVarianceFitter,
        );
        assert!(matches!(err, Err(SimError::Formula(FormulaError::NoModels))));
    }

    #[test]
    fn satterthwaite_df_is_recorded_for_the_test_coefficient() {
        let options = SimOptions {
            nsim: 2,
            satterthwaite: true,
            ..Default::default()
        };
        let result = simulate(design(), &models(), &options, &KnownVarianceFitter).unwrap();
        for rep in &result.designs[0].replications {
            let fit = &rep.fits[0];
            let coef = fit.coefficient("time:treatment").unwrap();
            assert!(coef.df.unwrap() >= 1.0);
            assert!(coef.p_value_satterthwaite.unwrap() >= coef.p_value);
            assert!(fit.coefficient("time").unwrap().df.is_none());
        }
    }

    #[test]
    fn boundary_variance_keeps_the_satterthwaite_df() {
        let no_cluster_slope = design()
            .update(|d| d.cluster = LevelVariance::new(0.5, 0.0, 0.0))
            .unwrap();
        let options = SimOptions {
            nsim: 3,
            satterthwaite: true,
            ..Default::default()
        };
        let result = simulate(no_cluster_slope, &models(), &options, &KnownVarianceFitter).unwrap();
        for rep in &result.designs[0].replications {
            let coef = rep.fits[0].coefficient("time:treatment").unwrap();
            assert!(coef.df_warning.is_none(), "{:?}", coef.df_warning);
            assert!(coef.df.unwrap() >= 1.0);
            assert!(coef.p_value_satterthwaite.is_some());
        }
    }
}
