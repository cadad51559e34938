use lmmpower::design::formula::{DataTransform, SimFormula, SimFormulaCompare};
use lmmpower::design::params::StudyParameters;
use lmmpower::design::study::StudyDesign;
use lmmpower::power::{PowerOptions, get_power, monte_carlo_se};
use lmmpower::simulate::engine::{SimOptions, simulate};
use lmmpower::simulate::fit::{FitError, FitOutput, FitRequest, KnownVarianceFitter, ModelFitter};
use lmmpower::simulate::records::{FitStatus, SimulationResult};
use lmmpower::simulate::summary::{SummaryOptions, summarize};
use std::collections::BTreeMap;
use std::sync::Mutex;

const FULL: &str = "y ~ time * treatment + (1 + time | subject) + (1 + time | cluster)";
const SUBJECT_ONLY: &str = "y ~ time * treatment + (1 + time | subject)";

fn partially_nested(dropout: f64) -> StudyDesign {
    let mut params = StudyParameters::from_toml_str(
        r#"
n1 = 11
n2 = 10
n3 = 6
partially_nested = true
deterministic_dropout = false
sigma_error = 10.0
icc_pre_subject = 0.5
icc_pre_cluster = 0.1
var_ratio = 0.03
icc_slope = 0.05
cor_subject = -0.5
cohend = -0.8
"#,
    )
    .unwrap();
    if dropout > 0.0 {
        params.dropout = Some(dropout.into());
    }
    params.build().unwrap()
}

fn small_design() -> StudyDesign {
    let mut design = partially_nested(0.2);
    design.n1 = 5;
    design.t_end = 4.0;
    design.validated().unwrap()
}

fn two_models() -> SimFormulaCompare {
    SimFormulaCompare::new()
        .with("full", SimFormula::parse(FULL).unwrap())
        .unwrap()
        .with("subject", SimFormula::parse(SUBJECT_ONLY).unwrap())
        .unwrap()
}

#[test]
fn same_seed_reproduces_the_run() {
    let options = SimOptions {
        nsim: 4,
        seed: 2024,
        cores: 2,
        ..Default::default()
    };
    let a = simulate(small_design(), &two_models(), &options, &KnownVarianceFitter).unwrap();
    let b = simulate(small_design(), &two_models(), &options, &KnownVarianceFitter).unwrap();
    assert_eq!(a, b);

    let c = simulate(
        small_design(),
        &two_models(),
        &SimOptions {
            seed: 2025,
            ..options.clone()
        },
        &KnownVarianceFitter,
    )
    .unwrap();
    assert_ne!(a.designs[0].replications, c.designs[0].replications);
}

#[test]
fn every_model_sees_the_same_dataset() {
    // (replication, model) -> sum of the observed outcomes
    let seen: Mutex<BTreeMap<(usize, String), (usize, f64)>> = Mutex::new(BTreeMap::new());
    let recording = |request: &FitRequest<'_>| -> Result<FitOutput, FitError> {
        let y = request.data.observed_y();
        seen.lock().unwrap().insert(
            (request.replication, request.model.to_string()),
            (y.len(), y.sum()),
        );
        KnownVarianceFitter.fit(request)
    };
    let options = SimOptions {
        nsim: 3,
        ..Default::default()
    };
    simulate(small_design(), &two_models(), &options, &recording).unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 6);
    for replication in 0..3 {
        let full = seen[&(replication, "full".to_string())];
        let subject = seen[&(replication, "subject".to_string())];
        assert_eq!(full, subject);
    }
    assert_ne!(
        seen[&(0, "full".to_string())],
        seen[&(1, "full".to_string())]
    );
}

#[test]
fn posttest_models_fit_the_last_time_point() {
    let design = small_design();
    let models = SimFormulaCompare::new()
        .with("long", SimFormula::parse(FULL).unwrap())
        .unwrap()
        .with(
            "post",
            SimFormula::parse("y ~ treatment")
                .unwrap()
                .with_transform(DataTransform::Posttest),
        )
        .unwrap();
    let options = SimOptions {
        nsim: 2,
        ..Default::default()
    };
    let result = simulate(design.clone(), &models, &options, &KnownVarianceFitter).unwrap();
    for rep in &result.designs[0].replications {
        let long = rep.fit("long").unwrap();
        let post = rep.fit("post").unwrap();
        assert!(post.n_obs < long.n_obs);
        assert!(post.coefficient("treatment").is_some());
    }
    let truth = result.designs[0].truth("post").unwrap();
    assert_eq!(truth.coefficient("treatment"), Some(design.effect_at_end()));
}

#[test]
fn failed_fits_are_recorded_not_raised() {
    let flaky = |request: &FitRequest<'_>| -> Result<FitOutput, FitError> {
        if request.replication % 2 == 0 {
            Err(FitError::Failed("singular fit".to_string()))
        } else {
            KnownVarianceFitter.fit(request)
        }
    };
    let options = SimOptions {
        nsim: 4,
        ..Default::default()
    };
    let models = SimFormulaCompare::from(SimFormula::parse(FULL).unwrap());
    let result = simulate(small_design(), &models, &options, &flaky).unwrap();
    let point = &result.designs[0];
    assert_eq!(point.replications.len(), 4);
    let failed = point
        .replications
        .iter()
        .filter(|r| r.fits[0].status == FitStatus::FitFailed)
        .count();
    assert_eq!(failed, 2);

    let summary = summarize(&result, &SummaryOptions::default()).unwrap();
    let model = &summary.designs[0].models[0];
    assert_eq!(model.failed, 2);
    assert_eq!(model.coefficients[0].valid, 2);
}

#[test]
fn saved_results_reload_and_summarise_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("result.toml");
    let options = SimOptions {
        nsim: 3,
        satterthwaite: true,
        save: Some(path.clone()),
        ..Default::default()
    };
    let result = simulate(small_design(), &two_models(), &options, &KnownVarianceFitter).unwrap();
    assert!(path.exists());

    let loaded = SimulationResult::load(&path).unwrap();
    assert_eq!(loaded.model_names(), vec!["full", "subject"]);
    assert_eq!(loaded.designs[0].replications.len(), 3);
    assert!(loaded.run.satterthwaite);

    let summary_options = SummaryOptions::default();
    assert_eq!(
        summarize(&loaded, &summary_options).unwrap(),
        summarize(&result, &summary_options).unwrap()
    );
}

fn empirical_power_matches_analytical(nsim: usize) {
    let design = partially_nested(0.3);
    let analytical = get_power(&design, &PowerOptions::default()).unwrap();
    let models = SimFormulaCompare::from(SimFormula::parse(FULL).unwrap());
    let options = SimOptions {
        nsim,
        seed: 7,
        cores: 4,
        ..Default::default()
    };
    let result = simulate(design, &models, &options, &KnownVarianceFitter).unwrap();
    let summary = summarize(&result, &SummaryOptions::default()).unwrap();
    let design_summary = &summary.designs[0];
    assert_eq!(design_summary.failed_replications, 0);
    assert!(design_summary.analytical_power.is_some());

    let slope = &design_summary.models[0].coefficients[0];
    assert_eq!(slope.name, "time:treatment");
    assert_eq!(slope.valid, nsim);

    // Wald tests at the generating variances, so only Monte Carlo error separates the two.
    let tolerance = 2.5 * monte_carlo_se(analytical.power_z, nsim);
    assert!(
        (slope.power - analytical.power_z).abs() < tolerance,
        "empirical {} vs analytical {} (tolerance {tolerance})",
        slope.power,
        analytical.power_z
    );
    let se_ratio = slope.mean_se / analytical.se;
    assert!((0.9..1.1).contains(&se_ratio), "se ratio {se_ratio}");
    assert!(slope.bias.unwrap().abs() < 3.0 * slope.empirical_sd / (nsim as f64).sqrt() + 0.05);
}

#[test]
fn empirical_power_is_close_to_analytical_power() {
    empirical_power_matches_analytical(300);
}

#[test]
#[ignore = "slow; runs 5000 replications"]
fn empirical_power_is_close_to_analytical_power_at_scale() {
    empirical_power_matches_analytical(5000);
}
