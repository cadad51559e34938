#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use lmmpower::design::formula::{DataTransform, Formula, SimFormula, SimFormulaCompare};
use lmmpower::design::params::StudyParameters;
use lmmpower::design::study::{Arm, DesignLevel};
use lmmpower::power::{DfMethod, PowerOptions, get_power, monte_carlo_table};
use lmmpower::simulate::engine::{SimOptions, simulate};
use lmmpower::simulate::fit::KnownVarianceFitter;
use lmmpower::simulate::records::SimulationResult;
use lmmpower::simulate::summary::{ModelSelection, ParaSelection, SummaryOptions, summarize};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Clone, Copy, ValueEnum)]
pub enum DfMethodCli {
    Auto,
    ClosedForm,
    Satterthwaite,
}

impl From<DfMethodCli> for DfMethod {
    fn from(value: DfMethodCli) -> Self {
        match value {
            DfMethodCli::Auto => DfMethod::Auto,
            DfMethodCli::ClosedForm => DfMethod::ClosedForm,
            DfMethodCli::Satterthwaite => DfMethod::Satterthwaite,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModelSelectionCli {
    /// Forward selection by likelihood-ratio tests
    Fw,
}

#[derive(Args)]
pub struct PowerArgs {
    /// Study definition (.toml)
    pub study: PathBuf,

    /// Two-sided significance level
    #[arg(long, default_value = "0.05")]
    pub alpha: f64,

    /// How the t-test degrees of freedom are obtained
    #[arg(long, value_enum, default_value_t = DfMethodCli::Auto)]
    pub df_method: DfMethodCli,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Study definition (.toml)
    pub study: PathBuf,

    /// Replications per design
    #[arg(long, default_value = "1000")]
    pub nsim: usize,

    /// Worker threads (defaults to all logical cores)
    #[arg(long)]
    pub cores: Option<usize>,

    /// Base seed; each replication derives its own stream from it
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Compute Satterthwaite df and p-values for the tested coefficients
    #[arg(long)]
    pub satterthwaite: bool,

    /// Save the full result to this TOML file
    #[arg(long, value_name = "PATH")]
    pub save: Option<PathBuf>,

    /// Model to fit, as NAME=FORMULA; repeat for several models, in selection order
    #[arg(long = "formula", value_name = "NAME=FORMULA")]
    pub formulas: Vec<String>,

    /// Coefficient tested by a model, as NAME=COEFFICIENT
    #[arg(long = "test", value_name = "NAME=COEFFICIENT")]
    pub tests: Vec<String>,

    /// Fit this model to the last time point only
    #[arg(long = "posttest", value_name = "NAME")]
    pub posttest: Vec<String>,

    /// Show a progress bar
    #[arg(long)]
    pub progress: bool,

    /// Significance level of the printed summary
    #[arg(long, default_value = "0.05")]
    pub alpha: f64,
}

#[derive(Args)]
pub struct SummaryArgs {
    /// Saved simulation result (.toml)
    pub result: PathBuf,

    /// Coefficients to summarise: COEFFICIENT for every model, or MODEL=COEFFICIENT
    #[arg(long)]
    pub para: Vec<String>,

    /// Restrict the summary to these models, in this order
    #[arg(long = "model")]
    pub models: Vec<String>,

    /// Model-selection strategy applied across the models
    #[arg(long, value_enum)]
    pub model_selection: Option<ModelSelectionCli>,

    /// Significance level of the likelihood-ratio tests during selection
    #[arg(long, default_value = "0.1")]
    pub lrt_alpha: f64,

    /// Significance level for power
    #[arg(long, default_value = "0.05")]
    pub alpha: f64,
}

fn split_pair<'a>(text: &'a str, what: &str) -> Result<(&'a str, &'a str), String> {
    text.split_once('=')
        .map(|(a, b)| (a.trim(), b.trim()))
        .filter(|(a, b)| !a.is_empty() && !b.is_empty())
        .ok_or_else(|| format!("expected {what}, found '{text}'"))
}

fn run_power(args: PowerArgs) -> CliResult {
    let params = StudyParameters::load(&args.study)?;
    let options = PowerOptions {
        alpha: args.alpha,
        df_method: args.df_method.into(),
    };
    for design in params.designs()? {
        let result = get_power(&design?, &options)?;
        println!("{result}");
    }
    Ok(())
}

fn run_describe(study: PathBuf) -> CliResult {
    let params = StudyParameters::load(&study)?;
    for design in params.designs()? {
        let design = design?;
        println!("{design}");
        println!(
            "  {:>6} {:>10} {:>10} {:>8} {:>8} {:>8}",
            "time", "sd_control", "sd_treat", "cluster", "subject", "error"
        );
        let partition = design.variance_partition(Arm::Treatment);
        for (sd, share) in design.sds().iter().zip(&partition) {
            println!(
                "  {:>6.2} {:>10.4} {:>10.4} {:>8.3} {:>8.3} {:>8.3}",
                sd.time, sd.control, sd.treatment, share.cluster, share.subject, share.error
            );
        }
        println!();
    }
    Ok(())
}

fn build_models(args: &SimulateArgs, three_level: bool) -> Result<SimFormulaCompare, Box<dyn std::error::Error>> {
    let mut models = SimFormulaCompare::new();
    if args.formulas.is_empty() {
        models.push("default", SimFormula::new(Formula::full(three_level))?)?;
    }
    for entry in &args.formulas {
        let (name, text) = split_pair(entry, "NAME=FORMULA")?;
        models.push(name, SimFormula::parse(text)?)?;
    }
    let mut resolved = SimFormulaCompare::new();
    for (name, sim) in models.iter() {
        let mut sim = sim.clone();
        for entry in &args.tests {
            let (model, coef) = split_pair(entry, "NAME=COEFFICIENT")?;
            if model == name {
                sim = sim.with_test(coef)?;
            }
        }
        if args.posttest.iter().any(|p| p == name) {
            sim = sim.with_transform(DataTransform::Posttest);
        }
        resolved.push(name, sim)?;
    }
    for model in args.posttest.iter().map(String::as_str).chain(
        args.tests
            .iter()
            .filter_map(|t| t.split_once('=').map(|(m, _)| m)),
    ) {
        let model = model.trim();
        if resolved.get(model).is_none() {
            return Err(format!("unknown model '{model}'").into());
        }
    }
    Ok(resolved)
}

fn run_simulate(args: SimulateArgs) -> CliResult {
    let params = StudyParameters::load(&args.study)?;
    let mut three_level = false;
    for design in params.designs()? {
        three_level |= design?.level() != DesignLevel::TwoLevel;
    }
    let models = build_models(&args, three_level)?;
    let options = SimOptions {
        nsim: args.nsim,
        cores: args.cores.unwrap_or_else(num_cpus::get),
        seed: args.seed,
        satterthwaite: args.satterthwaite,
        save: args.save.clone(),
        progress: args.progress,
    };
    let result = simulate(params, &models, &options, &KnownVarianceFitter)?;
    let summary = summarize(
        &result,
        &SummaryOptions {
            alpha: args.alpha,
            ..Default::default()
        },
    )?;
    print!("{summary}");
    if let Some(path) = &args.save {
        println!("Simulation result saved to: {}", path.display());
    }
    Ok(())
}

fn parse_para(entries: &[String]) -> Result<ParaSelection, String> {
    if entries.is_empty() {
        return Ok(ParaSelection::Tested);
    }
    let pairs: Vec<Option<(String, String)>> = entries
        .iter()
        .map(|e| split_pair(e, "MODEL=COEFFICIENT").ok().map(|(m, c)| (m.to_string(), c.to_string())))
        .collect();
    if pairs.iter().all(Option::is_some) {
        Ok(ParaSelection::PerModel(pairs.into_iter().flatten().collect()))
    } else if pairs.iter().all(Option::is_none) {
        Ok(ParaSelection::Coefficients(entries.to_vec()))
    } else {
        Err("--para takes either COEFFICIENT or MODEL=COEFFICIENT entries, not both".to_string())
    }
}

fn run_summary(args: SummaryArgs) -> CliResult {
    let result = SimulationResult::load(&args.result)?;
    let options = SummaryOptions {
        alpha: args.alpha,
        para: parse_para(&args.para)?,
        models: (!args.models.is_empty()).then(|| args.models.clone()),
        model_selection: args.model_selection.map(|ModelSelectionCli::Fw| ModelSelection::Forward),
        lrt_alpha: args.lrt_alpha,
    };
    print!("{}", summarize(&result, &options)?);
    Ok(())
}

fn run_mcse(power: f64, nsim: Vec<usize>) -> CliResult {
    if !(0.0..=1.0).contains(&power) {
        return Err(format!("power must lie in [0, 1], found {power}").into());
    }
    println!("{:>8} {:>10} {:>8} {:>8}", "nsim", "half-width", "lower", "upper");
    for row in monte_carlo_table(power, &nsim) {
        println!(
            "{:>8} {:>10.4} {:>8.4} {:>8.4}",
            row.nsim, row.half_width, row.lower, row.upper
        );
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "lmmpower",
    about = "Power analysis for longitudinal multilevel trials",
    long_about = "Analytical power and Monte Carlo evaluation for two- and three-level \
                 longitudinal designs, including partially nested designs and dropout."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Analytical power for every design in a study file
    #[command(about = "Analytical power of the treatment-by-time test")]
    Power(PowerArgs),

    /// Print each design with its variance partition
    #[command(about = "Describe the designs in a study file")]
    Describe {
        /// Study definition (.toml)
        study: PathBuf,
    },

    /// Monte Carlo evaluation of one or more models
    #[command(about = "Simulate designs and fit models (optionally saves a .toml result)")]
    Simulate(SimulateArgs),

    /// Summarise a saved simulation result
    #[command(about = "Summarise a saved simulation result")]
    Summary(SummaryArgs),

    /// Monte Carlo precision of a power estimate
    #[command(about = "Half-width of the 95% interval of a simulated power")]
    Mcse {
        /// Expected power
        #[arg(long)]
        power: f64,

        /// Replication counts to tabulate
        #[arg(long, num_args = 1.., default_values_t = vec![100, 500, 1000, 5000])]
        nsim: Vec<usize>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Power(args)) => run_power(args),
        Some(Commands::Describe { study }) => run_describe(study),
        Some(Commands::Simulate(args)) => run_simulate(args),
        Some(Commands::Summary(args)) => run_summary(args),
        Some(Commands::Mcse { power, nsim }) => run_mcse(power, nsim),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmmpower::design::formula::FixedTerm;

    fn simulate_args(extra: &[&str]) -> SimulateArgs {
        let argv = ["lmmpower", "simulate", "study.toml"].iter().chain(extra).copied();
        match Cli::try_parse_from(argv) {
            Ok(Cli {
                command: Some(Commands::Simulate(args)),
            }) => args,
            Ok(_) => panic!("expected the simulate subcommand"),
            Err(e) => panic!("arguments did not parse: {e}"),
        }
    }

    #[test]
    fn posttest_and_test_flags_apply_to_their_models() {
        let args = simulate_args(&[
            "--formula",
            "long=y ~ time * treatment + (1 + time | subject)",
            "--formula",
            "post=y ~ treatment",
            "--test",
            "post=treatment",
            "--posttest",
            "post",
        ]);
        let models = build_models(&args, false).unwrap();
        let post = models.get("post").unwrap();
        assert_eq!(post.test, FixedTerm::Treatment);
        assert!(matches!(post.transform, DataTransform::Posttest));
        let long = models.get("long").unwrap();
        assert_eq!(long.test, FixedTerm::TimeTreatment);
        assert!(matches!(long.transform, DataTransform::Identity));
    }

    #[test]
    fn flags_naming_unknown_models_are_rejected() {
        let posttest = simulate_args(&["--posttest", "missing"]);
        let err = build_models(&posttest, false).unwrap_err();
        assert!(err.to_string().contains("unknown model 'missing'"));

        let test = simulate_args(&["--test", "missing=treatment"]);
        assert!(build_models(&test, false).is_err());
    }
}
