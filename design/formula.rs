// design/formula.rs

//! Structured model formulas.
//!
//! Formulas are parsed from lme4-style text once, validated, and carried as an AST.
//! `Display` renders the canonical text handed to the model-fit collaborator, so
//! the same model always serialises to the same string.

use crate::design::structure::{GroupLevel, LayoutRow, ReStructure, ReTerms};
use crate::simulate::data::RealizedDataset;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Malformed formula '{formula}': {reason}")]
    Malformed { formula: String, reason: String },
    #[error("Unknown term '{0}'; fixed terms are 1, treatment, time and time:treatment")]
    UnknownTerm(String),
    #[error("Unknown grouping factor '{0}'; use subject or cluster")]
    UnknownGrouping(String),
    #[error("The {0} grouping factor appears in more than one random term")]
    DuplicateGrouping(GroupLevel),
    #[error("Coefficient '{name}' is not estimated by '{formula}'")]
    ContrastNotFound { name: String, formula: String },
    #[error("Model name '{0}' is used more than once")]
    DuplicateModel(String),
    #[error("At least one model formula is required")]
    NoModels,
}

// --- Terms ---

/// Fixed-effect columns the generating model knows about, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FixedTerm {
    Intercept,
    Treatment,
    Time,
    TimeTreatment,
}

impl FixedTerm {
    pub const ALL: [FixedTerm; 4] = [
        FixedTerm::Intercept,
        FixedTerm::Treatment,
        FixedTerm::Time,
        FixedTerm::TimeTreatment,
    ];

    /// Coefficient name as reported by the fit.
    pub fn name(self) -> &'static str {
        match self {
            FixedTerm::Intercept => "(Intercept)",
            FixedTerm::Treatment => "treatment",
            FixedTerm::Time => "time",
            FixedTerm::TimeTreatment => "time:treatment",
        }
    }

    pub fn from_name(name: &str) -> Option<FixedTerm> {
        match name {
            "(Intercept)" | "1" => Some(FixedTerm::Intercept),
            "treatment" => Some(FixedTerm::Treatment),
            "time" => Some(FixedTerm::Time),
            "time:treatment" | "treatment:time" => Some(FixedTerm::TimeTreatment),
            _ => None,
        }
    }

    pub fn value(self, treatment: f64, time: f64) -> f64 {
        match self {
            FixedTerm::Intercept => 1.0,
            FixedTerm::Treatment => treatment,
            FixedTerm::Time => time,
            FixedTerm::TimeTreatment => time * treatment,
        }
    }

    fn uses_time(self) -> bool {
        matches!(self, FixedTerm::Time | FixedTerm::TimeTreatment)
    }
}

/// `(lhs | group)` or `(lhs || group)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomTerm {
    pub group: GroupLevel,
    pub terms: ReTerms,
}

impl fmt::Display for RandomTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lhs, bar) = match self.terms {
            ReTerms::Intercept => ("1", "|"),
            ReTerms::Slope => ("0 + time", "|"),
            ReTerms::Uncorrelated => ("1 + time", "||"),
            ReTerms::Correlated => ("1 + time", "|"),
        };
        write!(f, "({lhs} {bar} {})", self.group)
    }
}

// --- Formula ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    fixed: Vec<FixedTerm>,
    random: Vec<RandomTerm>,
}

impl Formula {
    pub fn new(fixed: Vec<FixedTerm>, random: Vec<RandomTerm>) -> Result<Self, FormulaError> {
        let mut fixed = fixed;
        fixed.sort();
        fixed.dedup();
        let mut random = random;
        random.sort_by_key(|term| term.group == GroupLevel::Cluster);
        if random.len() == 2 && random[0].group == random[1].group {
            return Err(FormulaError::DuplicateGrouping(random[0].group));
        }
        if random.len() > 2 {
            return Err(FormulaError::DuplicateGrouping(random[2].group));
        }
        Ok(Formula { fixed, random })
    }

    /// The full generating model: `y ~ treatment * time + (1 + time | subject)`
    /// plus the cluster term when `with_cluster` is set.
    pub fn full(with_cluster: bool) -> Self {
        let mut random = vec![RandomTerm {
            group: GroupLevel::Subject,
            terms: ReTerms::Correlated,
        }];
        if with_cluster {
            random.push(RandomTerm {
                group: GroupLevel::Cluster,
                terms: ReTerms::Correlated,
            });
        }
        Formula {
            fixed: FixedTerm::ALL.to_vec(),
            random,
        }
    }

    pub fn fixed_terms(&self) -> &[FixedTerm] {
        &self.fixed
    }

    pub fn random_terms(&self) -> &[RandomTerm] {
        &self.random
    }

    pub fn coefficient_names(&self) -> Vec<String> {
        self.fixed.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn re_structure(&self) -> ReStructure {
        let mut re = ReStructure::default();
        for term in &self.random {
            match term.group {
                GroupLevel::Subject => re.subject = Some(term.terms),
                GroupLevel::Cluster => re.cluster = Some(term.terms),
            }
        }
        re
    }

    /// Number of covariance parameters, residual SD included.
    pub fn n_covariance_params(&self) -> usize {
        self.re_structure().n_theta() + 1
    }

    pub fn uses_time(&self) -> bool {
        self.fixed.iter().any(|t| t.uses_time())
            || self.random.iter().any(|t| t.terms != ReTerms::Intercept)
    }

    /// The coefficient tested by default: the treatment-by-time interaction when
    /// present, otherwise the treatment main effect.
    pub fn default_test(&self) -> Option<FixedTerm> {
        [FixedTerm::TimeTreatment, FixedTerm::Treatment]
            .into_iter()
            .find(|t| self.fixed.contains(t))
    }

    pub fn position(&self, term: FixedTerm) -> Option<usize> {
        self.fixed.iter().position(|&t| t == term)
    }

    /// Unit contrast selecting `term`.
    pub fn contrast(&self, term: FixedTerm) -> Result<Array1<f64>, FormulaError> {
        let idx = self
            .position(term)
            .ok_or_else(|| FormulaError::ContrastNotFound {
                name: term.name().to_string(),
                formula: self.to_string(),
            })?;
        let mut contrast = Array1::zeros(self.fixed.len());
        contrast[idx] = 1.0;
        Ok(contrast)
    }

    /// Fixed-effects design matrix over `rows`.
    pub fn design_matrix(&self, rows: &[LayoutRow]) -> Array2<f64> {
        Array2::from_shape_fn((rows.len(), self.fixed.len()), |(i, j)| {
            self.fixed[j].value(rows[i].arm.indicator(), rows[i].time)
        })
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if !self.fixed.contains(&FixedTerm::Intercept) {
            parts.push("0".to_string());
        } else if self.fixed.len() == 1 {
            parts.push("1".to_string());
        }
        parts.extend(
            self.fixed
                .iter()
                .filter(|&&t| t != FixedTerm::Intercept)
                .map(|t| t.name().to_string()),
        );
        parts.extend(self.random.iter().map(|t| t.to_string()));
        write!(f, "y ~ {}", parts.join(" + "))
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| FormulaError::Malformed {
            formula: text.to_string(),
            reason: reason.to_string(),
        };
        let (lhs, rhs) = text
            .split_once('~')
            .ok_or_else(|| malformed("missing '~'"))?;
        if lhs.trim() != "y" {
            return Err(malformed("the response must be y"));
        }

        let mut intercept = true;
        let mut fixed = Vec::new();
        let mut random = Vec::new();
        for term in split_top_level(rhs).map_err(|reason| malformed(reason))? {
            if let Some(inner) = term.strip_prefix('(') {
                let inner = inner
                    .strip_suffix(')')
                    .ok_or_else(|| malformed("unbalanced parentheses"))?;
                random.push(parse_random(inner).map_err(|e| match e {
                    FormulaError::Malformed { reason, .. } => malformed(&reason),
                    other => other,
                })?);
                continue;
            }
            match term.as_str() {
                "0" | "-1" => intercept = false,
                "1" => {}
                "" => return Err(malformed("empty term")),
                other => fixed.extend(parse_fixed(other)?),
            }
        }
        if intercept {
            fixed.push(FixedTerm::Intercept);
        }
        if fixed.is_empty() {
            return Err(malformed("no fixed effects"));
        }
        Formula::new(fixed, random)
    }
}

/// Splits on `+` outside parentheses, removing whitespace.
fn split_top_level(rhs: &str) -> Result<Vec<String>, &'static str> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    for ch in rhs.chars().filter(|c| !c.is_whitespace()) {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced parentheses");
                }
                current.push(ch);
            }
            '+' if depth == 0 => terms.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses");
    }
    terms.push(current);
    Ok(terms)
}

fn parse_fixed(term: &str) -> Result<Vec<FixedTerm>, FormulaError> {
    if let Some((a, b)) = term.split_once('*') {
        let a = FixedTerm::from_name(a).ok_or_else(|| FormulaError::UnknownTerm(a.to_string()))?;
        let b = FixedTerm::from_name(b).ok_or_else(|| FormulaError::UnknownTerm(b.to_string()))?;
        let pair = [a, b];
        if pair.contains(&FixedTerm::Time) && pair.contains(&FixedTerm::Treatment) {
            return Ok(vec![a, b, FixedTerm::TimeTreatment]);
        }
        return Err(FormulaError::UnknownTerm(term.to_string()));
    }
    match FixedTerm::from_name(term) {
        Some(FixedTerm::Intercept) | None => Err(FormulaError::UnknownTerm(term.to_string())),
        Some(t) => Ok(vec![t]),
    }
}

fn parse_random(inner: &str) -> Result<RandomTerm, FormulaError> {
    let malformed = |reason: &str| FormulaError::Malformed {
        formula: inner.to_string(),
        reason: reason.to_string(),
    };
    let (lhs, group, uncorrelated) = if let Some((lhs, group)) = inner.split_once("||") {
        (lhs, group, true)
    } else if let Some((lhs, group)) = inner.split_once('|') {
        (lhs, group, false)
    } else {
        return Err(malformed("random term needs '|'"));
    };
    let group = match group {
        "subject" => GroupLevel::Subject,
        "cluster" => GroupLevel::Cluster,
        other => return Err(FormulaError::UnknownGrouping(other.to_string())),
    };
    let mut intercept = true;
    let mut slope = false;
    for part in lhs.split('+') {
        match part {
            "1" => {}
            "0" | "-1" => intercept = false,
            "time" => slope = true,
            other => return Err(FormulaError::UnknownTerm(other.to_string())),
        }
    }
    let terms = match (intercept, slope) {
        (true, true) if uncorrelated => ReTerms::Uncorrelated,
        (true, true) => ReTerms::Correlated,
        (true, false) => ReTerms::Intercept,
        (false, true) => ReTerms::Slope,
        (false, false) => return Err(malformed("random term has no effects")),
    };
    Ok(RandomTerm { group, terms })
}

// --- Formulas used in simulation ---

type TransformFn = dyn Fn(&RealizedDataset) -> RealizedDataset + Send + Sync;

/// A reshaping applied to the shared dataset before one model is fitted.
#[derive(Clone, Default)]
pub enum DataTransform {
    #[default]
    Identity,
    /// Keep only the last time point.
    Posttest,
    Custom { label: String, apply: Arc<TransformFn> },
}

impl DataTransform {
    pub fn custom(
        label: impl Into<String>,
        apply: impl Fn(&RealizedDataset) -> RealizedDataset + Send + Sync + 'static,
    ) -> Self {
        DataTransform::Custom {
            label: label.into(),
            apply: Arc::new(apply),
        }
    }

    /// The data the model sees. The input is never modified.
    pub fn apply<'a>(&self, data: &'a RealizedDataset) -> Cow<'a, RealizedDataset> {
        match self {
            DataTransform::Identity => Cow::Borrowed(data),
            DataTransform::Posttest => Cow::Owned(data.posttest()),
            DataTransform::Custom { apply, .. } => Cow::Owned(apply(data)),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            DataTransform::Identity => "identity",
            DataTransform::Posttest => "posttest",
            DataTransform::Custom { label, .. } => label,
        }
    }
}

impl fmt::Debug for DataTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataTransform({})", self.label())
    }
}

/// A model to fit in every replication, with the coefficient it tests.
#[derive(Debug, Clone)]
pub struct SimFormula {
    pub formula: Formula,
    pub test: FixedTerm,
    pub transform: DataTransform,
}

impl SimFormula {
    pub fn new(formula: Formula) -> Result<Self, FormulaError> {
        let test = formula
            .default_test()
            .ok_or_else(|| FormulaError::ContrastNotFound {
                name: FixedTerm::Treatment.name().to_string(),
                formula: formula.to_string(),
            })?;
        Ok(SimFormula {
            formula,
            test,
            transform: DataTransform::Identity,
        })
    }

    pub fn parse(text: &str) -> Result<Self, FormulaError> {
        Self::new(text.parse()?)
    }

    pub fn with_test(mut self, name: &str) -> Result<Self, FormulaError> {
        let not_found = || FormulaError::ContrastNotFound {
            name: name.to_string(),
            formula: self.formula.to_string(),
        };
        let term = FixedTerm::from_name(name).ok_or_else(not_found)?;
        if self.formula.position(term).is_none() {
            return Err(not_found());
        }
        self.test = term;
        Ok(self)
    }

    pub fn with_transform(mut self, transform: DataTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn contrast(&self) -> Result<Array1<f64>, FormulaError> {
        self.formula.contrast(self.test)
    }

    pub fn describe(&self, name: &str) -> FormulaDescription {
        FormulaDescription {
            name: name.to_string(),
            formula: self.formula.to_string(),
            test: self.test.name().to_string(),
            transform: self.transform.label().to_string(),
            n_covariance_params: self.formula.n_covariance_params(),
        }
    }
}

/// Serialisable summary of a `SimFormula`, stored with simulation results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaDescription {
    pub name: String,
    pub formula: String,
    pub test: String,
    pub transform: String,
    pub n_covariance_params: usize,
}

/// Named models fitted side by side. Order is significant for forward selection.
#[derive(Debug, Clone, Default)]
pub struct SimFormulaCompare {
    models: Vec<(String, SimFormula)>,
}

impl SimFormulaCompare {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, formula: SimFormula) -> Result<(), FormulaError> {
        let name = name.into();
        if self.models.iter().any(|(existing, _)| *existing == name) {
            return Err(FormulaError::DuplicateModel(name));
        }
        self.models.push((name, formula));
        Ok(())
    }

    pub fn with(mut self, name: impl Into<String>, formula: SimFormula) -> Result<Self, FormulaError> {
        self.push(name, formula)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SimFormula)> {
        self.models.iter().map(|(name, f)| (name.as_str(), f))
    }

    pub fn get(&self, name: &str) -> Option<&SimFormula> {
        self.models
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, f)| f)
    }

    pub fn describe(&self) -> Vec<FormulaDescription> {
        self.iter().map(|(name, f)| f.describe(name)).collect()
    }
}

impl From<SimFormula> for SimFormulaCompare {
    fn from(formula: SimFormula) -> Self {
        SimFormulaCompare {
            models: vec![("default".to_string(), formula)],
        }
    }
}
