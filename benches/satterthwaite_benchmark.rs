use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use lmmpower::design::dropout::Dropout;
use lmmpower::design::formula::{FixedTerm, Formula};
use lmmpower::design::structure::{VarianceStructure, expected_layout};
use lmmpower::design::study::{ClusterSizes, EffectSize, LevelVariance, PerArm, StudyDesign};
use lmmpower::power::{DfMethod, PowerOptions, get_power};
use lmmpower::satterthwaite::satterthwaite_df;

fn design(n2: usize) -> StudyDesign {
    StudyDesign {
        n1: 11,
        t_end: 10.0,
        clusters: PerArm::same(ClusterSizes::Equal { n2, n3: 6 }),
        fixed_intercept: 0.0,
        fixed_slope: 0.0,
        subject: LevelVariance::new(9.5, 1.6, -0.5),
        cluster: LevelVariance::new(4.4, 0.4, 0.0),
        sigma_error: 10.0,
        effect: EffectSize::CohensD(-0.8),
        dropout: PerArm::same(Dropout::weibull(0.3, 1.0)),
        deterministic_dropout: true,
        partially_nested: true,
    }
}

fn benchmark_satterthwaite(c: &mut Criterion) {
    let sizes = [5_usize, 10, 20];
    let mut group = c.benchmark_group("satterthwaite_df");
    for &n2 in &sizes {
        let design = match design(n2).validated() {
            Ok(design) => design,
            Err(e) => panic!("benchmark design is invalid: {e}"),
        };
        let layout = expected_layout(&design);
        group.throughput(Throughput::Elements(layout.len() as u64));

        let formula = Formula::full(true);
        let structure = VarianceStructure::build(&design, &layout).unwrap();
        let x = formula.design_matrix(structure.rows());
        let contrast = formula.contrast(FixedTerm::TimeTreatment).unwrap();
        group.bench_with_input(BenchmarkId::new("expected_layout", n2), &n2, |b, _| {
            b.iter(|| {
                let df =
                    satterthwaite_df(black_box(&structure), black_box(&x), black_box(&contrast));
                black_box(df.map(|d| d.df).ok());
            });
        });

        let options = PowerOptions {
            df_method: DfMethod::Satterthwaite,
            ..Default::default()
        };
        group.bench_with_input(BenchmarkId::new("get_power", n2), &design, |b, input| {
            b.iter(|| {
                let result = get_power(black_box(input), &options);
                black_box(result.map(|r| r.power_t).ok());
            });
        });
    }
    group.finish();
}

criterion_group!(satterthwaite, benchmark_satterthwaite);
criterion_main!(satterthwaite);
