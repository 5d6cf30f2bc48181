use std::fs::File;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use toggle_core::{
    flag::{CompileLimits, CompiledFlag, FlagSet},
    sharder::Md5Sharder,
    EvaluationContext, Evaluator, EvaluatorConfig, NoopSink, StaticLoader,
};

fn criterion_benchmark(c: &mut Criterion) {
    let flag_set: FlagSet =
        serde_json::from_reader(File::open("tests/data/flags.json").unwrap()).unwrap();
    let compile = |key: &str| {
        CompiledFlag::compile(&flag_set.flags[key], &CompileLimits::default()).unwrap()
    };
    let now = Utc::now();

    {
        let mut group = c.benchmark_group("rollout");
        group.throughput(Throughput::Elements(1));
        let flag = compile("checkout-v2");
        let context = EvaluationContext::new("subject1");
        group.bench_function("eval", |b| {
            b.iter(|| {
                flag.eval(
                    black_box("checkout-v2"),
                    black_box(&context),
                    black_box(now),
                    &Md5Sharder,
                )
            })
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("targeting");
        group.throughput(Throughput::Elements(1));
        let flag = compile("beta-cohort");
        let context = EvaluationContext::new("subject1")
            .with_attribute("plan", "enterprise")
            .with_attribute("app_version", "2.4.0")
            .with_attribute("email", "someone@example.com");
        group.bench_function("eval", |b| {
            b.iter(|| {
                flag.eval(
                    black_box("beta-cohort"),
                    black_box(&context),
                    black_box(now),
                    &Md5Sharder,
                )
            })
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("evaluator");
        group.throughput(Throughput::Elements(1));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let evaluator = Evaluator::new(
            StaticLoader::from_flag_set(flag_set.clone()),
            NoopSink,
            EvaluatorConfig::default(),
        )
        .unwrap();
        let context = EvaluationContext::new("subject1").with_attribute("country", "US");
        // Warm the cache so that the benchmark measures the hit path.
        runtime
            .block_on(evaluator.evaluate("north-america-banner", &context))
            .unwrap();
        group.bench_function("evaluate_cached", |b| {
            b.iter(|| {
                runtime.block_on(
                    evaluator.evaluate(black_box("north-america-banner"), black_box(&context)),
                )
            })
        });
        group.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
