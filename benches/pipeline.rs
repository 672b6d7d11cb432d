//! Benchmarks for the optimization pipeline.
//!
//! Measures:
//! - Size-group analysis construction on a loop nest
//! - Loop fusion and loop interchange in isolation
//! - The complete default pipeline over a batch of functions

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use matopt::{
    analysis::SizeGroupInformation,
    compiler::{
        AnalysisCache, CompilerContext, LoopFusionPass, LoopInterchangePass, PassScheduler,
        PipelineConfig, SsaPass, TypedFunction,
    },
    testing::FunctionBuilder,
};
use std::hint::black_box;

fn fixtures(copies: usize) -> Vec<TypedFunction> {
    (0..copies)
        .flat_map(|n| {
            [
                FunctionBuilder::two_fill_loops(&format!("fill_{n}"), false),
                FunctionBuilder::transposed_copy(&format!("copy_{n}"), false),
                FunctionBuilder::zeros_fill(&format!("zeros_{n}"), &["one", "n"]),
                FunctionBuilder::flatten(&format!("flat_{n}")),
                FunctionBuilder::range(&format!("range_{n}")),
            ]
        })
        .collect()
}

fn bench_size_groups(c: &mut Criterion) {
    let function = FunctionBuilder::nest_then_flat("nest");

    c.bench_function("size_groups_build", |b| {
        b.iter(|| {
            let sizes = SizeGroupInformation::build(black_box(&function.body), &function.types);
            black_box(sizes)
        });
    });
}

fn bench_single_pass(c: &mut Criterion, name: &str, pass: &dyn SsaPass, function: &TypedFunction) {
    let ctx = CompilerContext::new();
    c.bench_function(name, |b| {
        b.iter_batched(
            || function.clone(),
            |mut function| {
                let changed = pass
                    .run_on_function(&mut function, &mut AnalysisCache::new(), &ctx)
                    .unwrap();
                black_box((changed, function))
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_loop_passes(c: &mut Criterion) {
    bench_single_pass(
        c,
        "loop_fusion",
        &LoopFusionPass::new(),
        &FunctionBuilder::two_fill_loops("fill", false),
    );
    bench_single_pass(
        c,
        "loop_interchange",
        &LoopInterchangePass::new(),
        &FunctionBuilder::transposed_copy("copy", false),
    );
}

fn bench_pipeline(c: &mut Criterion) {
    let functions = fixtures(16);

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(functions.len() as u64));
    group.bench_function("default", |b| {
        b.iter_batched(
            || {
                let ctx = CompilerContext::new();
                for function in &functions {
                    ctx.add_function(function.clone());
                }
                ctx
            },
            |ctx| {
                let mut scheduler = PassScheduler::from_config(&PipelineConfig::default());
                let changes = scheduler.run_pipeline(&ctx).unwrap();
                black_box((changes, ctx))
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_size_groups, bench_loop_passes, bench_pipeline);
criterion_main!(benches);
