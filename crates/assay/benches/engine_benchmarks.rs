//! Engine throughput benchmarks.
//!
//! Measures end-to-end execution of a filter-gated job with a multi-row
//! transformer, and the reduction of partial results.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use assay::components::ValueDistributionReducer;
use assay::{
    AnalysisJob, AnalysisJobBuilder, AnalysisRunner, AnalyzerResult, ComponentRegistry,
    ComponentRequirement, DataTable, EngineConfig, MemoryDatastore, PartitionedAnalysisRunner,
    ResultReducer,
};

/// Generate customer-like rows with some gaps.
fn generate_customers(rows: usize) -> MemoryDatastore {
    let first = ["John", "Jane", "Ada", "Alan", ""];
    let last = ["Doe", "Lovelace", "Turing", "Hopper"];
    let cities = ["Oslo", "Rome", "Lima", "NA", "Pune", "Kyiv"];

    let data: Vec<[String; 3]> = (0..rows)
        .map(|i| {
            let name = match i % 3 {
                0 => format!("{} {}", first[i % first.len()], last[i % last.len()]),
                1 => format!("{}, {}", last[i % last.len()], first[i % first.len()]),
                _ => format!("Mr. {} {}", first[i % first.len()], last[i % last.len()]),
            };
            [
                name,
                cities[i % cities.len()].to_string(),
                format!("tag{} tag{} tag{}", i % 5, i % 11, i % 17),
            ]
        })
        .collect();
    let refs: Vec<Vec<&str>> = data
        .iter()
        .map(|r| r.iter().map(String::as_str).collect())
        .collect();
    let slices: Vec<&[&str]> = refs.iter().map(Vec::as_slice).collect();
    MemoryDatastore::new(
        "customers",
        DataTable::from_strings(&["name", "city", "tags"], &slices),
    )
}

fn build_job(datastore: &MemoryDatastore) -> AnalysisJob {
    let none = Vec::<(&str, serde_json::Value)>::new;
    let mut builder = AnalysisJobBuilder::new(Arc::new(ComponentRegistry::with_builtins()));
    let columns = builder.set_datastore(datastore).unwrap();

    builder
        .add_component_with("Completeness", &columns, none())
        .unwrap();
    let nulls = builder
        .add_component_with("Null check", &columns[1..2], none())
        .unwrap();
    let names = builder
        .add_component_with("Name standardizer", &columns[..1], none())
        .unwrap();
    builder
        .set_requirement(names, Some(ComponentRequirement::outcome(nulls, "NOT_NULL")))
        .unwrap();
    let name_columns = builder.component(names).unwrap().outputs().to_vec();
    builder
        .add_component_with("Value distribution", &name_columns[..1], none())
        .unwrap();

    let splitter = builder
        .add_component_with("Token splitter", &columns[2..], none())
        .unwrap();
    let token = builder.component(splitter).unwrap().outputs()[0].clone();
    builder
        .add_component_with("Value distribution", &[token], none())
        .unwrap();

    builder.to_analysis_job().unwrap()
}

/// Benchmark a full run at several row counts.
fn bench_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("run");
    group.sample_size(20);

    for rows in [1_000, 10_000] {
        let datastore = Arc::new(generate_customers(rows));
        let job = Arc::new(build_job(&datastore));
        group.throughput(Throughput::Elements(rows as u64));

        for (label, config) in [
            ("single_threaded", EngineConfig::single_threaded()),
            ("multi_threaded", EngineConfig::default()),
        ] {
            let runner = AnalysisRunner::new(config);
            group.bench_with_input(BenchmarkId::new(label, rows), &rows, |b, _| {
                b.iter(|| {
                    let future = runner.run(Arc::clone(&job), datastore.clone());
                    black_box(future.results())
                })
            });
        }

        let partitioned = PartitionedAnalysisRunner::new(EngineConfig::default(), 4);
        group.bench_with_input(BenchmarkId::new("partitioned", rows), &rows, |b, _| {
            b.iter(|| {
                let future = partitioned
                    .run(Arc::clone(&job), datastore.clone())
                    .unwrap();
                black_box(future.results())
            })
        });
    }

    group.finish();
}

/// Benchmark reducing the partial value distributions of four partitions.
fn bench_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce");

    for rows in [400, 4_000] {
        let datastore = Arc::new(generate_customers(rows));
        let job = Arc::new(build_job(&datastore));
        let partials: Vec<AnalyzerResult> = (0..4)
            .map(|_| {
                AnalysisRunner::new(EngineConfig::default())
                    .run(Arc::clone(&job), datastore.clone())
                    .results()
                    .remove(2)
            })
            .collect();

        group.bench_with_input(
            BenchmarkId::new("value_distribution", rows),
            &partials,
            |b, partials| b.iter(|| ValueDistributionReducer.reduce(black_box(partials)).unwrap()),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_run, bench_reduce);
criterion_main!(benches);
