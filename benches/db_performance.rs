use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use census_ingest::models::{CensusRecord, GeographyLevel, Value};
use census_ingest::validator::validate_batch;

fn sample_records(n: usize) -> Vec<CensusRecord> {
    (0..n)
        .map(|i| CensusRecord {
            dataset: "acs5".to_string(),
            year: 2023,
            geography_level: GeographyLevel::Tract,
            geography_code: format!("{:011}", i),
            geography_name: None,
            state_code: Some(format!("{:02}", i % 56)),
            county_code: None,
            tract_code: None,
            block_group_code: None,
            zip_code: None,
            variable_name: "B01003_001E".to_string(),
            variable_value: Value::Int64((i * 17) as i64),
            margin_of_error: None,
        })
        .collect()
}

fn bench_batch_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_batch");
    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        let records = sample_records(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &records, |b, records| {
            b.iter(|| validate_batch(black_box(records)));
        });
    }
    group.finish();
}

fn bench_tokio_spawn_overhead(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    c.bench_function("spawn_noop_task", |b| {
        b.to_async(&runtime).iter(|| async {
            tokio::spawn(async { black_box(1 + 1) }).await.unwrap();
        });
    });
}

criterion_group!(benches, bench_batch_validation, bench_tokio_spawn_overhead);
criterion_main!(benches);
