use criterion::{Criterion, criterion_group, criterion_main};
use meridian::exchange::{Body, BoxError, Exchange};
use meridian::processor::{
    AsyncProcessorExt, GroupedBodies, Pipeline, SharedAsyncProcessor, Splitter, processor_fn,
    to_async,
};
use std::hint::black_box;
use std::sync::Arc;

// Measures the cost of the callback traversal itself, with trivial stages.

fn increment(id: String) -> SharedAsyncProcessor {
    to_async(
        id,
        processor_fn(|exchange: &mut Exchange| -> Result<(), BoxError> {
            let value = exchange.in_message().body_as::<u64>().copied().unwrap_or(0);
            exchange.out_message_mut().set_body(value + 1);
            Ok(())
        }),
    )
}

fn create_pipeline(stages: usize) -> Pipeline {
    let processors = (0..stages)
        .map(|i| increment(format!("stage-{i}")))
        .collect();
    Pipeline::new("bench-pipeline", processors)
}

fn bench_sync_pipeline(c: &mut Criterion) {
    let pipeline = create_pipeline(10);

    c.bench_function("sync_pipeline_10_stages", |b| {
        b.iter(|| {
            let completion = pipeline
                .process_blocking(Exchange::with_body(0u64))
                .unwrap();
            black_box(completion.done_sync);
        });
    });
}

fn bench_split(c: &mut Criterion) {
    let splitter = Splitter::new(
        "bench-split",
        Arc::new(|_: &Exchange| -> Result<Vec<Body>, BoxError> {
            Ok((0..100u64).map(Body::new).collect())
        }),
        Arc::new(create_pipeline(3)),
    )
    .unwrap()
    .with_strategy(Arc::new(GroupedBodies));

    c.bench_function("split_100_parts", |b| {
        b.iter(|| {
            let completion = splitter.process_blocking(Exchange::new()).unwrap();
            black_box(completion.exchange);
        });
    });
}

criterion_group!(benches, bench_sync_pipeline, bench_split);
criterion_main!(benches);
