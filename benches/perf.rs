use criterion::{Criterion, black_box, criterion_group, criterion_main};
use specula::{
    Engine, EngineConfig, ExecutionMode, FixedPredictor, FnOperation, Identifier, MemoryBackend,
    ModePredictor, Operation, OverlapPredictor, identifier_set,
};
use std::time::Duration;

const BATCH: usize = 64;
const HOT_KEYS: usize = 4;

fn engine(predictor: impl ModePredictor) -> Engine {
    Engine::new(
        EngineConfig::low_latency()
            .with_parallelism(4)
            .with_admit_interval(Duration::from_micros(100)),
        MemoryBackend::default(),
        predictor,
    )
    .expect("engine")
}

fn increment(path: String) -> impl Operation {
    let key = Identifier::from(path.as_str());
    FnOperation::new(path, [key.clone()].into_iter().collect(), move |persistent, _, _| {
        persistent.increment(&key, 1)?;
        Ok(())
    })
}

fn run_batch(engine: &Engine, ops: impl IntoIterator<Item = impl Operation>) {
    let handles: Vec<_> = ops
        .into_iter()
        .map(|op| engine.submit(op).expect("submit"))
        .collect();
    for handle in handles {
        handle.get().expect("committed");
    }
}

fn bench_engine_paths(c: &mut Criterion) {
    let optimistic = engine(FixedPredictor::new(ExecutionMode::Optimistic));
    let mut round = 0usize;
    c.bench_function("disjoint_64_optimistic", |b| {
        b.iter(|| {
            round += 1;
            let base = black_box(round) * BATCH;
            run_batch(
                &optimistic,
                (0..BATCH).map(|i| increment(format!("disjoint/{}", base + i))),
            );
        })
    });

    let fine = engine(FixedPredictor::new(ExecutionMode::FineBlock));
    c.bench_function("contended_64_fine_block", |b| {
        b.iter(|| {
            run_batch(
                &fine,
                (0..BATCH).map(|i| increment(format!("hot/{}", black_box(i % HOT_KEYS)))),
            );
        })
    });

    let stall = engine(FixedPredictor::new(ExecutionMode::GlobalStall));
    c.bench_function("contended_64_global_stall", |b| {
        b.iter(|| {
            run_batch(
                &stall,
                (0..BATCH).map(|i| increment(format!("hot/{}", black_box(i % HOT_KEYS)))),
            );
        })
    });

    let learned = engine(OverlapPredictor::default());
    c.bench_function("mixed_64_overlap_predictor", |b| {
        b.iter(|| {
            run_batch(
                &learned,
                (0..BATCH).map(|i| {
                    if i % 8 == 0 {
                        increment(format!("hot/{}", i % HOT_KEYS))
                    } else {
                        increment(format!("cold/{i}"))
                    }
                }),
            );
        })
    });

    for engine in [optimistic, fine, stall, learned] {
        engine.shutdown().expect("shutdown");
    }
}

fn bench_branching_tree(c: &mut Criterion) {
    let engine = engine(OverlapPredictor::default());
    c.bench_function("root_with_8_branches_and_continuation", |b| {
        b.iter(|| {
            let root = FnOperation::new("root", identifier_set(["tree/root"]), |persistent, _, next| {
                persistent.increment(&Identifier::from("tree/root"), 1)?;
                for leaf in 0..8 {
                    next.branch(increment(format!("tree/leaf/{leaf}")));
                }
                next.protect(increment("tree/done".to_owned()));
                Ok(())
            });
            engine.submit(root).expect("submit").get().expect("tree committed");
        })
    });
    engine.shutdown().expect("shutdown");
}

criterion_group!(benches, bench_engine_paths, bench_branching_tree);
criterion_main!(benches);
