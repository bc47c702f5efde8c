//! Criterion benchmarks for the consolidation hot path.

use std::collections::BTreeMap;

use criterion::{Criterion, criterion_group, criterion_main};

use oneiros::concept::ConceptId;
use oneiros::config::{PipelineConfig, SchedulerConfig};
use oneiros::engine::Pipeline;
use oneiros::rpc::Deadline;
use oneiros::vault::EpisodeDraft;

fn draft(t: u64, width: u64) -> EpisodeDraft {
    EpisodeDraft {
        created_at: Some(t),
        concept_ids: (1..=width).map(|i| ConceptId::new(i).unwrap()).collect(),
        activation_vector: (0..width)
            .map(|i| if (t + i) % 3 == 0 { -1.0 } else { 1.0 })
            .collect(),
        meta: BTreeMap::new(),
    }
}

fn bench_put(c: &mut Criterion) {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let mut t = 0u64;
    c.bench_function("vault_put_16", |b| {
        b.iter(|| {
            t += 1;
            pipeline.put_episode(draft(t, 16)).unwrap()
        })
    });
}

fn bench_cycle(c: &mut Criterion) {
    let config = PipelineConfig {
        scheduler: SchedulerConfig {
            seed: Some(1),
            ..Default::default()
        },
        ..Default::default()
    };
    let pipeline = Pipeline::new(config).unwrap();
    for t in 1..=64u64 {
        pipeline.put_episode(draft(t, 32)).unwrap();
    }
    c.bench_function("consolidation_cycle_32x32", |b| {
        b.iter(|| {
            pipeline
                .start_consolidation(32, true, true, Deadline::NONE)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_put, bench_cycle);
criterion_main!(benches);
