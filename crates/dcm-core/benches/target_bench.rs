use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dcm_core::{
    roi_align_weights, ActorBoxes, FeatureGrid, ImageSize, RoiAlignConfig, TargetDistribution,
    ValidityMask,
};

const BATCH: usize = 8;
const CAPACITY: usize = 12;
const CLUSTERS: usize = 10;

fn soft_assignment() -> Vec<f32> {
    (0..BATCH * CAPACITY)
        .flat_map(|i| {
            let raw: Vec<f32> = (0..CLUSTERS).map(|j| 1.0 + ((i * 7 + j * 3) % 11) as f32).collect();
            let sum: f32 = raw.iter().sum();
            raw.into_iter().map(move |v| v / sum)
        })
        .collect()
}

fn bench_target_update(c: &mut Criterion) {
    c.bench_function("TargetDistribution::update (8 clips × 12 slots)", |b| {
        let mut target = TargetDistribution::new(1_000, CAPACITY, CLUSTERS).unwrap();
        let mask = ValidityMask::from_flags(vec![true; BATCH * CAPACITY], BATCH, CAPACITY).unwrap();
        let offsets: Vec<usize> = (0..BATCH).collect();
        let soft = soft_assignment();
        b.iter(|| target.update(black_box(&soft), &mask, &offsets).unwrap())
    });
}

fn bench_target_gather(c: &mut Criterion) {
    c.bench_function("TargetDistribution::gather (8 clips × 12 slots)", |b| {
        let target = TargetDistribution::new(1_000, CAPACITY, CLUSTERS).unwrap();
        let mask = ValidityMask::from_flags(vec![true; BATCH * CAPACITY], BATCH, CAPACITY).unwrap();
        let offsets: Vec<usize> = (100..100 + BATCH).collect();
        b.iter(|| black_box(target.gather(&mask, &offsets).unwrap()))
    });
}

fn bench_roi_weights(c: &mut Criterion) {
    c.bench_function("roi_align_weights (8 clips × 12 boxes, 12×16 grid)", |b| {
        let flat: Vec<f32> = (0..BATCH * CAPACITY)
            .flat_map(|i| {
                let x = (i % 10) as f32 * 10.0;
                let y = (i % 7) as f32 * 10.0;
                [x, y, x + 20.0, y + 24.0]
            })
            .collect();
        let boxes = ActorBoxes::from_flat(&flat, BATCH, CAPACITY).unwrap();
        let image = ImageSize {
            width: 128,
            height: 96,
        };
        let grid = FeatureGrid {
            height: 12,
            width: 16,
        };
        let cfg = RoiAlignConfig::default();
        b.iter(|| black_box(roi_align_weights(&boxes, image, grid, &cfg)))
    });
}

criterion_group!(
    benches,
    bench_target_update,
    bench_target_gather,
    bench_roi_weights,
);
criterion_main!(benches);
