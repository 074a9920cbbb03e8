use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;

use ftmctl::amdor::{AmdorBatch, AmdorConfig, AmdorLine};
use ftmctl::batch::{BatchPlan, MeasurementResult, ScanDescriptor, ScanStatus};
use ftmctl::geometry::CavityGeometry;

pub fn geometry(c: &mut Criterion) {
    let geo = CavityGeometry::ftm1();
    let mut rng = rand::thread_rng();
    let freqs: Vec<f64> = (0..1024).map(|_| rng.gen_range(5_000.0..26_000.0)).collect();

    c.bench_function("mode_position", |b| {
        b.iter(|| {
            for &f in &freqs {
                let _ = black_box(geo.mode_position(black_box(f), 40));
            }
        });
    });
    c.bench_function("rough_tune_guess", |b| {
        b.iter(|| {
            for &f in &freqs {
                let _ = black_box(geo.rough_tune_guess(black_box(f), None));
            }
        });
    });
}

pub fn amdor_planning(c: &mut Criterion) {
    let lines: Vec<AmdorLine> = (0..40)
        .map(|k| AmdorLine::new(10_000.0 + 37.0 * f64::from(k), ScanDescriptor::default()))
        .collect();
    c.bench_function("amdor 40 lines", |b| {
        b.iter(|| {
            let mut rng = rand::thread_rng();
            let config = AmdorConfig {
                max_children: 3,
                ..AmdorConfig::default()
            };
            let mut batch = AmdorBatch::new(config, lines.clone(), &[], None);
            let mut scan_number = 0;
            while !batch.is_complete() {
                batch.prepare_next_scan();
                scan_number += 1;
                let result = MeasurementResult {
                    scan_number,
                    tuning_voltage_mv: 1000,
                    bad_tune: false,
                    intensity: rng.gen_range(0.0..100.0),
                    status: ScanStatus::Completed,
                };
                batch.advance(&result);
                batch.process_result(&result);
            }
            black_box(batch.linkages().len());
        });
    });
}

criterion_group!(benches, geometry, amdor_planning);
criterion_main!(benches);
