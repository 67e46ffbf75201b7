use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kolosal_deploy::anomaly::{OutlierConfig, OutlierDetector};
use kolosal_deploy::drift::{DriftConfig, DriftDetector, KolmogorovSmirnovTest};
use kolosal_deploy::router::{ModelRouter, RouterConfig, RoutingStrategy};
use ndarray::Array2;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

fn create_data(n_rows: usize, n_features: usize, seed: u64) -> Array2<f64> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    Array2::from_shape_fn((n_rows, n_features), |_| rng.gen::<f64>() * 10.0)
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");

    for (name, strategy) in [
        ("shadow", RoutingStrategy::Shadow),
        ("canary", RoutingStrategy::Canary { weight: 0.1 }),
        ("blue_green", RoutingStrategy::BlueGreen),
    ] {
        let router = ModelRouter::new(
            RouterConfig::new("v1")
                .with_candidate("v2")
                .with_strategy(strategy)
                .with_seed(1),
        )
        .unwrap();
        let features = vec![0.5; 16];

        group.bench_function(BenchmarkId::new("route", name), |b| {
            b.iter(|| router.route(black_box(&features)).unwrap())
        });
    }

    group.finish();
}

fn bench_drift(c: &mut Criterion) {
    let mut group = c.benchmark_group("drift");
    group.sample_size(20);

    for n_rows in [1000, 10000].iter() {
        let reference = create_data(*n_rows, 10, 1);
        let batch = create_data(*n_rows, 10, 2);
        let detector = DriftDetector::new(DriftConfig::default()).unwrap();
        detector.fit(&reference).unwrap();

        group.bench_with_input(BenchmarkId::new("detect", n_rows), &batch, |b, batch| {
            b.iter(|| detector.detect(black_box(batch)).unwrap())
        });
    }

    let mut a: Vec<f64> = create_data(5000, 1, 3).iter().copied().collect();
    let mut b_sample: Vec<f64> = create_data(5000, 1, 4).iter().copied().collect();
    KolmogorovSmirnovTest::sort(&mut a);
    KolmogorovSmirnovTest::sort(&mut b_sample);
    group.bench_function("ks_statistic_5000", |b| {
        b.iter(|| KolmogorovSmirnovTest::statistic(black_box(&a), black_box(&b_sample)))
    });

    group.finish();
}

fn bench_outliers(c: &mut Criterion) {
    let mut group = c.benchmark_group("outliers");
    group.sample_size(10);

    let reference = create_data(5000, 10, 5);
    group.bench_function("isolation_forest_fit", |b| {
        b.iter(|| {
            let detector = OutlierDetector::new(OutlierConfig::default().with_seed(1)).unwrap();
            detector.fit(black_box(&reference)).unwrap()
        })
    });

    let detector = OutlierDetector::new(OutlierConfig::default().with_seed(1)).unwrap();
    detector.fit(&reference).unwrap();
    let query = vec![5.0; 10];
    group.bench_function("isolation_forest_score", |b| {
        b.iter(|| detector.detect(black_box(&query)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_routing, bench_drift, bench_outliers);
criterion_main!(benches);
