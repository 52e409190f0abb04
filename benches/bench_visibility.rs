use criterion::{criterion_group, criterion_main, Criterion};
use nalgebra::Vector3;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use mapslam::camera::{DepthSensorModel, Intrinsics};
use mapslam::features::{NewLandmark, ViewDescriptor};
use mapslam::map::FeaturesMap;
use mapslam::transform::Transform;

fn build_map(landmarks: usize) -> (FeaturesMap, DepthSensorModel) {
    let sensor =
        DepthSensorModel::new(Intrinsics::new(525.0, 525.0, 319.5, 239.5), 640, 480, 5000.0)
            .unwrap();
    let map = FeaturesMap::new();
    map.add_pose(Transform::eye(), 0.0, None, None);

    let seed: [u8; 32] = [5; 32];
    let mut rng = SmallRng::from_seed(seed);
    let candidates: Vec<NewLandmark> = (0..landmarks)
        .map(|index| {
            let position = Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(0.9..5.5),
            );
            let (u, v) = sensor.project(&position);
            NewLandmark {
                position_local: position,
                undistorted: (u, v),
                view: ViewDescriptor {
                    distorted: (u, v),
                    undistorted: (u, v),
                    local_position: position,
                    descriptor: vec![(index % 256) as u8; 32],
                    octave: 0,
                    response: 10.0,
                },
            }
        })
        .collect();
    map.add_features(candidates, 0);
    (map, sensor)
}

fn visibility_benchmark(c: &mut Criterion) {
    const LANDMARKS: usize = 50_000;
    let (map, sensor) = build_map(LANDMARKS);

    c.bench_function("visible_features", |b| {
        b.iter(|| map.visible_features(&sensor, 5.0));
    });

    c.bench_function("find_nearest_frame", |b| {
        let visible = map.visible_features(&sensor, 5.0);
        b.iter(|| map.find_nearest_frame(&visible, 0.6));
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = visibility_benchmark
}

criterion_main!(benches);
