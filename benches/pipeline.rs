// benches/pipeline.rs — detect and match benchmarks.
//
//   cargo bench --bench pipeline
//
// Requires a Vulkan GPU; without one the benchmark registers nothing
// and exits cleanly.
//
// Criterion measures wall time including the CPU orchestration between
// stages (candidate readback, canonical sort, metadata upload). That is
// the latency a caller actually observes per detect call. Warmup is set
// explicitly: the first iterations pay lazy pipeline compilation on
// some drivers.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use wgsift::{Config, Driver, SiftInstance};

/// Synthetic scene with gradients and blob clusters, textured enough to
/// produce a realistic feature count.
fn make_scene(w: usize, h: usize) -> Vec<u8> {
    let mut img = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut v = (x * 96 / w + y * 64 / h) as i32;
            let bx = (x % 48) as i32 - 24;
            let by = (y % 48) as i32 - 24;
            let d2 = bx * bx + by * by;
            if d2 < 100 {
                v += 110 - d2;
            }
            img[y * w + x] = v.clamp(0, 255) as u8;
        }
    }
    img
}

fn bench_config() -> Config {
    Config::builder()
        .max_nb_sift_per_buffer(50_000)
        .allow_cpu_device(true)
        .build()
        .unwrap()
}

fn bench_detect(c: &mut Criterion) {
    let driver = Driver::load();
    let mut instance = match SiftInstance::new(&driver, bench_config()) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("skipping GPU benchmarks: {e}");
            return;
        }
    };

    let mut group = c.benchmark_group("detect");
    group.warm_up_time(Duration::from_secs(3));
    group.sample_size(30);
    for (w, h) in [(640usize, 480usize), (1280, 720)] {
        let img = make_scene(w, h);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{w}x{h}")),
            &img,
            |b, img| {
                b.iter(|| {
                    instance
                        .detect_features(img, w as u32, h as u32, 0)
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_match(c: &mut Criterion) {
    let driver = Driver::load();
    let mut instance = match SiftInstance::new(&driver, bench_config()) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("skipping GPU benchmarks: {e}");
            return;
        }
    };

    let img = make_scene(640, 480);
    instance.detect_features(&img, 640, 480, 0).unwrap();
    instance.detect_features(&img, 640, 480, 1).unwrap();
    let n = instance.feature_count(0).unwrap();

    let mut group = c.benchmark_group("match");
    group.warm_up_time(Duration::from_secs(3));
    group.sample_size(30);
    group.bench_function(BenchmarkId::from_parameter(format!("{n}x{n}")), |b| {
        b.iter(|| instance.match_features(0, 1).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_detect, bench_match);
criterion_main!(benches);
