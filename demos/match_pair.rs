// demos/match_pair.rs — detect and match SIFT features in two images.
//
//   cargo run --example match_pair -- left.png right.png
//
// Runs the full pipeline on both images, matches buffer 0 against
// buffer 1 and applies Lowe's ratio test to the 2-NN results.

use std::path::PathBuf;

use wgsift::{Config, Driver, SiftInstance};

const RATIO: f32 = 0.75;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1).map(PathBuf::from);
    let (path_a, path_b) = match (args.next(), args.next()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err("usage: match_pair <left> <right>".into()),
    };

    let gray_a = image::open(&path_a)?.into_luma8();
    let gray_b = image::open(&path_b)?.into_luma8();
    let (wa, ha) = gray_a.dimensions();
    let (wb, hb) = gray_b.dimensions();

    let driver = Driver::load();
    let config = Config::builder()
        .input_image_max_size((wa * ha).max(wb * hb))
        .build()?;
    let mut sift = SiftInstance::new(&driver, config)?;

    let na = sift.detect_features(gray_a.as_raw(), wa, ha, 0)?;
    let nb = sift.detect_features(gray_b.as_raw(), wb, hb, 1)?;
    println!("{na} features in {}, {nb} in {}", path_a.display(), path_b.display());

    let start = std::time::Instant::now();
    let matches = sift.match_features(0, 1)?;
    let elapsed = start.elapsed().as_secs_f64() * 1e3;

    let good: Vec<_> = matches
        .iter()
        .filter(|m| m.dist_a_b1 < RATIO * m.dist_a_b2)
        .collect();
    println!(
        "{} 2-NN matches in {elapsed:.1} ms, {} pass the ratio test",
        matches.len(),
        good.len()
    );

    let feats_a = sift.download_features(0)?;
    let feats_b = sift.download_features(1)?;
    for m in good.iter().take(10) {
        let a = &feats_a[m.idx_a as usize];
        let b = &feats_b[m.idx_b1 as usize];
        println!(
            "  ({:7.2}, {:7.2}) -> ({:7.2}, {:7.2})  d1 {:7.1}  d2 {:7.1}",
            a.x, a.y, b.x, b.y, m.dist_a_b1, m.dist_a_b2
        );
    }
    Ok(())
}
