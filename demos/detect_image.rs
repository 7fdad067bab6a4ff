// demos/detect_image.rs — detect SIFT features in an image file.
//
//   cargo run --example detect_image -- input.png
//
// Prints the detected features and writes an annotated copy next to the
// input with keypoints drawn as circles scaled by sigma.

use std::path::PathBuf;

use wgsift::{Config, Driver, SiftInstance};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    wgsift::set_log_level(wgsift::LogLevel::Info);

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or("usage: detect_image <image>")?;

    let gray = image::open(&path)?.into_luma8();
    let (width, height) = gray.dimensions();

    let driver = Driver::load();
    println!("available GPUs: {:?}", driver.available_gpus());

    let config = Config::builder()
        .input_image_max_size(width * height)
        .build()?;
    let mut sift = SiftInstance::new(&driver, config)?;

    let start = std::time::Instant::now();
    let count = sift.detect_features(gray.as_raw(), width, height, 0)?;
    println!("{count} features in {:.1} ms", start.elapsed().as_secs_f64() * 1e3);

    let features = sift.download_features(0)?;
    for f in features.iter().take(10) {
        println!(
            "  ({:7.2}, {:7.2})  octave {:2}  sigma {:6.3}  theta {:+.3}",
            f.x, f.y, f.octave_idx, f.sigma, f.orientation
        );
    }
    if features.len() > 10 {
        println!("  ... {} more", features.len() - 10);
    }

    // Annotated output: keypoint circles, radius proportional to sigma.
    let mut rgb = image::DynamicImage::ImageLuma8(gray).into_rgb8();
    for f in &features {
        draw_circle(&mut rgb, f.x, f.y, 2.0 * f.sigma);
    }
    let out = path.with_extension("keypoints.png");
    rgb.save(&out)?;
    println!("annotated image written to {}", out.display());
    Ok(())
}

fn draw_circle(img: &mut image::RgbImage, cx: f32, cy: f32, radius: f32) {
    let (w, h) = img.dimensions();
    let steps = (radius * 8.0).max(16.0) as u32;
    for i in 0..steps {
        let a = i as f32 / steps as f32 * std::f32::consts::TAU;
        let x = cx + radius * a.cos();
        let y = cy + radius * a.sin();
        if x >= 0.0 && y >= 0.0 && (x as u32) < w && (y as u32) < h {
            img.put_pixel(x as u32, y as u32, image::Rgb([0, 255, 0]));
        }
    }
}
