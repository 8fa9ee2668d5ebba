// ============================================================
// Layer 4 — Image Transform Pipelines
// ============================================================
// Two pipelines turn an image file into a normalised CHW f32
// buffer ready for the batcher:
//
//   training:   resize → random crop → h-flip → v-flip → rotate
//               → affine → color jitter → blur → to tensor
//               → normalize → random erasing
//   evaluation: resize → to tensor → normalize
//
// The training pipeline exists only to stop the network from
// memorising individual slides; every parameter is config.
// The evaluation pipeline is fully deterministic.
//
// Geometric and photometric ops use the `image` crate; the
// affine warp and erasing are done by hand on the pixel buffer
// because `image` has no arbitrary-angle rotation.

use anyhow::{bail, Context, Result};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// ImageNet channel statistics the pretrained backbone expects.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Parameters of the randomized training transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Side length images are resized to before cropping.
    pub resize: u32,
    /// Take a random `image_size` crop after resizing.
    pub random_crop: bool,
    pub hflip_p: f64,
    pub vflip_p: f64,
    /// Uniform rotation in ±degrees.
    pub rotation_degrees: f64,
    pub affine_degrees: f64,
    /// Max translation as a fraction of width/height.
    pub affine_translate: f64,
    pub affine_scale: (f64, f64),
    /// Uniform x-shear in ±degrees.
    pub affine_shear: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    /// Hue shift as a fraction of the color wheel, at most 0.5.
    pub hue: f64,
    pub blur_p: f64,
    pub blur_sigma: (f64, f64),
    pub erase_p: f64,
    /// Erased area as a fraction of the image.
    pub erase_scale: (f64, f64),
}

impl AugmentationConfig {
    /// Aggressive augmentation used with the heavily regularised head.
    pub fn aggressive() -> Self {
        Self {
            resize: 256,
            random_crop: true,
            hflip_p: 0.5,
            vflip_p: 0.5,
            rotation_degrees: 30.0,
            affine_degrees: 20.0,
            affine_translate: 0.15,
            affine_scale: (0.85, 1.15),
            affine_shear: 0.0,
            brightness: 0.2,
            contrast: 0.2,
            saturation: 0.15,
            hue: 0.05,
            blur_p: 0.3,
            blur_sigma: (0.1, 2.0),
            erase_p: 0.2,
            erase_scale: (0.02, 0.15),
        }
    }

    /// Milder augmentation: no crop, blur or erasing, some shear.
    pub fn moderate() -> Self {
        Self {
            resize: 224,
            random_crop: false,
            hflip_p: 0.5,
            vflip_p: 0.5,
            rotation_degrees: 20.0,
            affine_degrees: 15.0,
            affine_translate: 0.1,
            affine_scale: (0.85, 1.15),
            affine_shear: 5.0,
            brightness: 0.2,
            contrast: 0.2,
            saturation: 0.15,
            hue: 0.05,
            blur_p: 0.0,
            blur_sigma: (0.1, 2.0),
            erase_p: 0.0,
            erase_scale: (0.02, 0.15),
        }
    }

    /// Reject values the random transforms cannot sample from.
    pub fn validate(&self) -> Result<()> {
        for (name, p) in [
            ("hflip_p", self.hflip_p),
            ("vflip_p", self.vflip_p),
            ("blur_p", self.blur_p),
            ("erase_p", self.erase_p),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("augmentation.{name} must lie in [0, 1], got {p}");
            }
        }
        for (name, v) in [
            ("rotation_degrees", self.rotation_degrees),
            ("affine_degrees", self.affine_degrees),
            ("affine_translate", self.affine_translate),
            ("affine_shear", self.affine_shear),
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("saturation", self.saturation),
            ("hue", self.hue),
        ] {
            if !(v >= 0.0 && v.is_finite()) {
                bail!("augmentation.{name} must be a non-negative number, got {v}");
            }
        }
        if self.hue > 0.5 {
            bail!("augmentation.hue must be at most 0.5, got {}", self.hue);
        }
        let (lo, hi) = self.affine_scale;
        if !(lo > 0.0 && lo <= hi && hi.is_finite()) {
            bail!("augmentation.affine_scale must satisfy 0 < min <= max, got {:?}", self.affine_scale);
        }
        let (lo, hi) = self.blur_sigma;
        if !(lo > 0.0 && lo <= hi && hi.is_finite()) {
            bail!("augmentation.blur_sigma must satisfy 0 < min <= max, got {:?}", self.blur_sigma);
        }
        let (lo, hi) = self.erase_scale;
        if !(lo > 0.0 && lo <= hi && hi < 1.0) {
            bail!("augmentation.erase_scale must satisfy 0 < min <= max < 1, got {:?}", self.erase_scale);
        }
        if self.resize == 0 {
            bail!("augmentation.resize must be greater than zero");
        }
        Ok(())
    }
}

/// One step of the pixel-space pipeline.
#[derive(Debug, Clone, PartialEq)]
enum Transform {
    Resize { size: u32 },
    RandomCrop { size: u32 },
    HorizontalFlip { p: f64 },
    VerticalFlip { p: f64 },
    Rotation { degrees: f64 },
    Affine { degrees: f64, translate: f64, scale: (f64, f64), shear: f64 },
    ColorJitter { brightness: f64, contrast: f64, saturation: f64, hue: f64 },
    GaussianBlur { p: f64, sigma: (f64, f64) },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RandomErasing {
    p: f64,
    scale: (f64, f64),
}

/// An ordered transform sequence ending in a normalised CHW buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePipeline {
    transforms: Vec<Transform>,
    erasing: Option<RandomErasing>,
    image_size: u32,
}

impl ImagePipeline {
    pub fn training(aug: &AugmentationConfig, image_size: u32) -> Self {
        let mut transforms = Vec::new();
        if aug.random_crop && aug.resize > image_size {
            transforms.push(Transform::Resize { size: aug.resize });
            transforms.push(Transform::RandomCrop { size: image_size });
        } else {
            transforms.push(Transform::Resize { size: image_size });
        }
        transforms.extend([
            Transform::HorizontalFlip { p: aug.hflip_p },
            Transform::VerticalFlip { p: aug.vflip_p },
            Transform::Rotation { degrees: aug.rotation_degrees },
            Transform::Affine {
                degrees: aug.affine_degrees,
                translate: aug.affine_translate,
                scale: aug.affine_scale,
                shear: aug.affine_shear,
            },
            Transform::ColorJitter {
                brightness: aug.brightness,
                contrast: aug.contrast,
                saturation: aug.saturation,
                hue: aug.hue,
            },
            Transform::GaussianBlur { p: aug.blur_p, sigma: aug.blur_sigma },
        ]);
        let erasing = (aug.erase_p > 0.0).then_some(RandomErasing {
            p: aug.erase_p,
            scale: aug.erase_scale,
        });
        Self { transforms, erasing, image_size }
    }

    pub fn evaluation(image_size: u32) -> Self {
        Self {
            transforms: vec![Transform::Resize { size: image_size }],
            erasing: None,
            image_size,
        }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Length of the buffer `apply` returns.
    pub fn output_len(&self) -> usize {
        3 * (self.image_size as usize).pow(2)
    }

    /// Decode `path` and run the pipeline.
    pub fn load<R: Rng>(&self, path: &Path, rng: &mut R) -> Result<Vec<f32>> {
        let img = image::open(path)
            .with_context(|| format!("Cannot decode image '{}'", path.display()))?
            .to_rgb8();
        Ok(self.apply(img, rng))
    }

    /// Run every transform, then normalise into a CHW buffer.
    pub fn apply<R: Rng>(&self, mut img: RgbImage, rng: &mut R) -> Vec<f32> {
        for t in &self.transforms {
            img = apply_transform(t, img, rng);
        }
        // Random crop may be skipped for tiny inputs; guarantee the final size.
        if img.width() != self.image_size || img.height() != self.image_size {
            img = imageops::resize(&img, self.image_size, self.image_size, FilterType::Triangle);
        }
        let mut chw = to_normalized_chw(&img);
        if let Some(erasing) = self.erasing {
            random_erase(&mut chw, self.image_size as usize, erasing, rng);
        }
        chw
    }
}

fn apply_transform<R: Rng>(t: &Transform, img: RgbImage, rng: &mut R) -> RgbImage {
    match *t {
        Transform::Resize { size } => imageops::resize(&img, size, size, FilterType::Triangle),
        Transform::RandomCrop { size } => {
            if img.width() < size || img.height() < size {
                return img;
            }
            let x = rng.gen_range(0..=img.width() - size);
            let y = rng.gen_range(0..=img.height() - size);
            imageops::crop_imm(&img, x, y, size, size).to_image()
        }
        Transform::HorizontalFlip { p } => {
            if rng.gen_bool(p.clamp(0.0, 1.0)) {
                imageops::flip_horizontal(&img)
            } else {
                img
            }
        }
        Transform::VerticalFlip { p } => {
            if rng.gen_bool(p.clamp(0.0, 1.0)) {
                imageops::flip_vertical(&img)
            } else {
                img
            }
        }
        Transform::Rotation { degrees } => {
            if degrees <= 0.0 {
                return img;
            }
            let angle = rng.gen_range(-degrees..=degrees);
            warp_affine(&img, AffineParams { angle, ..AffineParams::IDENTITY })
        }
        Transform::Affine { degrees, translate, scale, shear } => {
            let angle = if degrees > 0.0 { rng.gen_range(-degrees..=degrees) } else { 0.0 };
            let max_dx = translate * img.width() as f64;
            let max_dy = translate * img.height() as f64;
            let tx = if max_dx > 0.0 { rng.gen_range(-max_dx..=max_dx) } else { 0.0 };
            let ty = if max_dy > 0.0 { rng.gen_range(-max_dy..=max_dy) } else { 0.0 };
            let s = if scale.1 > scale.0 { rng.gen_range(scale.0..=scale.1) } else { scale.0 };
            let sh = if shear > 0.0 { rng.gen_range(-shear..=shear) } else { 0.0 };
            warp_affine(&img, AffineParams { angle, tx, ty, scale: s, shear: sh })
        }
        Transform::ColorJitter { brightness, contrast, saturation, hue } => {
            let b = jitter_factor(brightness, rng);
            let c = jitter_factor(contrast, rng);
            let s = jitter_factor(saturation, rng);
            let mut out = adjust_photometric(&img, b, c, s);
            if hue > 0.0 {
                let shift = rng.gen_range(-hue..=hue) * 360.0;
                out = imageops::huerotate(&out, shift.round() as i32);
            }
            out
        }
        Transform::GaussianBlur { p, sigma } => {
            if p > 0.0 && rng.gen_bool(p.clamp(0.0, 1.0)) {
                let s = if sigma.1 > sigma.0 { rng.gen_range(sigma.0..=sigma.1) } else { sigma.0 };
                imageops::blur(&img, s as f32)
            } else {
                img
            }
        }
    }
}

fn jitter_factor<R: Rng>(amount: f64, rng: &mut R) -> f64 {
    if amount <= 0.0 {
        1.0
    } else {
        rng.gen_range((1.0 - amount).max(0.0)..=1.0 + amount)
    }
}

#[derive(Debug, Clone, Copy)]
struct AffineParams {
    /// Rotation in degrees, counter-clockwise.
    angle: f64,
    tx: f64,
    ty: f64,
    scale: f64,
    /// X-shear in degrees.
    shear: f64,
}

impl AffineParams {
    const IDENTITY: AffineParams = AffineParams { angle: 0.0, tx: 0.0, ty: 0.0, scale: 1.0, shear: 0.0 };
}

/// Rotate/translate/scale/shear about the image centre, bilinear, zero fill.
fn warp_affine(img: &RgbImage, p: AffineParams) -> RgbImage {
    let (w, h) = img.dimensions();
    let cx = (w as f64 - 1.0) * 0.5;
    let cy = (h as f64 - 1.0) * 0.5;

    let a = p.angle.to_radians();
    let sh = p.shear.to_radians();
    // Forward matrix M = R(a) · Shear(sh) · scale; invert to map output → input.
    let m = [
        p.scale * a.cos(),
        p.scale * (a.cos() * sh.tan() - a.sin()),
        p.scale * a.sin(),
        p.scale * (a.sin() * sh.tan() + a.cos()),
    ];
    let det = m[0] * m[3] - m[1] * m[2];
    if det.abs() < 1e-12 {
        return img.clone();
    }
    let inv = [m[3] / det, -m[1] / det, -m[2] / det, m[0] / det];

    let mut out = RgbImage::new(w, h);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let dx = x as f64 - cx - p.tx;
        let dy = y as f64 - cy - p.ty;
        let sx = inv[0] * dx + inv[1] * dy + cx;
        let sy = inv[2] * dx + inv[3] * dy + cy;
        *px = sample_bilinear(img, sx, sy);
    }
    out
}

fn sample_bilinear(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f64 || y > (h - 1) as f64 {
        return Rgb([0, 0, 0]);
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let p00 = img.get_pixel(x0, y0)[c] as f64;
        let p10 = img.get_pixel(x1, y0)[c] as f64;
        let p01 = img.get_pixel(x0, y1)[c] as f64;
        let p11 = img.get_pixel(x1, y1)[c] as f64;
        let top = p00 + (p10 - p00) * fx;
        let bottom = p01 + (p11 - p01) * fx;
        *slot = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Brightness, contrast and saturation factors (1.0 = unchanged).
fn adjust_photometric(img: &RgbImage, brightness: f64, contrast: f64, saturation: f64) -> RgbImage {
    let gray = |p: &Rgb<u8>| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64;

    let mut out = img.clone();
    for px in out.pixels_mut() {
        for c in 0..3 {
            px[c] = (px[c] as f64 * brightness).round().clamp(0.0, 255.0) as u8;
        }
    }

    let n = (out.width() * out.height()).max(1) as f64;
    let mean = out.pixels().map(gray).sum::<f64>() / n;
    for px in out.pixels_mut() {
        for c in 0..3 {
            let v = (px[c] as f64 - mean) * contrast + mean;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        let g = gray(px);
        for c in 0..3 {
            let v = (px[c] as f64 - g) * saturation + g;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// HWC u8 → CHW f32, scaled to [0, 1] then ImageNet-normalised.
fn to_normalized_chw(img: &RgbImage) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut out = vec![0.0f32; 3 * plane];
    for (x, y, px) in img.enumerate_pixels() {
        let i = (y * w + x) as usize;
        for c in 0..3 {
            out[c * plane + i] = (px[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    out
}

/// Zero a random rectangle of the normalised buffer.
fn random_erase<R: Rng>(chw: &mut [f32], size: usize, e: RandomErasing, rng: &mut R) {
    if !rng.gen_bool(e.p.clamp(0.0, 1.0)) {
        return;
    }
    let area = (size * size) as f64;
    let (log_r0, log_r1) = (0.3f64.ln(), (10.0f64 / 3.0).ln());
    for _ in 0..10 {
        let target = area * rng.gen_range(e.scale.0..=e.scale.1);
        let aspect = rng.gen_range(log_r0..=log_r1).exp();
        let eh = (target * aspect).sqrt().round() as usize;
        let ew = (target / aspect).sqrt().round() as usize;
        if eh == 0 || ew == 0 || eh >= size || ew >= size {
            continue;
        }
        let top = rng.gen_range(0..=size - eh);
        let left = rng.gen_range(0..=size - ew);
        let plane = size * size;
        for c in 0..3 {
            for y in top..top + eh {
                let row = c * plane + y * size;
                chw[row + left..row + left + ew].fill(0.0);
            }
        }
        return;
    }
}
