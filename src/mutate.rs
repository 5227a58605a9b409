use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GenericImageView, ImageEncoder, imageops};
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MutateError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("image too small to mutate")]
    TooSmall,
}

/// Cosmetic title perturbation for a relist. The result must read the same
/// to a human but differ as a string from the previous submission:
/// - trailing-space parity alternates with `relist_count`, so consecutive
///   relists never produce identical titles;
/// - one bounded punctuation/spacing tweak at a random position.
pub fn jitter_title(title: &str, relist_count: i64) -> String {
    let mut rng = rand::rng();
    let base = title.trim_end().to_string();

    let mut jittered = match rng.random_range(0..3u8) {
        // Double one inner word gap.
        0 => {
            let gaps: Vec<usize> = base
                .char_indices()
                .filter(|(_, ch)| *ch == ' ')
                .map(|(idx, _)| idx)
                .collect();
            if gaps.is_empty() {
                base.clone()
            } else {
                let at = gaps[rng.random_range(0..gaps.len())];
                let mut out = String::with_capacity(base.len() + 1);
                out.push_str(&base[..at]);
                out.push(' ');
                out.push_str(&base[at..]);
                out
            }
        }
        // Toggle a trailing full stop.
        1 => match base.strip_suffix('.') {
            Some(stripped) => stripped.to_string(),
            None => format!("{base}."),
        },
        // Leave the body untouched; parity alone differentiates.
        _ => base.clone(),
    };

    if relist_count % 2 == 0 {
        jittered.push(' ');
    }
    jittered
}

/// Sub-perceptual image mutation so a re-uploaded photo carries a fresh
/// binary fingerprint:
/// - a one-pixel edge crop whose side alternates with `relist_count`
///   (prevents drift in one direction across repeated relists);
/// - random jitter of five pixels by up to +/-3 per channel;
/// - re-encode as JPEG quality 95.
pub fn mutate_image(bytes: &[u8], relist_count: i64) -> Result<Vec<u8>, MutateError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| MutateError::Decode(err.to_string()))?;
    let (width, height) = decoded.dimensions();
    if width < 3 || height < 3 {
        return Err(MutateError::TooSmall);
    }

    let cropped = if relist_count % 2 == 0 {
        imageops::crop_imm(&decoded, 1, 0, width - 1, height).to_image()
    } else {
        imageops::crop_imm(&decoded, 0, 1, width, height - 1).to_image()
    };
    let mut rgb = image::DynamicImage::ImageRgba8(cropped).to_rgb8();

    let mut rng = rand::rng();
    let (w, h) = rgb.dimensions();
    for _ in 0..5 {
        let x = rng.random_range(0..w);
        let y = rng.random_range(0..h);
        let pixel = rgb.get_pixel_mut(x, y);
        for channel in pixel.0.iter_mut() {
            let delta: i16 = rng.random_range(-3..=3);
            *channel = (*channel as i16 + delta).clamp(0, 255) as u8;
        }
    }

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, 95);
    encoder
        .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
        .map_err(|err| MutateError::Encode(err.to_string()))?;
    Ok(out)
}
