//! Face chip extraction.
//!
//! Two ways of cutting a face out of a grayscale frame: an eye-aligned chip
//! for descriptor extraction, and a plain box-centred square crop for the
//! age/gender model, which is trained on unaligned crops.

use crate::types::BoundingBox;

/// Eye centres in the canonical chip, as fractions of the chip side.
const CHIP_LEFT_EYE: (f32, f32) = (0.3419, 0.4616);
const CHIP_RIGHT_EYE: (f32, f32) = (0.6565, 0.4598);

/// Row-major 2×3 similarity transform `[a, -b, tx, b, a, ty]`.
type Similarity = [f32; 6];

/// Closed-form similarity transform mapping `src_left → dst_left` and
/// `src_right → dst_right` (rotation, uniform scale, translation).
fn eye_similarity(
    src_left: (f32, f32),
    src_right: (f32, f32),
    dst_left: (f32, f32),
    dst_right: (f32, f32),
) -> Option<Similarity> {
    let (sx, sy) = (src_right.0 - src_left.0, src_right.1 - src_left.1);
    let (dx, dy) = (dst_right.0 - dst_left.0, dst_right.1 - dst_left.1);
    let norm = sx * sx + sy * sy;
    if norm < 1e-6 {
        return None;
    }

    // (a + ib) = d / s as complex numbers
    let a = (dx * sx + dy * sy) / norm;
    let b = (dy * sx - dx * sy) / norm;
    let tx = dst_left.0 - (a * src_left.0 - b * src_left.1);
    let ty = dst_left.1 - (b * src_left.0 + a * src_left.1);

    Some([a, -b, tx, b, a, ty])
}

/// Bilinear sample with zero padding outside the frame.
fn sample_bilinear(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let at = |px: i64, py: i64| -> f32 {
        if px < 0 || py < 0 || px >= width as i64 || py >= height as i64 {
            return 0.0;
        }
        frame
            .get(py as usize * width + px as usize)
            .copied()
            .unwrap_or(0) as f32
    };

    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1) * (1.0 - fx) * fy
        + at(x0 + 1, y0 + 1) * fx * fy
}

/// Fill a `size × size` chip by mapping every output pixel back into the frame.
fn resample<F>(frame: &[u8], width: u32, height: u32, size: usize, to_source: F) -> Vec<u8>
where
    F: Fn(f32, f32) -> (f32, f32),
{
    let mut chip = vec![0u8; size * size];
    for oy in 0..size {
        for ox in 0..size {
            let (sx, sy) = to_source(ox as f32, oy as f32);
            let v = sample_bilinear(frame, width as usize, height as usize, sx, sy);
            chip[oy * size + ox] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    chip
}

/// Rotate and scale the face so both eyes land on their canonical chip
/// positions. Falls back to a square crop when the eyes coincide.
pub fn align_chip(
    frame: &[u8],
    width: u32,
    height: u32,
    face: &BoundingBox,
    landmarks: &[(f32, f32); 5],
    size: usize,
) -> Vec<u8> {
    let side = size as f32;
    let dst_left = (CHIP_LEFT_EYE.0 * side, CHIP_LEFT_EYE.1 * side);
    let dst_right = (CHIP_RIGHT_EYE.0 * side, CHIP_RIGHT_EYE.1 * side);

    let Some(m) = eye_similarity(landmarks[0], landmarks[1], dst_left, dst_right) else {
        return crop_square(frame, width, height, face, 1.0, size);
    };

    let (a, b, tx, ty) = (m[0], m[3], m[2], m[5]);
    let inv = 1.0 / (a * a + b * b);
    resample(frame, width, height, size, |ox, oy| {
        let (dx, dy) = (ox - tx, oy - ty);
        ((a * dx + b * dy) * inv, (-b * dx + a * dy) * inv)
    })
}

/// Square crop centred on the box, with side `max(width, height) * scale`,
/// resampled to `size × size`.
pub fn crop_square(
    frame: &[u8],
    width: u32,
    height: u32,
    face: &BoundingBox,
    scale: f32,
    size: usize,
) -> Vec<u8> {
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let side = (face.width.max(face.height) * scale).max(1.0);
    let step = side / size as f32;
    let (x0, y0) = (cx - side / 2.0, cy - side / 2.0);

    resample(frame, width, height, size, |ox, oy| {
        (x0 + (ox + 0.5) * step - 0.5, y0 + (oy + 0.5) * step - 0.5)
    })
}
