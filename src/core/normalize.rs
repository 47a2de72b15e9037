//! Skeleton orientation alignment.
//!
//! Reduces BODY_25 output to the 15 body joints and the two image axes, then
//! rotates every skeleton so that the torso points along +y and the shoulder
//! line along -x. Rotation angles are measured on the first person's first
//! frame and applied to the whole skeleton.

use crate::core::windowing::PoseTensor;
use nalgebra::{Rotation2, Vector2};
use ndarray::{s, ArrayViewMut4};

/// Joints kept after reduction (BODY_25 indices 0..15).
pub const BODY_JOINTS: usize = 15;

/// Axes kept after reduction (x, y).
pub const PLANE_AXES: usize = 2;

/// Below this L1 norm a bone is treated as absent.
const DEGENERATE_EPSILON: f64 = 1e-6;

/// Reference bones of the alignment.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    /// `(from, to)`: neck to mid-hip, aligned with +y
    pub spine: (usize, usize),
    /// `(from, to)`: left shoulder to right shoulder, aligned with -x
    pub shoulders: (usize, usize),
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            spine: (1, 8),
            shoulders: (5, 2),
        }
    }
}

/// The tensor cannot be reduced to the body layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedShape(pub [usize; 5]);

impl std::fmt::Display for UnsupportedShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pose tensor {:?} needs at least {PLANE_AXES} axes and {BODY_JOINTS} joints",
            self.0
        )
    }
}

impl std::error::Error for UnsupportedShape {}

impl Normalizer {
    /// Align a `(batches, axes, frames, joints, persons)` tensor.
    ///
    /// Returns a `(batches, 2, frames, 15, persons)` tensor. All-zero
    /// skeletons come back as zeros.
    pub fn normalize(&self, input: &PoseTensor) -> Result<PoseTensor, UnsupportedShape> {
        let [_, axes, frames, joints, persons] = input.shape();
        if axes < PLANE_AXES || joints < BODY_JOINTS {
            return Err(UnsupportedShape(input.shape()));
        }

        let reduced = input
            .view()
            .slice(s![.., ..PLANE_AXES, .., ..BODY_JOINTS, ..])
            .to_owned();
        let mut out = PoseTensor::from_array(reduced);
        if frames == 0 || persons == 0 {
            return Ok(out);
        }

        for mut batch in out.view_mut().outer_iter_mut() {
            if batch.iter().all(|x| *x == 0.0) {
                continue;
            }
            if let Some(rotation) = alignment(&batch, self.spine, Vector2::y()) {
                rotate_batch(&mut batch, &rotation);
            }
            if let Some(rotation) = alignment(&batch, self.shoulders, -Vector2::x()) {
                rotate_batch(&mut batch, &rotation);
            }
        }

        Ok(out)
    }
}

/// Vector from joint `from` to joint `to` on person 0, frame 0 of an
/// `(axes, frames, joints, persons)` batch.
fn bone(batch: &ArrayViewMut4<'_, f64>, (from, to): (usize, usize)) -> Vector2<f64> {
    Vector2::new(
        batch[[0, 0, to, 0]] - batch[[0, 0, from, 0]],
        batch[[1, 0, to, 0]] - batch[[1, 0, from, 0]],
    )
}

/// Rotation taking `joints` onto the direction of `target`, if the bone exists.
fn alignment(
    batch: &ArrayViewMut4<'_, f64>,
    joints: (usize, usize),
    target: Vector2<f64>,
) -> Option<Rotation2<f64>> {
    let v = bone(batch, joints);
    if v.lp_norm(1) < DEGENERATE_EPSILON {
        return None;
    }
    Some(Rotation2::rotation_between(&v, &target))
}

fn rotate_batch(batch: &mut ArrayViewMut4<'_, f64>, rotation: &Rotation2<f64>) {
    let (_, frames, joints, persons) = batch.dim();
    for m in 0..persons {
        for t in 0..frames {
            if batch.slice(s![.., t, .., m]).iter().all(|x| *x == 0.0) {
                continue;
            }
            for v in 0..joints {
                let p = rotation * Vector2::new(batch[[0, t, v, m]], batch[[1, t, v, m]]);
                batch[[0, t, v, m]] = p.x;
                batch[[1, t, v, m]] = p.y;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    /// One-batch, one-person tensor with the given `(x, y)` per joint per frame.
    fn tensor_from(frames: &[Vec<(f64, f64)>], axes: usize, joints: usize) -> PoseTensor {
        let mut t = PoseTensor::zeros(1, axes, frames.len(), joints, 1);
        for (f, points) in frames.iter().enumerate() {
            for (v, (x, y)) in points.iter().enumerate().take(joints) {
                t.set(0, 0, f, v, 0, *x);
                t.set(0, 1, f, v, 0, *y);
                if axes > 2 {
                    t.set(0, 2, f, v, 0, 0.9);
                }
            }
        }
        t
    }

    fn skeleton(offset: (f64, f64), spin: f64) -> Vec<(f64, f64)> {
        let (s, c) = spin.sin_cos();
        (0..25)
            .map(|v| {
                let (x, y) = match v {
                    1 => (0.0, 0.0),
                    8 => (0.0, 3.0),
                    2 => (-1.0, 0.0),
                    5 => (1.0, 0.0),
                    _ => (v as f64 * 0.1, v as f64 * -0.2),
                };
                (c * x - s * y + offset.0, s * x + c * y + offset.1)
            })
            .collect()
    }

    fn first_bone(t: &PoseTensor, (from, to): (usize, usize)) -> (f64, f64) {
        (
            t.get(0, 0, 0, to, 0) - t.get(0, 0, 0, from, 0),
            t.get(0, 1, 0, to, 0) - t.get(0, 1, 0, from, 0),
        )
    }

    fn assert_close(a: &PoseTensor, b: &PoseTensor) {
        assert_eq!(a.shape(), b.shape());
        let [n, c, t, v, m] = a.shape();
        for i in 0..n {
            for j in 0..c {
                for k in 0..t {
                    for l in 0..v {
                        for p in 0..m {
                            let (x, y) = (a.get(i, j, k, l, p), b.get(i, j, k, l, p));
                            assert!((x - y).abs() < EPS, "{x} != {y} at {:?}", (i, j, k, l, p));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_reduces_to_body_layout() {
        let input = tensor_from(&[skeleton((0.0, 0.0), 0.0)], 3, 25);
        let out = Normalizer::default().normalize(&input).unwrap();
        assert_eq!(out.shape(), [1, 2, 1, 15, 1]);
    }

    #[test]
    fn test_aligned_input_is_unchanged() {
        let input = tensor_from(&[skeleton((0.0, 0.0), 0.0)], 2, 15);
        let out = Normalizer::default().normalize(&input).unwrap();
        assert_close(&out, &input);
    }

    #[test]
    fn test_rotated_skeleton_is_aligned() {
        let input = tensor_from(&[skeleton((0.0, 0.0), 0.7)], 3, 25);
        let out = Normalizer::default().normalize(&input).unwrap();

        let shoulders = first_bone(&out, (5, 2));
        assert!(shoulders.0 < 0.0);
        assert!(shoulders.1.abs() < EPS);
        let spine = first_bone(&out, (1, 8));
        assert!(spine.0.abs() < EPS);
        assert!(spine.1 > 0.0);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let frames = vec![skeleton((2.0, 1.0), -1.2), skeleton((2.5, 1.0), -1.1)];
        let input = tensor_from(&frames, 3, 25);
        let normalizer = Normalizer::default();
        let once = normalizer.normalize(&input).unwrap();
        let twice = normalizer.normalize(&once).unwrap();
        assert_close(&once, &twice);
    }

    #[test]
    fn test_zero_skeleton_is_identity() {
        let input = PoseTensor::zeros(2, 2, 4, 15, 1);
        let out = Normalizer::default().normalize(&input).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_zero_frames_are_left_alone() {
        let mut frames = vec![skeleton((0.0, 0.0), 0.4)];
        frames.push(vec![(0.0, 0.0); 25]);
        let input = tensor_from(&frames, 2, 25);
        let out = Normalizer::default().normalize(&input).unwrap();
        for v in 0..BODY_JOINTS {
            assert_eq!(out.get(0, 0, 1, v, 0), 0.0);
            assert_eq!(out.get(0, 1, 1, v, 0), 0.0);
        }
    }

    #[test]
    fn test_rejects_small_layouts() {
        let input = PoseTensor::zeros(1, 1, 1, 25, 1);
        assert!(Normalizer::default().normalize(&input).is_err());
    }
}
