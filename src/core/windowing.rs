//! Pose windows and the tensor layout used for labeled samples.
//!
//! A pose sample is one frame of skeleton output laid out as
//! `(axes, joints, persons)`. A window stacks N samples along a time axis,
//! giving the `(axes, frames, joints, persons)` layout stored on labeled
//! records. Batches of windows add a leading dimension.

use ndarray::{Array3, Array4, Array5, ArrayView3, ArrayView5, ArrayViewMut5, Axis};
use serde_json::Value;

/// Shape of a single pose sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoseShape {
    pub axes: usize,
    pub joints: usize,
    pub persons: usize,
}

impl PoseShape {
    /// BODY_25 skeleton, `(x, y, confidence)` per joint, a single person.
    pub const BODY_25: PoseShape = PoseShape {
        axes: 3,
        joints: 25,
        persons: 1,
    };

    /// Number of scalars in one sample.
    pub fn len(&self) -> usize {
        self.axes * self.joints * self.persons
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PoseShape {
    fn default() -> Self {
        Self::BODY_25
    }
}

impl std::fmt::Display for PoseShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.axes, self.joints, self.persons)
    }
}

/// One frame of pose detector output.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseSample {
    /// Capture time, UTC ms
    pub timestamp_ms: i64,
    pub shape: PoseShape,
    /// `(axes, joints, persons)`
    coords: Array3<f64>,
}

/// Why a nested pose array was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeMismatch {
    NotAnArray,
    Length { depth: usize, expected: usize, found: usize },
    NotANumber,
}

impl std::fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeMismatch::NotAnArray => write!(f, "pose is not a nested array"),
            ShapeMismatch::Length {
                depth,
                expected,
                found,
            } => write!(f, "dimension {depth} has length {found}, expected {expected}"),
            ShapeMismatch::NotANumber => write!(f, "pose contains a non-numeric value"),
        }
    }
}

impl PoseSample {
    /// Build a sample from flat row-major `(axes, joints, persons)` data.
    pub fn from_flat(timestamp_ms: i64, shape: PoseShape, coords: Vec<f64>) -> Option<Self> {
        let coords = Array3::from_shape_vec((shape.axes, shape.joints, shape.persons), coords).ok()?;
        Some(Self {
            timestamp_ms,
            shape,
            coords,
        })
    }

    /// Parse a nested JSON array, requiring exactly `shape`.
    pub fn from_json(timestamp_ms: i64, pose: &Value, shape: PoseShape) -> Result<Self, ShapeMismatch> {
        let mut flat = Vec::with_capacity(shape.len());
        for axis in expect_array(pose, 0, shape.axes)? {
            for joint in expect_array(axis, 1, shape.joints)? {
                for person in expect_array(joint, 2, shape.persons)? {
                    flat.push(person.as_f64().ok_or(ShapeMismatch::NotANumber)?);
                }
            }
        }
        let found = flat.len();
        let coords = Array3::from_shape_vec((shape.axes, shape.joints, shape.persons), flat).map_err(|_| {
            ShapeMismatch::Length {
                depth: 0,
                expected: shape.len(),
                found,
            }
        })?;
        Ok(Self {
            timestamp_ms,
            shape,
            coords,
        })
    }

    pub fn get(&self, axis: usize, joint: usize, person: usize) -> f64 {
        self.coords[[axis, joint, person]]
    }

    pub fn coords(&self) -> ArrayView3<'_, f64> {
        self.coords.view()
    }
}

fn expect_array(value: &Value, depth: usize, expected: usize) -> Result<&Vec<Value>, ShapeMismatch> {
    let items = value.as_array().ok_or(ShapeMismatch::NotAnArray)?;
    if items.len() != expected {
        return Err(ShapeMismatch::Length {
            depth,
            expected,
            found: items.len(),
        });
    }
    Ok(items)
}

/// Ordered run of pose samples sharing one shape.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseWindow {
    pub shape: PoseShape,
    samples: Vec<PoseSample>,
}

impl PoseWindow {
    /// Build a window, dropping samples whose shape differs and ordering by time.
    pub fn new(shape: PoseShape, samples: impl IntoIterator<Item = PoseSample>) -> Self {
        let mut samples: Vec<PoseSample> = samples
            .into_iter()
            .filter(|s| s.shape == shape)
            .collect();
        samples.sort_by_key(|s| s.timestamp_ms);
        Self { shape, samples }
    }

    pub fn samples(&self) -> &[PoseSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time covered by the window in milliseconds.
    pub fn span_ms(&self) -> i64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.timestamp_ms - first.timestamp_ms,
            _ => 0,
        }
    }

    /// Stack the samples along the time axis as a one-batch tensor
    /// `(1, axes, frames, joints, persons)`.
    pub fn to_tensor(&self) -> PoseTensor {
        let shape = self.shape;
        let views: Vec<ArrayView3<'_, f64>> = self.samples.iter().map(PoseSample::coords).collect();
        // (frames, axes, joints, persons) -> (axes, frames, joints, persons)
        let stacked = ndarray::stack(Axis(0), &views)
            .map(|frames| frames.permuted_axes([1, 0, 2, 3]).as_standard_layout().into_owned())
            .unwrap_or_else(|_| Array4::zeros((shape.axes, 0, shape.joints, shape.persons)));
        PoseTensor::from_array(stacked.insert_axis(Axis(0)))
    }
}

/// Pick `count` indices spread evenly over `total` items.
///
/// Uses `step = max(total / count, 1)` and indices `i * step`, keeping only
/// indices that fall inside `0..total`.
pub fn downsample_indices(total: usize, count: usize) -> Vec<usize> {
    if total == 0 || count == 0 {
        return Vec::new();
    }
    let step = (total / count).max(1);
    (0..count).map(|i| i * step).take_while(|&i| i < total).collect()
}

/// Dense `(batches, axes, frames, joints, persons)` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseTensor {
    data: Array5<f64>,
}

impl PoseTensor {
    pub fn zeros(batches: usize, axes: usize, frames: usize, joints: usize, persons: usize) -> Self {
        Self {
            data: Array5::zeros((batches, axes, frames, joints, persons)),
        }
    }

    pub fn from_array(data: Array5<f64>) -> Self {
        Self { data }
    }

    pub fn view(&self) -> ArrayView5<'_, f64> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut5<'_, f64> {
        self.data.view_mut()
    }

    pub fn shape(&self) -> [usize; 5] {
        let (n, c, t, v, m) = self.data.dim();
        [n, c, t, v, m]
    }

    pub fn batches(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn get(&self, n: usize, c: usize, t: usize, v: usize, m: usize) -> f64 {
        self.data[[n, c, t, v, m]]
    }

    pub fn set(&mut self, n: usize, c: usize, t: usize, v: usize, m: usize, value: f64) {
        self.data[[n, c, t, v, m]] = value;
    }

    /// True when every value of batch `n` is zero.
    pub fn batch_is_zero(&self, n: usize) -> bool {
        self.data.index_axis(Axis(0), n).iter().all(|x| *x == 0.0)
    }

    /// Batch `n` as nested `(axes, frames, joints, persons)` JSON arrays.
    pub fn batch_to_json(&self, n: usize) -> Value {
        let batch = self.data.index_axis(Axis(0), n);
        Value::Array(
            batch
                .outer_iter()
                .map(|axis| {
                    Value::Array(
                        axis.outer_iter()
                            .map(|frame| {
                                Value::Array(
                                    frame
                                        .outer_iter()
                                        .map(|joint| Value::Array(joint.iter().copied().map(Value::from).collect()))
                                        .collect(),
                                )
                            })
                            .collect(),
                    )
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat_sample(ts: i64, fill: f64) -> PoseSample {
        PoseSample::from_flat(ts, PoseShape::BODY_25, vec![fill; PoseShape::BODY_25.len()]).unwrap()
    }

    #[test]
    fn test_downsample_spreads_over_range() {
        assert_eq!(downsample_indices(100, 10), vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);
        assert_eq!(downsample_indices(25, 10), vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    }

    #[test]
    fn test_downsample_with_fewer_items_than_requested() {
        assert_eq!(downsample_indices(4, 10), vec![0, 1, 2, 3]);
        assert!(downsample_indices(0, 10).is_empty());
    }

    #[test]
    fn test_parse_nested_pose() {
        let shape = PoseShape {
            axes: 2,
            joints: 2,
            persons: 1,
        };
        let pose = json!([[[1.0], [2.0]], [[3.0], [4.0]]]);
        let sample = PoseSample::from_json(5, &pose, shape).unwrap();
        assert_eq!(sample.get(0, 1, 0), 2.0);
        assert_eq!(sample.get(1, 0, 0), 3.0);
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        let shape = PoseShape {
            axes: 2,
            joints: 2,
            persons: 1,
        };
        let pose = json!([[[1.0], [2.0], [9.0]], [[3.0], [4.0], [9.0]]]);
        assert_eq!(
            PoseSample::from_json(5, &pose, shape),
            Err(ShapeMismatch::Length {
                depth: 1,
                expected: 2,
                found: 3
            })
        );
        assert_eq!(
            PoseSample::from_json(5, &json!([[["x"], [1]], [[1], [1]]]), shape),
            Err(ShapeMismatch::NotANumber)
        );
    }

    #[test]
    fn test_window_orders_by_time() {
        let window = PoseWindow::new(
            PoseShape::BODY_25,
            vec![flat_sample(30, 0.0), flat_sample(10, 0.0), flat_sample(20, 0.0)],
        );
        let times: Vec<i64> = window.samples().iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(times, vec![10, 20, 30]);
        assert_eq!(window.span_ms(), 20);
    }

    #[test]
    fn test_window_tensor_layout() {
        let window = PoseWindow::new(
            PoseShape::BODY_25,
            vec![flat_sample(1, 1.0), flat_sample(2, 2.0)],
        );
        let tensor = window.to_tensor();
        assert_eq!(tensor.shape(), [1, 3, 2, 25, 1]);
        assert_eq!(tensor.get(0, 2, 0, 24, 0), 1.0);
        assert_eq!(tensor.get(0, 0, 1, 3, 0), 2.0);

        let nested = tensor.batch_to_json(0);
        assert_eq!(nested.as_array().unwrap().len(), 3);
        assert_eq!(nested[0].as_array().unwrap().len(), 2);
        assert_eq!(nested[0][1][3][0], json!(2.0));
    }

    #[test]
    fn test_tensor_keeps_axis_and_joint_order() {
        let shape = PoseShape {
            axes: 2,
            joints: 3,
            persons: 1,
        };
        // value = 100 * frame + 10 * axis + joint
        let samples = (0..4).map(|t| {
            let coords = (0..2)
                .flat_map(|c| (0..3).map(move |v| (100 * t + 10 * c + v) as f64))
                .collect();
            PoseSample::from_flat(t as i64, shape, coords).unwrap()
        });
        let tensor = PoseWindow::new(shape, samples).to_tensor();

        assert_eq!(tensor.shape(), [1, 2, 4, 3, 1]);
        for t in 0..4 {
            for c in 0..2 {
                for v in 0..3 {
                    assert_eq!(tensor.get(0, c, t, v, 0), (100 * t + 10 * c + v) as f64);
                }
            }
        }
    }

    #[test]
    fn test_empty_window_gives_empty_tensor() {
        let tensor = PoseWindow::new(PoseShape::BODY_25, Vec::new()).to_tensor();
        assert_eq!(tensor.shape(), [1, 3, 0, 25, 1]);
        assert!(tensor.batch_is_zero(0));
    }
}
