//! Input sets: measurement grids, the regular test grid and its
//! train / short-range / long-range partition.

use crate::config::integer_root;
use crate::error::{BnnError, Result};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::SmallRng;
use rand::seq::index::sample;

/// Function draws evaluated on an input set, shape `[n_draws, n_points]`.
pub type SampleBatch = Array2<f64>;

/// Ordered D-dimensional input points, shape `[n_points, D]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSet {
    points: Array2<f64>,
}

impl MeasurementSet {
    pub fn new(points: Array2<f64>) -> Result<Self> {
        if points.nrows() == 0 || points.ncols() == 0 {
            return Err(BnnError::Shape(format!(
                "measurement set must be non-empty, got shape {:?}",
                points.shape()
            )));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &Array2<f64> {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    pub fn point(&self, i: usize) -> ArrayView1<'_, f64> {
        self.points.row(i)
    }

    /// Rows at `indices`, in the given order.
    pub fn select(&self, indices: &[usize]) -> Array2<f64> {
        self.points.select(ndarray::Axis(0), indices)
    }

    /// Index of the point closest to `x` in Euclidean distance.
    pub fn nearest(&self, x: ArrayView1<'_, f64>) -> usize {
        self.points
            .outer_iter()
            .map(|p| (&p - &x).mapv(|d| d * d).sum())
            .enumerate()
            .fold((0, f64::INFINITY), |best, (i, d)| {
                if d < best.1 {
                    (i, d)
                } else {
                    best
                }
            })
            .0
    }
}

/// Regular grid on the hypercube `[low, high]^D`.
///
/// Points are enumerated with the first coordinate varying fastest, so in 2-D
/// index `j * n + i` maps to `(range[i], range[j])`.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGenerator {
    pub low: f64,
    pub high: f64,
    pub input_dim: usize,
}

impl GridGenerator {
    pub fn new(low: f64, high: f64, input_dim: usize) -> Self {
        Self {
            low,
            high,
            input_dim,
        }
    }

    /// Evenly spaced axis values, endpoints included.
    pub fn axis(&self, n_per_axis: usize) -> Array1<f64> {
        if n_per_axis == 1 {
            return Array1::from_elem(1, 0.5 * (self.low + self.high));
        }
        Array1::linspace(self.low, self.high, n_per_axis)
    }

    /// Grid with `n_points` points in total; `n_points` must be a perfect
    /// `input_dim`-th power.
    pub fn generate(&self, n_points: usize) -> Result<MeasurementSet> {
        let n = integer_root(n_points, self.input_dim).ok_or_else(|| {
            BnnError::Shape(format!(
                "{n_points} points do not form a {}-dimensional grid",
                self.input_dim
            ))
        })?;
        self.generate_per_axis(n)
    }

    pub fn generate_per_axis(&self, n_per_axis: usize) -> Result<MeasurementSet> {
        let axis = self.axis(n_per_axis);
        let total = n_per_axis.pow(self.input_dim as u32);
        let mut points = Array2::<f64>::zeros((total, self.input_dim));
        for (idx, mut row) in points.outer_iter_mut().enumerate() {
            let mut rem = idx;
            for d in 0..self.input_dim {
                row[d] = axis[rem % n_per_axis];
                rem /= n_per_axis;
            }
        }
        MeasurementSet::new(points)
    }
}

/// Split of the 2-D test grid into training inputs and two holdout sets.
///
/// The periphery is every point whose index on either axis falls in the
/// first or last quarter; the interior is every point in the middle quarters
/// on both axes. Training inputs are a random subset of the periphery.
/// Short-range holdout is the rest of the periphery, long-range holdout the
/// whole interior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldoutPartition {
    pub train: Vec<usize>,
    pub short_range: Vec<usize>,
    pub long_range: Vec<usize>,
}

impl HoldoutPartition {
    pub fn new(n_per_axis: usize, n_train: usize, rng: &mut SmallRng) -> Result<Self> {
        let q1 = n_per_axis / 4;
        let q3 = 3 * n_per_axis / 4;
        let outer = |i: usize| i < q1 || i >= q3;

        let mut periphery = Vec::new();
        let mut long_range = Vec::new();
        for j in 0..n_per_axis {
            for i in 0..n_per_axis {
                let idx = j * n_per_axis + i;
                if outer(i) || outer(j) {
                    periphery.push(idx);
                } else {
                    long_range.push(idx);
                }
            }
        }
        if n_train >= periphery.len() {
            return Err(BnnError::config(format!(
                "n_train ({n_train}) leaves no short-range holdout among the {} periphery points",
                periphery.len()
            )));
        }
        if long_range.is_empty() {
            return Err(BnnError::config(format!(
                "a {n_per_axis}-point axis has no interior for the long-range holdout"
            )));
        }

        let mut chosen = sample(rng, periphery.len(), n_train).into_vec();
        chosen.sort_unstable();
        let mut in_train = vec![false; periphery.len()];
        for &c in &chosen {
            in_train[c] = true;
        }
        let train = chosen.iter().map(|&c| periphery[c]).collect();
        let short_range = periphery
            .iter()
            .zip(in_train)
            .filter(|(_, t)| !t)
            .map(|(&idx, _)| idx)
            .collect();

        Ok(Self {
            train,
            short_range,
            long_range,
        })
    }
}

/// Observed values of a field at the training inputs.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

impl TrainingData {
    pub fn new(x: Array2<f64>, y: Array1<f64>) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(BnnError::Shape(format!(
                "{} inputs but {} targets",
                x.nrows(),
                y.len()
            )));
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// A spatial anchor of the nonstationary prior grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridAnchor {
    /// Index of the anchor in the domain.
    pub index: usize,
    pub point: Array1<f64>,
}

/// Centres of a `width x height` partition of the bounding box of the first
/// two coordinates of `domain`, each snapped to its nearest domain point.
/// Anchors are ordered row by row, first axis fastest.
pub fn grid_anchors(
    domain: &MeasurementSet,
    width: usize,
    height: usize,
) -> Result<Vec<GridAnchor>> {
    if domain.dim() < 2 {
        return Err(BnnError::Shape(
            "a nonstationary grid needs at least two input dimensions".into(),
        ));
    }
    let pts = domain.points();
    let bounds = |d: usize| {
        pts.column(d)
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    };
    let (x_lo, x_hi) = bounds(0);
    let (y_lo, y_hi) = bounds(1);

    let mut anchors = Vec::with_capacity(width * height);
    for j in 0..height {
        for i in 0..width {
            let mut target = Array1::<f64>::zeros(domain.dim());
            target[0] = x_lo + (i as f64 + 0.5) * (x_hi - x_lo) / width as f64;
            target[1] = y_lo + (j as f64 + 0.5) * (y_hi - y_lo) / height as f64;
            let index = domain.nearest(target.view());
            anchors.push(GridAnchor {
                index,
                point: domain.point(index).to_owned(),
            });
        }
    }
    Ok(anchors)
}
