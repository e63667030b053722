//! Module `model` implement the linear regression model used by interior
//! and leaf nodes, and its trainer.
//!
//! Single-feature keys are solved in closed form over running sums. Multi
//! feature keys, like byte-string keys, are solved as a least squares
//! problem behind the [LeastSquares] trait, so that a deterministic solver
//! can be stubbed in while testing. Training can optionally run over a
//! progressively grown sample, refer [build_model].

use std::{cmp, fmt, result};

use crate::{types::FeatureKey, Error, Result};

// Sampling schedule while training approximate models.
const SAMPLE_MULTIPLIER: usize = 2;
const SAMPLE_LOWER_BOUND: usize = 10;
const REL_CHANGE_THRESHOLD: f64 = 0.01;
const ABS_CHANGE_THRESHOLD: f64 = 0.5;

// Rank-deficiency threshold for the default solver's pivots.
const PIVOT_EPSILON: f64 = 1e-11;

/// Linear regression model, mapping a key's feature vector to a position.
///
/// `predict(key) = floor(Σ slope[i] * feature(i) + intercept)`
#[derive(Clone, Default)]
pub struct LinearModel {
    pub slope: Vec<f64>,
    pub intercept: f64,
}

impl fmt::Debug for LinearModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "linear_model<{:?},{}>", self.slope, self.intercept)
    }
}

impl LinearModel {
    pub fn new(slope: Vec<f64>, intercept: f64) -> LinearModel {
        LinearModel { slope, intercept }
    }

    /// A model that predicts ZERO for every key, the superroot's model.
    pub fn zero<K>() -> LinearModel
    where
        K: FeatureKey,
    {
        LinearModel {
            slope: vec![0.0; K::feature_len()],
            intercept: 0.0,
        }
    }

    /// Predicted position for key, floored to an integer, can be negative.
    #[inline]
    pub fn predict<K>(&self, key: &K) -> i64
    where
        K: FeatureKey,
    {
        self.predict_double(key).floor() as i64
    }

    /// Same as [LinearModel::predict] without flooring.
    #[inline]
    pub fn predict_double<K>(&self, key: &K) -> f64
    where
        K: FeatureKey,
    {
        let mut result = self.intercept;
        for (i, a) in self.slope.iter().enumerate() {
            result += key.feature(i) * a;
        }
        result
    }

    /// Scale the output range of this model by `factor`.
    pub fn expand(&mut self, factor: f64) {
        for a in self.slope.iter_mut() {
            *a *= factor;
        }
        self.intercept *= factor;
    }
}

/// Least squares solver, minimizing `‖b − Ax‖₂`.
///
/// `a` is an `m x n` row-major design matrix, `b` carries the `m` target
/// values and receives the `n` solved parameters. Return value follows the
/// LAPACK `dgels` convention:
///
/// * `0`, solved, parameters are in `b[..n]`.
/// * `k > 0`, the k-th column (1-based) is linearly dependent, no solution;
///   callers drop a feature and retry.
/// * `k < 0`, illegal argument, treated as an un-recoverable bug.
pub trait LeastSquares {
    fn solve_least_squares(&self, a: &mut [f64], m: usize, n: usize, b: &mut [f64]) -> i32;
}

/// Default [LeastSquares] solver, normal equations with partial pivoting.
#[derive(Clone, Default)]
pub struct NormalEquations;

impl LeastSquares for NormalEquations {
    fn solve_least_squares(&self, a: &mut [f64], m: usize, n: usize, b: &mut [f64]) -> i32 {
        if n == 0 || a.len() < m * n || b.len() < cmp::max(m, n) {
            return -1;
        }

        // gram = AᵀA (n x n), rhs = Aᵀb (n)
        let mut gram = vec![0.0_f64; n * n];
        let mut rhs = vec![0.0_f64; n];
        for row in 0..m {
            for i in 0..n {
                let ai = a[row * n + i];
                rhs[i] += ai * b[row];
                for j in i..n {
                    gram[i * n + j] += ai * a[row * n + j];
                }
            }
        }
        for i in 0..n {
            for j in 0..i {
                gram[i * n + j] = gram[j * n + i];
            }
        }

        let scale = gram
            .iter()
            .fold(0.0_f64, |acc, x| if x.abs() > acc { x.abs() } else { acc });
        let epsilon = PIVOT_EPSILON * if scale > 0.0 { scale } else { 1.0 };

        // gaussian elimination with partial pivoting over the gram matrix.
        // rows get swapped, columns keep their original order.
        for col in 0..n {
            let pivot_row = (col..n)
                .max_by(|x, y| {
                    let (px, py) = (gram[x * n + col].abs(), gram[y * n + col].abs());
                    px.partial_cmp(&py).unwrap_or(cmp::Ordering::Equal)
                })
                .unwrap();
            if gram[pivot_row * n + col].abs() <= epsilon {
                // rank deficient, report the column 1-based so the caller
                // can drop that feature.
                return (col + 1) as i32;
            }
            if pivot_row != col {
                for j in 0..n {
                    gram.swap(col * n + j, pivot_row * n + j);
                }
                rhs.swap(col, pivot_row);
            }
            for row in (col + 1)..n {
                let factor = gram[row * n + col] / gram[col * n + col];
                for j in col..n {
                    gram[row * n + j] -= factor * gram[col * n + j];
                }
                rhs[row] -= factor * rhs[col];
            }
        }

        // back substitution
        let mut x = vec![0.0_f64; n];
        for col in (0..n).rev() {
            let mut acc = rhs[col];
            for j in (col + 1)..n {
                acc -= gram[col * n + j] * x[j];
            }
            x[col] = acc / gram[col * n + col];
        }

        b[..n].copy_from_slice(&x);
        0
    }
}

/// Builder type, accumulate `(key, position)` samples and solve for a
/// [LinearModel] via ordinary least squares.
pub struct ModelBuilder<K, S = NormalEquations>
where
    K: FeatureKey,
    S: LeastSquares,
{
    solver: S,

    // single feature accumulators
    count: usize,
    x_sum: f64,
    y_sum: f64,
    xx_sum: f64,
    xy_sum: f64,
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,

    // multi feature samples
    training_keys: Vec<K>,
    positions: Vec<f64>,
}

impl<K> ModelBuilder<K>
where
    K: FeatureKey,
{
    pub fn new() -> ModelBuilder<K> {
        ModelBuilder::with_solver(NormalEquations)
    }
}

impl<K> Default for ModelBuilder<K>
where
    K: FeatureKey,
{
    fn default() -> Self {
        ModelBuilder::new()
    }
}

impl<K, S> ModelBuilder<K, S>
where
    K: FeatureKey,
    S: LeastSquares,
{
    pub fn with_solver(solver: S) -> ModelBuilder<K, S> {
        ModelBuilder {
            solver,

            count: 0,
            x_sum: 0.0,
            y_sum: 0.0,
            xx_sum: 0.0,
            xy_sum: 0.0,
            x_min: f64::MAX,
            x_max: f64::MIN,
            y_min: f64::MAX,
            y_max: f64::MIN,

            training_keys: Vec::default(),
            positions: Vec::default(),
        }
    }

    /// Accumulate one `(key, position)` sample.
    pub fn add(&mut self, key: &K, y: f64) {
        if K::feature_len() == 1 {
            let x = key.feature(0);
            self.count += 1;
            self.x_sum += x;
            self.y_sum += y;
            self.xx_sum += x * x;
            self.xy_sum += x * y;
            self.x_min = f64::min(x, self.x_min);
            self.x_max = f64::max(x, self.x_max);
            self.y_min = f64::min(y, self.y_min);
            self.y_max = f64::max(y, self.y_max);
        } else {
            self.training_keys.push(key.clone());
            self.positions.push(y);
        }
    }

    /// Solve for the model over accumulated samples.
    pub fn build(&mut self) -> Result<LinearModel> {
        match K::feature_len() {
            1 => Ok(self.build_single()),
            _ => self.build_multi(),
        }
    }

    fn build_single(&mut self) -> LinearModel {
        let mut model = LinearModel::new(vec![0.0], 0.0);
        let count = self.count as f64;

        if self.count == 0 {
            return model;
        } else if self.count == 1 {
            model.intercept = self.y_sum;
            return model;
        }

        let denominator = (count * self.xx_sum) - (self.x_sum * self.x_sum);
        if denominator == 0.0 {
            // all samples carry the same key
            model.intercept = self.y_sum / count;
            return model;
        }

        model.slope[0] = ((count * self.xy_sum) - (self.x_sum * self.y_sum)) / denominator;
        model.intercept = (self.y_sum - (model.slope[0] * self.x_sum)) / count;

        // a spurious negative regression out of finite-precision arithmetic
        // on near-constant keys, fit the spline through the extremes.
        if model.slope[0] <= 0.0 {
            model.slope[0] = (self.y_max - self.y_min) / (self.x_max - self.x_min);
            model.intercept = -self.x_min * model.slope[0];
        }
        model
    }

    fn build_multi(&mut self) -> Result<LinearModel> {
        let feature_len = K::feature_len();
        let mut model = LinearModel::new(vec![0.0; feature_len], 0.0);

        if self.positions.is_empty() {
            return Ok(model);
        } else if self.positions.len() == 1 {
            model.intercept = self.positions[0];
            return Ok(model);
        }

        // columns that actually vary across the sample, constant columns,
        // like a common prefix in byte-string keys, are skipped.
        let mut useful: Vec<usize> = vec![];
        for feat in 0..feature_len {
            let first = self.training_keys[0].feature(feat);
            let varies = self.training_keys[1..].iter().any(|k| k.feature(feat) != first);
            if varies {
                useful.push(feat);
            }
        }

        let m = self.training_keys.len();
        let mut use_bias = true;
        loop {
            let n = useful.len() + (use_bias as usize);
            if n == 0 {
                // every feature dropped, degenerate to the mean position
                model.slope.iter_mut().for_each(|a| *a = 0.0);
                model.intercept = self.positions.iter().sum::<f64>() / (m as f64);
                break Ok(model);
            }

            let mut a = vec![0.0_f64; m * n];
            let mut b = vec![0.0_f64; cmp::max(m, n)];
            for (row, key) in self.training_keys.iter().enumerate() {
                for (col, feat) in useful.iter().enumerate() {
                    a[row * n + col] = key.feature(*feat);
                }
                if use_bias {
                    a[(row * n) + n - 1] = 1.0;
                }
                b[row] = self.positions[row];
            }

            let code = self.solver.solve_least_squares(&mut a, m, n, &mut b);
            if code == 0 {
                model.slope.iter_mut().for_each(|a| *a = 0.0);
                for (col, feat) in useful.iter().enumerate() {
                    model.slope[*feat] = b[col];
                }
                model.intercept = if use_bias { b[n - 1] } else { 0.0 };
                break Ok(model);
            } else if code > 0 {
                // k-th column is linearly dependent, drop and retry.
                let k = code as usize;
                if k > useful.len() {
                    use_bias = false;
                } else {
                    useful.remove(k - 1);
                }
            } else {
                break err_at!(Fatal, msg: "least squares solver failed with {}", code);
            }
        }
    }
}

/// Train a model mapping each of the sorted `keys` to its dense position
/// `0..keys.len()`. With `approximate`, training runs over a progressively
/// grown sample, the sample doubles until the solved parameters stabilize
/// within tolerance.
pub fn build_model<K>(keys: &[K], approximate: bool) -> Result<LinearModel>
where
    K: FeatureKey,
{
    if !approximate || keys.len() < (SAMPLE_LOWER_BOUND * SAMPLE_MULTIPLIER) {
        let mut builder = ModelBuilder::new();
        for (i, key) in keys.iter().enumerate() {
            builder.add(key, i as f64);
        }
        return builder.build();
    }

    let mut step = 1_usize;
    {
        let mut sample_size = keys.len();
        while sample_size >= SAMPLE_LOWER_BOUND {
            sample_size /= SAMPLE_MULTIPLIER;
            step *= SAMPLE_MULTIPLIER;
        }
        step /= SAMPLE_MULTIPLIER;
    }

    let mut model = build_model_with_step(keys, step)?;
    while step > 1 {
        step /= SAMPLE_MULTIPLIER;
        let refined = build_model_with_step(keys, step)?;

        let mut within = true;
        for (a, pa) in refined.slope.iter().zip(model.slope.iter()) {
            let rel = if *pa == 0.0 {
                a.abs()
            } else {
                ((a - pa) / pa).abs()
            };
            if rel > REL_CHANGE_THRESHOLD {
                within = false;
                break;
            }
        }
        let abs_b = (refined.intercept - model.intercept).abs();
        let rel_b = if model.intercept == 0.0 {
            abs_b
        } else {
            (abs_b / model.intercept).abs()
        };
        model = refined;
        if within && (rel_b < REL_CHANGE_THRESHOLD || abs_b < ABS_CHANGE_THRESHOLD) {
            break;
        }
    }
    Ok(model)
}

fn build_model_with_step<K>(keys: &[K], step: usize) -> Result<LinearModel>
where
    K: FeatureKey,
{
    let mut builder = ModelBuilder::new();
    let mut i = 0;
    while i < keys.len() {
        builder.add(&keys[i], i as f64);
        i += step;
    }
    builder.build()
}

#[cfg(test)]
#[path = "model_test.rs"]
mod model_test;
