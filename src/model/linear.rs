use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use serde::{Deserialize, Serialize};

use super::{Model, ModelError, StepStats};
use crate::orchestra::Batch;

/// The objective function evaluated on the model's output.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Softmax output with cross-entropy against the target posteriors.
    #[default]
    Xent,
    /// Linear output with a squared error against the dense targets.
    Mse,
}

const MIN_PROB: f32 = 1e-20;

/// A single affine layer trained with plain SGD.
///
/// The parameters are stored flat as `[weights (output_dim x input_dim) | bias (output_dim)]`.
#[derive(Debug, Clone)]
pub struct SoftmaxLinear {
    input_dim: usize,
    output_dim: usize,
    learning_rate: f32,
    objective: Objective,
    params: Vec<f32>,

    frames: u64,
    total_objective: f64,
}

impl SoftmaxLinear {
    /// Creates a new zero-initialized `SoftmaxLinear`.
    ///
    /// # Arguments
    /// * `input_dim` - The feature dimension.
    /// * `output_dim` - The amount of target classes.
    /// * `learning_rate` - The SGD step size.
    /// * `objective` - The objective to optimize.
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        learning_rate: f32,
        objective: Objective,
    ) -> Self {
        Self {
            input_dim,
            output_dim,
            learning_rate,
            objective,
            params: vec![0.0; (input_dim + 1) * output_dim],
            frames: 0,
            total_objective: 0.0,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// The amount of frames seen since creation.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// The average objective per frame seen since creation.
    pub fn avg_objective(&self) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }

        self.total_objective / self.frames as f64
    }

    fn split(&self) -> usize {
        self.input_dim * self.output_dim
    }

    fn forward(&self, feats: ArrayView2<f32>) -> Result<Array2<f32>, ModelError> {
        let (weights, bias) = self.params.split_at(self.split());
        let weights = ArrayView2::from_shape((self.output_dim, self.input_dim), weights)
            .map_err(|_| ModelError::InvalidInput("malformed parameter buffer"))?;
        let bias = ArrayView1::from(bias);

        let mut out = feats.dot(&weights.t()) + &bias;

        if self.objective == Objective::Xent {
            for mut row in out.rows_mut() {
                let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                row.mapv_inplace(|x| (x - max).exp());
                let sum = row.sum();
                row /= sum;
            }
        }

        Ok(out)
    }

    /// Evaluates the objective and returns it along with the weighted output derivative.
    fn evaluate(&self, batch: &Batch, out: Array2<f32>) -> Result<(f64, Array2<f32>), ModelError> {
        let mut diff = out;
        let mut objective = 0.0_f64;

        for (r, target) in batch.targets.iter().enumerate() {
            let weight = batch.weights[r];

            for &(class, prob) in target {
                if class >= self.output_dim {
                    return Err(ModelError::ShapeMismatch {
                        what: "target class",
                        got: class,
                        expected: self.output_dim,
                    });
                }

                if self.objective == Objective::Xent {
                    let y = diff[[r, class]].max(MIN_PROB);
                    objective -= f64::from(weight * prob * y.ln());
                }

                diff[[r, class]] -= prob;
            }

            let mut row = diff.row_mut(r);
            if self.objective == Objective::Mse {
                let sq: f32 = row.iter().map(|d| d * d).sum();
                objective += f64::from(0.5 * weight * sq);
            }
            row *= weight;
        }

        if !objective.is_finite() {
            return Err(ModelError::NonFinite("objective"));
        }

        Ok((objective, diff))
    }

    fn backward(&mut self, feats: ArrayView2<f32>, diff: &Array2<f32>) -> Result<(), ModelError> {
        let grad_weights = diff.t().dot(&feats);
        let grad_bias = diff.sum_axis(Axis(0));

        let split = self.split();
        let lr = self.learning_rate;
        let (weights, bias) = self.params.split_at_mut(split);

        let mut weights = ArrayViewMut2::from_shape((self.output_dim, self.input_dim), weights)
            .map_err(|_| ModelError::InvalidInput("malformed parameter buffer"))?;
        weights.scaled_add(-lr, &grad_weights);

        bias.iter_mut()
            .zip(grad_bias.iter())
            .for_each(|(b, g)| *b -= lr * g);

        if self.params.iter().any(|p| !p.is_finite()) {
            return Err(ModelError::NonFinite("parameters"));
        }

        Ok(())
    }
}

impl Model for SoftmaxLinear {
    fn step(&mut self, batch: &Batch, eval: bool) -> Result<StepStats, ModelError> {
        let (rows, dim) = batch.feats.dim();

        if dim != self.input_dim {
            return Err(ModelError::ShapeMismatch {
                what: "input dim",
                got: dim,
                expected: self.input_dim,
            });
        }

        if batch.targets.len() != rows || batch.weights.len() != rows {
            return Err(ModelError::ShapeMismatch {
                what: "batch rows",
                got: batch.targets.len().min(batch.weights.len()),
                expected: rows,
            });
        }

        let out = self.forward(batch.feats.view())?;
        let (objective, diff) = self.evaluate(batch, out)?;

        if !eval {
            self.backward(batch.feats.view(), &diff)?;
        }

        self.frames += rows as u64;
        self.total_objective += objective;
        Ok(StepStats::new(rows, objective))
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn feature_dim(&self) -> Option<usize> {
        Some(self.input_dim)
    }

    fn info(&self) -> String {
        format!(
            "SoftmaxLinear {}x{} ({:?}): {} frames, avg objective {:.4}",
            self.input_dim,
            self.output_dim,
            self.objective,
            self.frames,
            self.avg_objective()
        )
    }
}
