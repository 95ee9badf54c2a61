//! Feature interaction between the bottom MLP output and the embedding lookups.
//!
//! Operators are pure: the model keeps their inputs and hands them back for the backward pass.

use dlrm_distributed::InvariantViolation;
use ndarray::{Array2, Axis, concatenate, s};

use crate::config::InteractionOp;
use crate::error::TrainError;

/// Combines the dense features `x` of shape `(B, d)` with `T` embeddings of the same shape.
pub trait Interaction: Send + Sync {
    /// Output width for `num_features = T + 1` features of width `dim`.
    fn output_width(&self, num_features: usize, dim: usize) -> usize;

    /// Computes the interaction output of shape `(B, output_width)`.
    fn forward(&self, dense: &Array2<f32>, sparse: &[Array2<f32>]) -> Result<Array2<f32>, TrainError>;

    /// Gradients with respect to `dense` and every entry of `sparse`.
    fn backward(
        &self,
        dense: &Array2<f32>,
        sparse: &[Array2<f32>],
        grad: &Array2<f32>,
    ) -> Result<(Array2<f32>, Vec<Array2<f32>>), TrainError>;
}

/// Builds the operator selected in the configuration.
pub fn interaction_for(op: InteractionOp, interaction_itself: bool) -> Box<dyn Interaction> {
    match op {
        InteractionOp::Dot => Box::new(DotInteraction::new(interaction_itself)),
        InteractionOp::Cat => Box::new(CatInteraction),
    }
}

/// Pairwise dot products of `[x, e_0, .., e_{T-1}]`, appended to `x`.
///
/// Pairs `(i, j)` with `j < i` are taken row by row; `interaction_itself` adds `j == i`.
#[derive(Clone, Debug, PartialEq, Eq, derive_new::new)]
pub struct DotInteraction {
    interaction_itself: bool,
}

impl DotInteraction {
    fn pairs(&self, num_features: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let offset = usize::from(self.interaction_itself);
        (0..num_features).flat_map(move |i| (0..i + offset).map(move |j| (i, j)))
    }
}

impl Interaction for DotInteraction {
    fn output_width(&self, num_features: usize, dim: usize) -> usize {
        self.pairs(num_features).count() + dim
    }

    fn forward(&self, dense: &Array2<f32>, sparse: &[Array2<f32>]) -> Result<Array2<f32>, TrainError> {
        let features = features(dense, sparse)?;
        let (batch, dim) = dense.dim();
        let pairs: Vec<_> = self.pairs(features.len()).collect();

        let mut out = Array2::zeros((batch, dim + pairs.len()));
        out.slice_mut(s![.., ..dim]).assign(dense);
        for (k, &(i, j)) in pairs.iter().enumerate() {
            let products = (features[i] * features[j]).sum_axis(Axis(1));
            out.column_mut(dim + k).assign(&products);
        }
        Ok(out)
    }

    fn backward(
        &self,
        dense: &Array2<f32>,
        sparse: &[Array2<f32>],
        grad: &Array2<f32>,
    ) -> Result<(Array2<f32>, Vec<Array2<f32>>), TrainError> {
        let features = features(dense, sparse)?;
        let (batch, dim) = dense.dim();
        let pairs: Vec<_> = self.pairs(features.len()).collect();
        check_grad(grad, [batch, dim + pairs.len()])?;

        let mut grads: Vec<Array2<f32>> = vec![Array2::zeros((batch, dim)); features.len()];
        grads[0].assign(&grad.slice(s![.., ..dim]));
        for (k, &(i, j)) in pairs.iter().enumerate() {
            let g = grad.column(dim + k).insert_axis(Axis(1));
            grads[i] += &(features[j] * &g);
            grads[j] += &(features[i] * &g);
        }

        let dense_grad = grads.remove(0);
        Ok((dense_grad, grads))
    }
}

/// Concatenation of `[x, e_0, .., e_{T-1}]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatInteraction;

impl Interaction for CatInteraction {
    fn output_width(&self, num_features: usize, dim: usize) -> usize {
        num_features * dim
    }

    fn forward(&self, dense: &Array2<f32>, sparse: &[Array2<f32>]) -> Result<Array2<f32>, TrainError> {
        let features = features(dense, sparse)?;
        let views: Vec<_> = features.iter().map(|f| f.view()).collect();
        concatenate(Axis(1), &views).map_err(|err| TrainError::InvalidConfig(err.to_string()))
    }

    fn backward(
        &self,
        dense: &Array2<f32>,
        sparse: &[Array2<f32>],
        grad: &Array2<f32>,
    ) -> Result<(Array2<f32>, Vec<Array2<f32>>), TrainError> {
        let (batch, dim) = dense.dim();
        let num_features = features(dense, sparse)?.len();
        check_grad(grad, [batch, num_features * dim])?;

        let mut grads: Vec<_> = (0..num_features)
            .map(|f| grad.slice(s![.., f * dim..(f + 1) * dim]).to_owned())
            .collect();
        let dense_grad = grads.remove(0);
        Ok((dense_grad, grads))
    }
}

fn features<'a>(
    dense: &'a Array2<f32>,
    sparse: &'a [Array2<f32>],
) -> Result<Vec<&'a Array2<f32>>, TrainError> {
    if let Some(bad) = sparse.iter().find(|e| e.dim() != dense.dim()) {
        return Err(InvariantViolation::UnexpectedShape {
            context: "interaction input",
            expected: dense.shape().to_vec(),
            got: bad.shape().to_vec(),
        }
        .into());
    }
    Ok(std::iter::once(dense).chain(sparse).collect())
}

fn check_grad(grad: &Array2<f32>, expected: [usize; 2]) -> Result<(), TrainError> {
    if grad.shape() != expected {
        return Err(InvariantViolation::UnexpectedShape {
            context: "interaction output gradient",
            expected: expected.to_vec(),
            got: grad.shape().to_vec(),
        }
        .into());
    }
    Ok(())
}
