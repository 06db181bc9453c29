use crate::dtype::DType;
use crate::tensor::Tensor;
use ndarray::{Array2, Array3, ArrayD, Axis, Ix2, IxDyn, Slice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::any::Any;

// Reduce `grad` to `target_shape` by summing over broadcast axes.
fn reduce_grad_to_shape(grad: &ArrayD<f32>, target_shape: &[usize]) -> ArrayD<f32> {
    if grad.shape() == target_shape {
        return grad.clone();
    }
    let mut res = grad.clone();
    // Leading axes the target does not have are summed away entirely.
    while res.ndim() > target_shape.len() {
        res = res.sum_axis(Axis(0));
    }
    for (axis, &dim) in target_shape.iter().enumerate() {
        if dim == 1 && res.shape()[axis] != 1 {
            res = res.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    res
}

// Move `axis` to the last position; returns the permutation applied.
fn permute_to_last(a: &ArrayD<f32>, axis: usize) -> (ArrayD<f32>, Option<Vec<usize>>) {
    let ndim = a.ndim();
    if axis == ndim - 1 {
        return (a.clone(), None);
    }
    let mut perm: Vec<usize> = (0..ndim).collect();
    let axis_val = perm.remove(axis);
    perm.push(axis_val);
    let permuted = a
        .view()
        .permuted_axes(perm.clone())
        .as_standard_layout()
        .into_owned();
    (permuted, Some(perm))
}

fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

fn permute_back(a: ArrayD<f32>, perm: &[usize]) -> ArrayD<f32> {
    a.view()
        .permuted_axes(inverse_permutation(perm))
        .as_standard_layout()
        .into_owned()
}

/// A differentiable operation on tensors.
pub trait Operation: Send + Sync {
    /// Computes the output from `inputs` into `output`.
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>);

    /// Returns one gradient per input, given the gradient of the output.
    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>>;

    fn as_any(&self) -> &dyn Any;
}

/// Reshape; element order is preserved.
pub struct Reshape {
    pub shape: Vec<usize>,
}

impl Operation for Reshape {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].array();
        *output = a
            .to_shape(IxDyn(&self.shape))
            .expect("reshape validated by Tensor::reshape")
            .to_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let in_shape = inputs[0].shape();
        vec![output_grad
            .to_shape(IxDyn(&in_shape))
            .expect("reshape backward: element count is invariant")
            .to_owned()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Axis permutation.
pub struct Permute {
    pub perm: Vec<usize>,
}

impl Operation for Permute {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].array();
        *output = a
            .view()
            .permuted_axes(self.perm.clone())
            .as_standard_layout()
            .into_owned();
    }

    fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        vec![permute_back(output_grad.clone(), &self.perm)]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sum of every element, as a scalar.
pub struct Sum;

impl Operation for Sum {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = ArrayD::from_elem(IxDyn(&[]), inputs[0].array().sum());
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let val = output_grad.iter().next().copied().unwrap_or(0.0);
        vec![ArrayD::from_elem(IxDyn(&inputs[0].shape()), val)]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Mean of every element, as a scalar.
pub struct Mean;

impl Operation for Mean {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].array();
        let n = a.len().max(1) as f32;
        *output = ArrayD::from_elem(IxDyn(&[]), a.sum() / n);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let shape = inputs[0].shape();
        let n = shape.iter().product::<usize>().max(1) as f32;
        let val = output_grad.iter().next().copied().unwrap_or(0.0);
        vec![ArrayD::from_elem(IxDyn(&shape), val / n)]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Broadcasting addition.
pub struct Add;

impl Operation for Add {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].array();
        let b = inputs[1].array();
        *output = &a + &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        vec![
            reduce_grad_to_shape(output_grad, &inputs[0].shape()),
            reduce_grad_to_shape(output_grad, &inputs[1].shape()),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Broadcasting subtraction.
pub struct Sub;

impl Operation for Sub {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].array();
        let b = inputs[1].array();
        *output = &a - &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        vec![
            reduce_grad_to_shape(output_grad, &inputs[0].shape()),
            reduce_grad_to_shape(&output_grad.mapv(|v| -v), &inputs[1].shape()),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Broadcasting element-wise multiplication.
pub struct Mul;

impl Operation for Mul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].array();
        let b = inputs[1].array();
        *output = &a * &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].array();
        let b = inputs[1].array();
        let grad_a = &b * output_grad;
        let grad_b = &a * output_grad;
        vec![
            reduce_grad_to_shape(&grad_a, a.shape()),
            reduce_grad_to_shape(&grad_b, b.shape()),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 2-D matrix multiplication.
pub struct MatMul;

impl Operation for MatMul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = as_2d(&inputs[0].array());
        let b = as_2d(&inputs[1].array());
        *output = a.dot(&b).into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = as_2d(&inputs[0].array());
        let b = as_2d(&inputs[1].array());
        let og = as_2d(output_grad);
        let grad_a = og.dot(&b.t()).into_dyn();
        let grad_b = a.t().dot(&og).into_dyn();
        vec![grad_a, grad_b]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn as_2d(a: &ArrayD<f32>) -> Array2<f32> {
    a.view()
        .into_dimensionality::<Ix2>()
        .expect("MatMul expects 2D operands")
        .to_owned()
}

// Collapse all leading axes into one batch axis.
fn as_batched(a: &ArrayD<f32>) -> Array3<f32> {
    let shape = a.shape();
    let nd = shape.len();
    let batch = shape[..nd - 2].iter().product::<usize>();
    a.to_shape((batch, shape[nd - 2], shape[nd - 1]))
        .expect("batched matmul expects rank >= 2")
        .to_owned()
}

// Per-batch product with optional transposes of either operand.
fn batched_dot(a: &ArrayD<f32>, b: &ArrayD<f32>, ta: bool, tb: bool) -> ArrayD<f32> {
    let a3 = as_batched(a);
    let b3 = as_batched(b);
    let batch = a3.shape()[0];
    let m = if ta { a3.shape()[2] } else { a3.shape()[1] };
    let n = if tb { b3.shape()[1] } else { b3.shape()[2] };
    let mut out = Array3::<f32>::zeros((batch, m, n));
    for i in 0..batch {
        let ai = a3.index_axis(Axis(0), i);
        let bi = b3.index_axis(Axis(0), i);
        let ai = if ta { ai.reversed_axes() } else { ai };
        let bi = if tb { bi.reversed_axes() } else { bi };
        out.index_axis_mut(Axis(0), i).assign(&ai.dot(&bi));
    }
    let mut shape = a.shape()[..a.ndim() - 2].to_vec();
    shape.push(m);
    shape.push(n);
    out.into_dyn()
        .to_shape(IxDyn(&shape))
        .expect("batched matmul output reshape")
        .to_owned()
}

/// Matrix multiplication over the last two axes; leading axes must match.
pub struct BatchedMatMul;

impl Operation for BatchedMatMul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = batched_dot(&inputs[0].array(), &inputs[1].array(), false, false);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].array();
        let b = inputs[1].array();
        let grad_a = batched_dot(output_grad, &b, false, true);
        let grad_b = batched_dot(&a, output_grad, true, false);
        vec![grad_a, grad_b]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Concatenation along an existing axis.
pub struct Concat(pub usize);

impl Operation for Concat {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let arrays: Vec<ArrayD<f32>> = inputs.iter().map(|t| t.array()).collect();
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        *output = ndarray::concatenate(Axis(self.0), &views)
            .expect("concat shapes validated by Tensor::concat");
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let mut start = 0;
        inputs
            .iter()
            .map(|t| {
                let len = t.shape()[self.0];
                let g = output_grad
                    .slice_axis(Axis(self.0), Slice::from(start..start + len))
                    .to_owned();
                start += len;
                g
            })
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Contiguous slice `start..start + len` along one axis.
pub struct Narrow {
    pub axis: usize,
    pub start: usize,
    pub len: usize,
}

impl Operation for Narrow {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].array();
        *output = a
            .slice_axis(Axis(self.axis), Slice::from(self.start..self.start + self.len))
            .to_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let mut g = ArrayD::<f32>::zeros(IxDyn(&inputs[0].shape()));
        g.slice_axis_mut(Axis(self.axis), Slice::from(self.start..self.start + self.len))
            .assign(output_grad);
        vec![g]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Rectified linear unit.
pub struct ReLU;

impl Operation for ReLU {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].array().mapv(|x| x.max(0.0));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].array();
        vec![output_grad * &a.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 })]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn softmax_lanes(x: &ArrayD<f32>, axis: usize) -> (ArrayD<f32>, Option<Vec<usize>>) {
    let (mut out, perm) = permute_to_last(x, axis);
    let last = out.ndim() - 1;
    for mut lane in out.lanes_mut(Axis(last)) {
        let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in lane.iter_mut() {
            *v /= sum;
        }
    }
    (out, perm)
}

/// Numerically stable softmax along `axis`.
pub struct Softmax {
    pub axis: usize,
}

impl Operation for Softmax {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let (out, perm) = softmax_lanes(&inputs[0].array(), self.axis);
        *output = match perm {
            Some(p) => permute_back(out, &p),
            None => out,
        };
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let (y, perm) = softmax_lanes(&inputs[0].array(), self.axis);
        let (og, _) = permute_to_last(output_grad, self.axis);
        let last = y.ndim() - 1;
        let mut grad = og.clone();
        for ((mut g_lane, y_lane), og_lane) in grad
            .lanes_mut(Axis(last))
            .into_iter()
            .zip(y.lanes(Axis(last)))
            .zip(og.lanes(Axis(last)))
        {
            let dot: f32 = og_lane.iter().zip(y_lane.iter()).map(|(g, y)| g * y).sum();
            for (gi, &yi) in g_lane.iter_mut().zip(y_lane.iter()) {
                *gi = yi * (*gi - dot);
            }
        }
        vec![match perm {
            Some(p) => permute_back(grad, &p),
            None => grad,
        }]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// T5 layer norm over the last axis: scale only, no mean subtraction and no
/// bias. Inputs are `[x, weight]`.
pub struct RmsNorm {
    pub eps: f32,
}

impl RmsNorm {
    fn rows(x: &ArrayD<f32>) -> Array2<f32> {
        let features = x.shape()[x.ndim() - 1];
        let rows = x.len() / features.max(1);
        x.to_shape((rows, features))
            .expect("rms norm row view")
            .to_owned()
    }
}

impl Operation for RmsNorm {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let x = inputs[0].array();
        let w = inputs[1].array();
        let mut x2 = Self::rows(&x);
        let features = x2.ncols() as f32;
        for mut row in x2.rows_mut() {
            let var = row.iter().map(|v| v * v).sum::<f32>() / features;
            let inv = 1.0 / (var + self.eps).sqrt();
            for (v, g) in row.iter_mut().zip(w.iter()) {
                *v = *v * inv * g;
            }
        }
        *output = x2
            .into_dyn()
            .to_shape(IxDyn(x.shape()))
            .expect("rms norm output reshape")
            .to_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let x = inputs[0].array();
        let w = inputs[1].array();
        let x2 = Self::rows(&x);
        let og = Self::rows(output_grad);
        let n = x2.ncols();
        let mut grad_x = Array2::<f32>::zeros(x2.raw_dim());
        let mut grad_w = ArrayD::<f32>::zeros(IxDyn(&[n]));
        for (r, (xr, gr)) in x2.rows().into_iter().zip(og.rows()).enumerate() {
            let var = xr.iter().map(|v| v * v).sum::<f32>() / n as f32;
            let inv = 1.0 / (var + self.eps).sqrt();
            let dot: f32 = (0..n).map(|j| gr[j] * w[j] * xr[j]).sum();
            for j in 0..n {
                grad_x[[r, j]] = inv * gr[j] * w[j] - inv.powi(3) * xr[j] * dot / n as f32;
                grad_w[j] += gr[j] * xr[j] * inv;
            }
        }
        let grad_x = grad_x
            .into_dyn()
            .to_shape(IxDyn(x.shape()))
            .expect("rms norm grad reshape")
            .to_owned();
        vec![grad_x, grad_w]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Inverted dropout. The keep-mask is a pure function of `seed`, so backward
/// and any later replay regenerate exactly the same mask.
pub struct Dropout {
    pub p: f32,
    pub seed: u64,
}

impl Dropout {
    fn mask(&self, shape: &[usize]) -> ArrayD<f32> {
        let keep = 1.0 - self.p;
        let mut rng = StdRng::seed_from_u64(self.seed);
        ArrayD::from_shape_simple_fn(IxDyn(shape), || {
            if rng.gen::<f32>() < keep {
                1.0 / keep
            } else {
                0.0
            }
        })
    }
}

impl Operation for Dropout {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let x = inputs[0].array();
        *output = &x * &self.mask(x.shape());
    }

    fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        vec![output_grad * &self.mask(output_grad.shape())]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Row gather from a `(rows, dim)` table; output shape is `prefix + [dim]`.
pub struct EmbeddingLookup {
    pub ids: Vec<usize>,
    pub prefix: Vec<usize>,
}

impl Operation for EmbeddingLookup {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let w = as_2d(&inputs[0].array());
        let dim = w.ncols();
        let mut out = Array2::<f32>::zeros((self.ids.len(), dim));
        for (i, &id) in self.ids.iter().enumerate() {
            out.row_mut(i).assign(&w.row(id));
        }
        let mut shape = self.prefix.clone();
        shape.push(dim);
        *output = out
            .into_dyn()
            .to_shape(IxDyn(&shape))
            .expect("embedding output reshape")
            .to_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let w_shape = inputs[0].shape();
        let dim = w_shape[1];
        let og = output_grad
            .to_shape((self.ids.len(), dim))
            .expect("embedding grad view")
            .to_owned();
        let mut g = Array2::<f32>::zeros((w_shape[0], dim));
        for (i, &id) in self.ids.iter().enumerate() {
            let mut row = g.row_mut(id);
            row += &og.row(i);
        }
        vec![g.into_dyn()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Element-wise clamp; gradient passes only where the input was in range.
pub struct Clamp {
    pub min: f32,
    pub max: f32,
}

impl Operation for Clamp {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].array().mapv(|v| v.clamp(self.min, self.max));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let x = inputs[0].array();
        let pass = x.mapv(|v| if v >= self.min && v <= self.max { 1.0 } else { 0.0 });
        vec![output_grad * &pass]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Round-trip through a reduced precision; straight-through gradient.
pub struct Cast {
    pub dtype: DType,
}

impl Operation for Cast {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = self.dtype.round_array(&inputs[0].array());
    }

    fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        vec![output_grad.clone()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Identity copy used for device moves; the caller retags the result.
pub struct Copy;

impl Operation for Copy {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].array();
    }

    fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        vec![output_grad.clone()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Mean cross-entropy of `(rows, classes)` logits against integer targets.
/// Rows whose target equals `ignore_index` contribute neither loss nor
/// gradient; with no valid rows the loss is 0.
pub struct CrossEntropy {
    pub targets: Vec<i64>,
    pub ignore_index: i64,
}

impl CrossEntropy {
    fn valid_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|&&t| t != self.ignore_index)
            .count()
    }
}

impl Operation for CrossEntropy {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let logits = as_2d(&inputs[0].array());
        let count = self.valid_count();
        let mut total = 0.0f32;
        for (row, &t) in logits.rows().into_iter().zip(self.targets.iter()) {
            if t == self.ignore_index {
                continue;
            }
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let lse = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
            total += lse - row[t as usize];
        }
        let loss = if count == 0 { 0.0 } else { total / count as f32 };
        *output = ArrayD::from_elem(IxDyn(&[]), loss);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let logits = as_2d(&inputs[0].array());
        let count = self.valid_count().max(1) as f32;
        let scale = output_grad.iter().next().copied().unwrap_or(0.0) / count;
        let mut grad = Array2::<f32>::zeros(logits.raw_dim());
        for (r, (row, &t)) in logits.rows().into_iter().zip(self.targets.iter()).enumerate() {
            if t == self.ignore_index {
                continue;
            }
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = row.iter().map(|v| (v - max).exp()).sum();
            for (c, v) in row.iter().enumerate() {
                let p = (v - max).exp() / sum;
                let y = if c as i64 == t { 1.0 } else { 0.0 };
                grad[[r, c]] = (p - y) * scale;
            }
        }
        vec![grad.into_dyn()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn reduce_grad_sums_broadcast_axes() {
        let g = ArrayD::from_elem(IxDyn(&[2, 3, 4]), 1.0f32);
        let r = reduce_grad_to_shape(&g, &[1, 3, 1]);
        assert_eq!(r.shape(), &[1, 3, 1]);
        assert_eq!(r[[0, 0, 0]], 8.0);
        let r = reduce_grad_to_shape(&g, &[4]);
        assert_eq!(r.shape(), &[4]);
        assert_eq!(r[[0]], 6.0);
    }

    #[test]
    fn batched_dot_transposes() {
        let a = arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn().insert_axis(Axis(0));
        let b = arr2(&[[1.0f32, 0.0], [0.0, 1.0]]).into_dyn().insert_axis(Axis(0));
        let out = batched_dot(&a, &b, true, false);
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_eq!(out[[0, 0, 1]], 3.0);
    }

    #[test]
    fn dropout_mask_is_reproducible() {
        let d = Dropout { p: 0.5, seed: 7 };
        assert_eq!(d.mask(&[4, 4]), d.mask(&[4, 4]));
    }
}
