use crate::device::Device;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::{
    Add, BatchedMatMul, Cast, Clamp, Concat, Copy, CrossEntropy, Dropout, EmbeddingLookup,
    MatMul, Mean, Mul, Narrow, Operation, Permute, ReLU, Reshape, RmsNorm, Softmax, Sub, Sum,
};
use ndarray::{ArrayD, IxDyn};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Runs `f` without recording any graph edges. Tensors produced inside are
/// plain leaves that do not require gradients.
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
    let prev = GRAD_ENABLED.with(|g| g.replace(false));
    let out = f();
    GRAD_ENABLED.with(|g| g.set(prev));
    out
}

pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

/// `TensorData` contains the actual data of a tensor, along with metadata for automatic differentiation.
pub struct TensorData {
    /// Values, always stored as f32; `dtype` records the emulated precision.
    pub data: ArrayD<f32>,
    pub grad: Option<ArrayD<f32>>,
    /// The operation that created this tensor, if any.
    pub creator: Option<Arc<dyn Operation + Send + Sync>>,
    pub inputs: Vec<Tensor>,
    pub requires_grad: bool,
    pub dtype: DType,
    pub device: Device,
}

/// A multi-dimensional array that supports automatic differentiation.
///
/// Cloning a `Tensor` clones the handle, not the data; equality and hashing
/// are by node identity, so two handles compare equal exactly when they are
/// the same graph node.
#[derive(Clone)]
pub struct Tensor(Arc<Mutex<TensorData>>);

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lock = self.lock();
        f.debug_struct("Tensor")
            .field("shape", &lock.data.shape())
            .field("dtype", &lock.dtype)
            .field("device", &lock.device)
            .field("requires_grad", &lock.requires_grad)
            .finish()
    }
}

impl Tensor {
    pub fn new(data: ArrayD<f32>, requires_grad: bool) -> Self {
        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: None,
            inputs: vec![],
            requires_grad,
            dtype: DType::F32,
            device: Device::Cpu,
        })))
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Tensor::new(ArrayD::zeros(IxDyn(shape)), false)
    }

    pub fn scalar(v: f32) -> Self {
        Tensor::new(ArrayD::from_elem(IxDyn(&[]), v), false)
    }

    /// Applies an operation to a set of input tensors.
    ///
    /// This is the primary way that computation graphs are constructed. The
    /// result inherits precision and placement from the first input.
    pub fn apply(op: Arc<dyn Operation + Send + Sync>, inputs: &[Tensor]) -> Tensor {
        Tensor::apply_inner(op, inputs, false)
    }

    /// Like `apply`, but records the node whenever grad mode is on, even if
    /// no input requires gradients. For ops that reach parameters the graph
    /// cannot see, such as checkpointed replays.
    pub fn apply_tracked(op: Arc<dyn Operation + Send + Sync>, inputs: &[Tensor]) -> Tensor {
        Tensor::apply_inner(op, inputs, true)
    }

    fn apply_inner(
        op: Arc<dyn Operation + Send + Sync>,
        inputs: &[Tensor],
        always_track: bool,
    ) -> Tensor {
        let record = is_grad_enabled();
        let requires_grad =
            record && (always_track || inputs.iter().any(|t| t.requires_grad()));
        let (dtype, device) = inputs
            .first()
            .map(|t| {
                let lock = t.lock();
                (lock.dtype, lock.device)
            })
            .unwrap_or_default();

        let mut data = ArrayD::zeros(IxDyn(&[0]));
        op.forward(inputs, &mut data);
        // Results are stored at the precision they carry, so reduced-precision
        // arithmetic overflows where the real format would.
        if dtype.is_reduced() {
            data = dtype.round_array(&data);
        }

        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: if requires_grad { Some(op) } else { None },
            inputs: if requires_grad { inputs.to_vec() } else { vec![] },
            requires_grad,
            dtype,
            device,
        })))
    }

    pub fn add(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Add), &[self.clone(), other.clone()])
    }

    pub fn sub(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Sub), &[self.clone(), other.clone()])
    }

    pub fn mul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Mul), &[self.clone(), other.clone()])
    }

    /// Multiplies by a constant.
    pub fn scale(&self, factor: f32) -> Tensor {
        self.mul(&Tensor::scalar(factor))
    }

    /// 2-D matrix multiplication.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(MatMul), &[self.clone(), other.clone()])
    }

    /// Matrix multiplication over the last two axes with matching leading
    /// axes, e.g. `[b, h, q, d] x [b, h, d, k] -> [b, h, q, k]`.
    pub fn batched_matmul(&self, other: &Tensor) -> Result<Tensor> {
        let a = self.shape();
        let b = other.shape();
        if a.len() < 2 || a.len() != b.len() || a[..a.len() - 2] != b[..b.len() - 2] {
            return Err(Error::Shape(format!(
                "batched matmul needs matching leading axes, got {:?} and {:?}",
                a, b
            )));
        }
        if a[a.len() - 1] != b[b.len() - 2] {
            return Err(Error::Shape(format!(
                "batched matmul inner dimensions differ: {:?} x {:?}",
                a, b
            )));
        }
        Ok(Tensor::apply(
            Arc::new(BatchedMatMul),
            &[self.clone(), other.clone()],
        ))
    }

    /// Applies `x @ w` to the last axis of a tensor of any rank, where `w`
    /// is a 2-D `[in, out]` matrix.
    pub fn linear(&self, w: &Tensor) -> Result<Tensor> {
        let shape = self.shape();
        let w_shape = w.shape();
        let features = *shape.last().unwrap_or(&0);
        if w_shape.len() != 2 || w_shape[0] != features {
            return Err(Error::Shape(format!(
                "cannot project {:?} with weight {:?}",
                shape, w_shape
            )));
        }
        let rows = shape.iter().product::<usize>() / features.max(1);
        let flat = self.reshape(vec![rows, features])?;
        let mut out_shape = shape[..shape.len() - 1].to_vec();
        out_shape.push(w_shape[1]);
        flat.matmul(w).reshape(out_shape)
    }

    pub fn relu(&self) -> Tensor {
        Tensor::apply(Arc::new(ReLU), &[self.clone()])
    }

    pub fn sum(&self) -> Tensor {
        Tensor::apply(Arc::new(Sum), &[self.clone()])
    }

    pub fn mean(&self) -> Tensor {
        Tensor::apply(Arc::new(Mean), &[self.clone()])
    }

    pub fn softmax(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(Softmax { axis }), &[self.clone()])
    }

    /// T5 layer norm over the last axis with a learned scale.
    pub fn rms_norm(&self, weight: &Tensor, eps: f32) -> Tensor {
        Tensor::apply(Arc::new(RmsNorm { eps }), &[self.clone(), weight.clone()])
    }

    /// Inverted dropout with a reproducible mask. Identity when `p == 0`.
    pub fn dropout(&self, p: f32, seed: u64) -> Tensor {
        if p <= 0.0 {
            return self.clone();
        }
        Tensor::apply(Arc::new(Dropout { p, seed }), &[self.clone()])
    }

    /// Gathers rows of `self` (a `[rows, dim]` table) by `ids`.
    pub fn embedding(&self, ids: &[usize], prefix: Vec<usize>) -> Result<Tensor> {
        let shape = self.shape();
        if shape.len() != 2 {
            return Err(Error::Shape(format!(
                "embedding table must be 2-D, got {:?}",
                shape
            )));
        }
        if let Some(bad) = ids.iter().find(|&&id| id >= shape[0]) {
            return Err(Error::Shape(format!(
                "token id {} out of range for vocabulary of {}",
                bad, shape[0]
            )));
        }
        Ok(Tensor::apply(
            Arc::new(EmbeddingLookup {
                ids: ids.to_vec(),
                prefix,
            }),
            &[self.clone()],
        ))
    }

    pub fn clamp(&self, min: f32, max: f32) -> Tensor {
        Tensor::apply(Arc::new(Clamp { min, max }), &[self.clone()])
    }

    /// Converts to `dtype`, rounding values through that precision. No-op
    /// when the precision already matches.
    pub fn astype(&self, dtype: DType) -> Tensor {
        if self.dtype() == dtype {
            return self.clone();
        }
        let out = Tensor::apply(Arc::new(Cast { dtype }), &[self.clone()]);
        out.lock().dtype = dtype;
        out
    }

    /// Moves to `device`. No-op when already there.
    pub fn to_device(&self, device: Device) -> Tensor {
        if self.device() == device {
            return self.clone();
        }
        let out = Tensor::apply(Arc::new(Copy), &[self.clone()]);
        out.lock().device = device;
        out
    }

    /// Mean cross-entropy of `[rows, classes]` logits, skipping `ignore_index`.
    pub fn cross_entropy(&self, targets: &[i64], ignore_index: i64) -> Result<Tensor> {
        let shape = self.shape();
        if shape.len() != 2 || shape[0] != targets.len() {
            return Err(Error::Shape(format!(
                "cross entropy needs [rows, classes] logits for {} targets, got {:?}",
                targets.len(),
                shape
            )));
        }
        if let Some(bad) = targets
            .iter()
            .find(|&&t| t != ignore_index && (t < 0 || t as usize >= shape[1]))
        {
            return Err(Error::Shape(format!(
                "target {} out of range for {} classes",
                bad, shape[1]
            )));
        }
        Ok(Tensor::apply(
            Arc::new(CrossEntropy {
                targets: targets.to_vec(),
                ignore_index,
            }),
            &[self.clone()],
        ))
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor> {
        let current = self.shape();
        if current.iter().product::<usize>() != shape.iter().product::<usize>() {
            return Err(Error::Shape(format!(
                "cannot reshape tensor from {:?} to {:?}",
                current, shape
            )));
        }
        if current == shape {
            return Ok(self.clone());
        }
        Ok(Tensor::apply(Arc::new(Reshape { shape }), &[self.clone()]))
    }

    pub fn permute(&self, perm: Vec<usize>) -> Result<Tensor> {
        let ndim = self.shape().len();
        let mut seen = perm.clone();
        seen.sort_unstable();
        if seen != (0..ndim).collect::<Vec<_>>() {
            return Err(Error::Shape(format!(
                "{:?} is not a permutation of {} axes",
                perm, ndim
            )));
        }
        Ok(Tensor::apply(Arc::new(Permute { perm }), &[self.clone()]))
    }

    /// Swaps the last two axes.
    pub fn transpose_last(&self) -> Result<Tensor> {
        let ndim = self.shape().len();
        if ndim < 2 {
            return Err(Error::Shape("transpose needs at least 2 axes".to_string()));
        }
        let mut perm: Vec<usize> = (0..ndim).collect();
        perm.swap(ndim - 2, ndim - 1);
        self.permute(perm)
    }

    /// Concatenates a list of tensors along a given axis.
    pub fn concat(tensors: &[Tensor], axis: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::Shape("concat of zero tensors".to_string()))?
            .shape();
        for t in &tensors[1..] {
            let s = t.shape();
            let compatible = s.len() == first.len()
                && s.iter()
                    .zip(first.iter())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible || axis >= s.len() {
                return Err(Error::Shape(format!(
                    "cannot concat {:?} with {:?} along axis {}",
                    first, s, axis
                )));
            }
        }
        Ok(Tensor::apply(Arc::new(Concat(axis)), tensors))
    }

    /// Slice `start..start + len` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let shape = self.shape();
        if axis >= shape.len() || start + len > shape[axis] {
            return Err(Error::Shape(format!(
                "cannot narrow {:?} on axis {} to {}..{}",
                shape,
                axis,
                start,
                start + len
            )));
        }
        if start == 0 && len == shape[axis] {
            return Ok(self.clone());
        }
        Ok(Tensor::apply(
            Arc::new(Narrow { axis, start, len }),
            &[self.clone()],
        ))
    }

    /// Locks the tensor's data for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, TensorData> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A copy of the values.
    pub fn array(&self) -> ArrayD<f32> {
        self.lock().data.clone()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.lock().data.shape().to_vec()
    }

    pub fn dtype(&self) -> DType {
        self.lock().dtype
    }

    pub fn device(&self) -> Device {
        self.lock().device
    }

    /// Retags precision and placement without touching values or the graph.
    pub fn with_placement(self, dtype: DType, device: Device) -> Tensor {
        {
            let mut lock = self.lock();
            lock.dtype = dtype;
            lock.device = device;
        }
        self
    }

    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.lock().grad.clone()
    }

    pub fn has_inf(&self) -> bool {
        self.lock().data.iter().any(|v| v.is_infinite())
    }

    pub fn zero_grad(&self) {
        self.lock().grad = None;
    }

    /// Detaches the tensor from the computation graph.
    pub fn detach(&self) -> Tensor {
        let lock = self.lock();
        Tensor::new(lock.data.clone(), false).with_placement(lock.dtype, lock.device)
    }

    pub fn requires_grad(&self) -> bool {
        self.lock().requires_grad
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.lock().requires_grad = requires_grad;
    }

    /// Performs backpropagation from this tensor with an implicit seed of ones.
    pub fn backward(&self) {
        let seed = ArrayD::ones(self.lock().data.dim());
        self.backward_with_grad(seed);
    }

    /// Performs backpropagation from this tensor with an explicit seed
    /// gradient. Every node that requires gradients accumulates into `grad`;
    /// each node propagates exactly once, in reverse topological order.
    pub fn backward_with_grad(&self, seed: ArrayD<f32>) {
        let topo = self.build_topo();
        let mut pending: HashMap<*const Mutex<TensorData>, ArrayD<f32>> = HashMap::new();
        pending.insert(Arc::as_ptr(&self.0), seed);

        for node in topo.iter().rev() {
            let Some(grad) = pending.remove(&Arc::as_ptr(&node.0)) else {
                continue;
            };
            let (creator, inputs) = {
                let mut lock = node.lock();
                if !lock.requires_grad {
                    continue;
                }
                match &mut lock.grad {
                    Some(g) => *g += &grad,
                    None => lock.grad = Some(grad.clone()),
                }
                (lock.creator.clone(), lock.inputs.clone())
            };
            let Some(creator) = creator else {
                continue;
            };
            let input_grads = creator.backward(&inputs, &grad);
            for (input, g) in inputs.iter().zip(input_grads) {
                if !input.requires_grad() {
                    continue;
                }
                let key = Arc::as_ptr(&input.0);
                match pending.get_mut(&key) {
                    Some(acc) => *acc += &g,
                    None => {
                        pending.insert(key, g);
                    }
                }
            }
        }
    }

    // Iterative post-order walk; inputs appear before the nodes that use them.
    fn build_topo(&self) -> Vec<Tensor> {
        let mut visited: HashSet<*const Mutex<TensorData>> = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<(Tensor, bool)> = vec![(self.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(Arc::as_ptr(&node.0)) {
                continue;
            }
            let inputs = node.lock().inputs.clone();
            stack.push((node, true));
            for input in inputs {
                if !visited.contains(&Arc::as_ptr(&input.0)) {
                    stack.push((input, false));
                }
            }
        }
        order
    }
}

use std::ops::Deref;

impl Deref for Tensor {
    type Target = Arc<Mutex<TensorData>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tensor {}

use std::hash::{Hash, Hasher};

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}
