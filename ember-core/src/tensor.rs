use crate::{DType, EmberError, Result, Shape};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Global tensor ID counter
static TENSOR_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Unique tensor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub usize);

impl TensorId {
    pub fn new() -> Self {
        TensorId(TENSOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Row-major host tensor.
///
/// Cloning yields another handle to the same tensor: same id, shared storage.
/// Writing through a handle whose storage is shared copies the storage first,
/// so handles held for backward never observe later writes.
#[derive(Clone)]
pub struct Tensor {
    pub(crate) data: Arc<Vec<f32>>,
    pub(crate) shape: Shape,
    pub(crate) dtype: DType,
    pub(crate) id: TensorId,
    pub(crate) requires_grad: bool,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

impl Tensor {
    fn with_storage(data: Vec<f32>, shape: Shape, dtype: DType) -> Self {
        Self {
            data: Arc::new(data),
            shape,
            dtype,
            id: TensorId::new(),
            requires_grad: false,
        }
    }

    /// Create a new F32 tensor filled with zeros
    pub fn zeros(shape: Shape) -> Self {
        Self::zeros_dtype(shape, DType::F32)
    }

    pub fn zeros_dtype(shape: Shape, dtype: DType) -> Self {
        let size = shape.elem_count();
        Self::with_storage(vec![0.0; size], shape, dtype)
    }

    /// Create a new F32 tensor filled with ones
    pub fn ones(shape: Shape) -> Self {
        let size = shape.elem_count();
        Self::with_storage(vec![1.0; size], shape, DType::F32)
    }

    /// Create a new F32 tensor from a Vec
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Result<Self> {
        Self::from_vec_dtype(data, shape, DType::F32)
    }

    /// Create a tensor from a Vec, rounding values to `dtype`
    pub fn from_vec_dtype(mut data: Vec<f32>, shape: Shape, dtype: DType) -> Result<Self> {
        if data.len() != shape.elem_count() {
            return Err(EmberError::ShapeMismatch {
                expected: shape,
                got: Shape::from_dims(&[data.len()]),
            });
        }
        dtype.round_slice(&mut data);
        Ok(Self::with_storage(data, shape, dtype))
    }

    /// Create tensor from slice
    pub fn from_slice(data: &[f32], shape: Shape) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape)
    }

    /// Create random tensor drawn from N(mean, std)
    pub fn randn<R: Rng + ?Sized>(shape: Shape, mean: f32, std: f32, rng: &mut R) -> Result<Self> {
        let normal = Normal::new(mean, std)
            .map_err(|e| {
                EmberError::InvalidOperation(format!("invalid normal distribution: {}", e))
            })?;
        let data: Vec<f32> = (0..shape.elem_count()).map(|_| normal.sample(rng)).collect();
        Self::from_vec(data, shape)
    }

    /// Enable gradient computation
    pub fn requires_grad_(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Size of dimension `dim`.
    pub fn size(&self, dim: usize) -> Result<usize> {
        self.shape.dim(dim)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the storage, copying it first if it is shared.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.to_vec()
    }

    /// Empty tensor of the same kind (dtype), with a fresh id.
    pub fn new_like(&self) -> Tensor {
        Self::with_storage(Vec::new(), Shape::from_dims(&[0]), self.dtype)
    }

    /// Resize in place. Keeps the id; contents beyond the old length are zero.
    pub fn resize_(&mut self, shape: Shape) -> &mut Self {
        let len = shape.elem_count();
        if len != self.data.len() {
            Arc::make_mut(&mut self.data).resize(len, 0.0);
        }
        self.shape = shape;
        self
    }

    /// Resize in place to the shape of `other`.
    pub fn resize_as_(&mut self, other: &Tensor) -> &mut Self {
        self.resize_(other.shape.clone())
    }

    /// Fill with zeros in place.
    pub fn zero_(&mut self) -> &mut Self {
        self.data_mut().fill(0.0);
        self
    }

    /// Round storage to this tensor's dtype after a kernel wrote it.
    pub(crate) fn round_to_dtype(&mut self) {
        if self.dtype != DType::F32 {
            let dtype = self.dtype;
            dtype.round_slice(self.data_mut());
        }
    }

    /// Convert to another dtype, producing a new tensor.
    pub fn to_dtype(&self, dtype: DType) -> Result<Tensor> {
        Self::from_vec_dtype(self.to_vec(), self.shape.clone(), dtype)
    }

    /// Largest elementwise |a - b|.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        if self.shape != other.shape {
            return Err(EmberError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .fold(0f32, |m, (a, b)| m.max((a - b).abs())))
    }
}
