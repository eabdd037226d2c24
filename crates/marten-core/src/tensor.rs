use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{Backend, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor — the eager n-dimensional array
//
// A Tensor is a cheap handle (one Arc) onto:
//   - a storage buffer shared by every view of it (Arc<RwLock<Storage>>)
//   - the layout describing which part of the buffer this view sees
//   - the op that produced it, which is the eager autograd tape
//
// Views (transpose, permute, narrow, broadcast_as, reshape of a contiguous
// tensor) share the storage. Every other op produces a fresh contiguous
// storage through the Backend. Optimizers write new parameter values with
// `update_data_inplace`, which swaps the contents of the shared storage so
// every holder of the parameter sees the update.

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    op: Op<B>,
    is_variable: bool,
}

/// An n-dimensional array on backend `B`.
///
/// ```ignore
/// use marten_core::{DType, Tensor};
/// use marten_cpu::{CpuBackend, CpuDevice};
///
/// let a = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &CpuDevice)?;
/// let b = a.matmul(&a.t()?)?.sum_all()?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={}, shape={}, dtype={}, device={:?})",
            self.inner.id.as_u64(),
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// Fresh contiguous result of this tensor's dtype and device.
    fn derived(&self, storage: B::Storage, shape: Shape, op: Op<B>) -> Self {
        Self::from_storage(
            storage,
            Layout::contiguous(shape),
            self.inner.dtype,
            self.inner.device.clone(),
            op,
        )
    }

    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    /// Tape entry for a result, or none when nothing upstream needs gradients.
    fn track(&self, op: Op<B>) -> Op<B> {
        if self.inner.dtype.is_float() {
            op
        } else {
            Op::None
        }
    }

    // Accessors

    /// Identity on the autograd tape; views get a fresh id.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// The logical shape of this view.
    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// Shortcut for `shape().dims()`.
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    /// Number of dims; 0 for a scalar.
    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    /// Total number of elements (1 for a scalar).
    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// The device that owns the storage.
    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// Shape, strides and offset into the shared storage.
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Whether the elements are laid out row-major without gaps.
    ///
    /// Broadcast and transposed views are not; `contiguous()` fixes that.
    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether this tensor is a trainable parameter.
    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that produced this tensor; `Op::None` for leaves.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    /// Read access to the storage this tensor views.
    pub fn storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.read_storage()
    }

    /// Whether two tensors view the same storage buffer.
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    // In-place mutation

    /// Replace the contents of the shared storage.
    ///
    /// Every tensor sharing the storage (clones, views, the same parameter
    /// held by an optimizer) observes the new values. The element count must
    /// match; dtype and shape are preserved.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        if new_data.len() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: self.elem_count(),
                got: new_data.len(),
            });
        }
        if !self.is_contiguous() {
            crate::bail!("update_data_inplace requires a contiguous tensor");
        }
        let storage = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        *self.write_storage()? = storage;
        Ok(())
    }

    // Creation

    /// A tensor of zeros.
    ///
    /// ```ignore
    /// let z = Tensor::<CpuBackend>::zeros((2, 3), DType::F32, &CpuDevice)?;
    /// assert_eq!(z.dims(), &[2, 3]);
    /// ```
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, Layout::contiguous(shape), dtype, device.clone(), Op::None))
    }

    /// A tensor of ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, Layout::contiguous(shape), dtype, device.clone(), Op::None))
    }

    /// A tensor with every element set to `val`, converted to `dtype`.
    pub fn full(shape: impl Into<Shape>, val: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(storage, Layout::contiguous(shape), dtype, device.clone(), Op::None))
    }

    /// Rank-0 tensor holding `val`.
    pub fn scalar(val: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(Shape::scalar(), val, dtype, device)
    }

    /// Build from row-major f64 values, converted to `dtype`.
    ///
    /// `data.len()` must equal the element count of `shape`; integer dtypes
    /// truncate the values.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(storage, Layout::contiguous(shape), dtype, device.clone(), Op::None))
    }

    /// Build from typed values; the dtype follows `T`.
    pub fn from_slice<T: WithDType>(
        data: &[T],
        shape: impl Into<Shape>,
        device: &B::Device,
    ) -> Result<Self> {
        let host: Vec<f64> = data.iter().map(|v| WithDType::to_f64(*v)).collect();
        Self::from_f64_slice(&host, shape, T::DTYPE, device)
    }

    /// Uniform samples in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, Layout::contiguous(shape), dtype, device.clone(), Op::None))
    }

    /// Standard normal samples.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, Layout::contiguous(shape), dtype, device.clone(), Op::None))
    }

    /// The `n x n` identity matrix.
    ///
    /// ```ignore
    /// let i = Tensor::<CpuBackend>::eye(3, DType::F64, &CpuDevice)?;
    /// // [[1, 0, 0],
    /// //  [0, 1, 0],
    /// //  [0, 0, 1]]
    /// ```
    pub fn eye(n: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let mut data = vec![0.0f64; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self::from_f64_slice(&data, (n, n), dtype, device)
    }

    /// `[0, 1, ..., n - 1]`.
    pub fn arange(n: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let data: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Self::from_f64_slice(&data, n, dtype, device)
    }

    /// Zeros with the shape, dtype and device of `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    /// Ones with the shape, dtype and device of `other`.
    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone(), other.dtype(), other.device())
    }

    /// `val` everywhere, shaped like `other`.
    pub fn full_like(other: &Self, val: f64) -> Result<Self> {
        Self::full(other.shape().clone(), val, other.dtype(), other.device())
    }

    /// Mark as a trainable parameter. Keeps id and storage.
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: true,
            }),
        }
    }

    /// Same data, new id, no tape.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }

    /// Deep copy into fresh contiguous storage, detached from the tape.
    pub fn copy(&self) -> Result<Self> {
        let data = self.to_f64_vec()?;
        Self::from_f64_slice(&data, self.shape().clone(), self.dtype(), self.device())
    }

    // Views

    /// Swap two dims. A view: no data is copied.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let mut perm: Vec<usize> = (0..self.rank()).collect();
        if dim0 >= self.rank() || dim1 >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1) as isize,
                rank: self.rank(),
            });
        }
        perm.swap(dim0, dim1);
        self.permute(&perm)
    }

    /// Swap the last two dims.
    pub fn t(&self) -> Result<Self> {
        if self.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(self.rank() - 2, self.rank() - 1)
    }

    /// Reorder the dims; output dim `i` is input dim `perm[i]`.
    ///
    /// `permute(&[2, 0, 1])` on `[A, B, C]` gives `[C, A, B]`. Only strides change.
    pub fn permute(&self, perm: &[usize]) -> Result<Self> {
        let layout = self.inner.layout.permute(perm)?;
        let op = self.track(Op::Permute {
            input: self.clone(),
            perm: perm.to_vec(),
        });
        Ok(self.view_with_layout(layout, op))
    }

    /// The `len` entries of `dim` starting at `start`, as a view.
    ///
    /// Errors when `start + len` runs past the end of the dim.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let layout = self.inner.layout.narrow(dim, start, len)?;
        let op = self.track(Op::Narrow {
            input: self.clone(),
            dim,
            start,
            len,
        });
        Ok(self.view_with_layout(layout, op))
    }

    /// Stride-0 view at a broadcast-compatible larger shape.
    pub fn broadcast_as(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if &shape == self.shape() {
            return Ok(self.clone());
        }
        let layout = self.inner.layout.broadcast_as(&shape)?;
        let op = self.track(Op::Broadcast {
            input: self.clone(),
        });
        Ok(self.view_with_layout(layout, op))
    }

    /// Reinterpret the elements with a new shape of the same element count.
    ///
    /// Strided tensors are made contiguous first; contiguous ones share storage.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        let base = self.contiguous()?;
        let op = self.track(Op::Reshape {
            input: base.clone(),
            src_shape: base.shape().clone(),
        });
        Ok(base.view_with_layout(Layout::contiguous(shape), op))
    }

    /// Reshape to one dim.
    pub fn flatten_all(&self) -> Result<Self> {
        self.reshape(self.elem_count())
    }

    /// Copy into a contiguous buffer when the layout is strided.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = B::to_contiguous(&*self.read_storage()?, &self.inner.layout)?;
        let op = self.track(Op::Contiguous {
            input: self.clone(),
        });
        Ok(self.derived(storage, self.shape().clone(), op))
    }

    /// Insert a size-1 dim at `dim` (which may equal the rank).
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        if dim > self.rank() {
            return Err(Error::DimOutOfRange {
                dim: dim as isize,
                rank: self.rank(),
            });
        }
        let mut dims = self.dims().to_vec();
        dims.insert(dim, 1);
        self.reshape(dims)
    }

    /// Remove a size-1 dim.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let size = self.shape().dim(dim)?;
        if size != 1 {
            crate::bail!("squeeze: dim {} has size {}, expected 1", dim, size);
        }
        let mut dims = self.dims().to_vec();
        dims.remove(dim);
        self.reshape(dims)
    }

    // Element-wise binary

    /// Element-wise `self + rhs`, broadcasting.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    /// Element-wise `self - rhs`, broadcasting.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise `self * rhs`, broadcasting.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    /// Element-wise `self / rhs`, broadcasting.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    /// Element-wise max. Ties send the gradient to `self`.
    pub fn maximum(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Maximum)
    }

    pub fn minimum(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Minimum)
    }

    /// Element-wise `self ^ rhs`.
    pub fn pow(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Pow)
    }

    /// Broadcasting binary op; both operands must share a dtype.
    pub fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let storage = B::binary_op(
            op,
            &*self.read_storage()?,
            &self.inner.layout,
            &*rhs.read_storage()?,
            &rhs.inner.layout,
        )?;
        let op = self.track(Op::Binary {
            lhs: self.clone(),
            rhs: rhs.clone(),
            op,
        });
        Ok(self.derived(storage, shape, op))
    }

    // Comparisons (U8 result, not differentiable)

    /// `self == rhs` as a U8 mask.
    pub fn eq(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Eq)
    }

    pub fn ne(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Ne)
    }

    pub fn gt(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Gt)
    }

    pub fn ge(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Ge)
    }

    pub fn lt(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Lt)
    }

    pub fn le(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Le)
    }

    /// Broadcasting comparison. The result is U8 (0 or 1) and off the tape.
    pub fn cmp_op(&self, rhs: &Self, op: CmpOp) -> Result<Self> {
        let shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let storage = B::cmp_op(
            op,
            &*self.read_storage()?,
            &self.inner.layout,
            &*rhs.read_storage()?,
            &rhs.inner.layout,
        )?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            DType::U8,
            self.inner.device.clone(),
            Op::None,
        ))
    }

    // Element-wise unary

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Abs)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Tanh)
    }

    /// GELU, tanh approximation.
    pub fn gelu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Gelu)
    }

    pub fn silu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Silu)
    }

    pub fn sin(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Cos)
    }

    pub fn floor(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Floor)
    }

    pub fn ceil(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Ceil)
    }

    /// Round half to even.
    pub fn round(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Round)
    }

    pub fn sign(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sign)
    }

    pub fn recip(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Recip)
    }

    /// Apply `op` to every element; the shape is unchanged.
    pub fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = B::unary_op(op, &*self.read_storage()?, &self.inner.layout)?;
        let op = self.track(Op::Unary {
            input: self.clone(),
            op,
        });
        Ok(self.derived(storage, self.shape().clone(), op))
    }

    /// `self * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = B::affine(&*self.read_storage()?, &self.inner.layout, mul, add)?;
        let op = self.track(Op::Affine {
            input: self.clone(),
            mul,
            add,
        });
        Ok(self.derived(storage, self.shape().clone(), op))
    }

    /// Raise every element to a constant power.
    pub fn powf(&self, exponent: f64) -> Result<Self> {
        let storage = B::powf(&*self.read_storage()?, &self.inner.layout, exponent)?;
        let op = self.track(Op::Powf {
            input: self.clone(),
            exponent,
        });
        Ok(self.derived(storage, self.shape().clone(), op))
    }

    /// Limit every element to `[min, max]`.
    ///
    /// Elements at or beyond either bound get no gradient.
    pub fn clamp(&self, min: f64, max: f64) -> Result<Self> {
        if min > max {
            crate::bail!("clamp: min {} is greater than max {}", min, max);
        }
        let storage = B::clamp(&*self.read_storage()?, &self.inner.layout, min, max)?;
        let op = self.track(Op::Clamp {
            input: self.clone(),
            min,
            max,
        });
        Ok(self.derived(storage, self.shape().clone(), op))
    }

    /// `mask != 0 ? on_true : on_false` with broadcasting.
    pub fn where_cond(mask: &Self, on_true: &Self, on_false: &Self) -> Result<Self> {
        if on_true.dtype() != on_false.dtype() {
            return Err(Error::DTypeMismatch {
                expected: on_true.dtype(),
                got: on_false.dtype(),
            });
        }
        let shape = Shape::broadcast_shape(
            &Shape::broadcast_shape(mask.shape(), on_true.shape())?,
            on_false.shape(),
        )?;
        let storage = B::where_cond(
            &*mask.read_storage()?,
            &mask.inner.layout,
            &*on_true.read_storage()?,
            &on_true.inner.layout,
            &*on_false.read_storage()?,
            &on_false.inner.layout,
        )?;
        let op = on_true.track(Op::WhereCond {
            mask: mask.clone(),
            on_true: on_true.clone(),
            on_false: on_false.clone(),
        });
        Ok(on_true.derived(storage, shape, op))
    }

    // Indexing

    /// `out[.., i, ..] = self[.., index[.., i, ..], ..]` along `dim`.
    pub fn gather(&self, dim: usize, index: &Self) -> Result<Self> {
        if index.rank() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: index.rank(),
            });
        }
        self.shape().dim(dim)?;
        let storage = B::gather(
            &*self.read_storage()?,
            &self.inner.layout,
            &*index.read_storage()?,
            &index.inner.layout,
            dim,
        )?;
        let op = self.track(Op::Gather {
            input: self.clone(),
            index: index.clone(),
            dim,
        });
        Ok(self.derived(storage, index.shape().clone(), op))
    }

    /// Pick whole slices along `dim` by a 1-D index tensor.
    pub fn index_select(&self, dim: usize, indices: &Self) -> Result<Self> {
        if indices.rank() != 1 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: indices.rank(),
            });
        }
        self.shape().dim(dim)?;
        let storage = B::index_select(
            &*self.read_storage()?,
            &self.inner.layout,
            &*indices.read_storage()?,
            &indices.inner.layout,
            dim,
        )?;
        let mut dims = self.dims().to_vec();
        dims[dim] = indices.elem_count();
        let op = self.track(Op::IndexSelect {
            input: self.clone(),
            indices: indices.clone(),
            dim,
        });
        Ok(self.derived(storage, Shape::new(dims), op))
    }

    /// Constant padding; one `[before, after]` pair per dim.
    pub fn pad(&self, padding: &[[usize; 2]], value: f64) -> Result<Self> {
        if padding.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: padding.len(),
            });
        }
        if padding.iter().all(|&[b, a]| b == 0 && a == 0) {
            return Ok(self.clone());
        }
        // Build the padded buffer one dim at a time through cat, detached.
        let mut current = self.detach();
        for (d, &[before, after]) in padding.iter().enumerate() {
            let mut parts = Vec::with_capacity(3);
            let mut dims = current.dims().to_vec();
            if before > 0 {
                dims[d] = before;
                parts.push(Self::full(dims.clone(), value, self.dtype(), self.device())?);
            }
            parts.push(current.clone());
            if after > 0 {
                dims[d] = after;
                parts.push(Self::full(dims, value, self.dtype(), self.device())?);
            }
            if parts.len() > 1 {
                current = Self::cat(&parts, d)?;
            }
        }
        let storage = current.read_storage()?.clone();
        let op = self.track(Op::Pad {
            input: self.clone(),
            padding: padding.to_vec(),
        });
        Ok(self.derived(storage, current.shape().clone(), op))
    }

    /// Concatenate along `dim`; all other dims must agree.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = match tensors.first() {
            Some(t) => t,
            None => crate::bail!("cat: empty tensor list"),
        };
        first.shape().dim(dim)?;
        let mut out_dims = first.dims().to_vec();
        out_dims[dim] = 0;
        let mut sizes = Vec::with_capacity(tensors.len());
        for t in tensors {
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            if t.rank() != first.rank() {
                return Err(Error::RankMismatch {
                    expected: first.rank(),
                    got: t.rank(),
                });
            }
            for (d, (&a, &b)) in first.dims().iter().zip(t.dims()).enumerate() {
                if d != dim && a != b {
                    return Err(Error::ShapeMismatch {
                        expected: first.shape().clone(),
                        got: t.shape().clone(),
                    });
                }
            }
            sizes.push(t.dims()[dim]);
            out_dims[dim] += t.dims()[dim];
        }
        let guards = tensors
            .iter()
            .map(|t| t.read_storage())
            .collect::<Result<Vec<_>>>()?;
        let pairs: Vec<(&B::Storage, &Layout)> = guards
            .iter()
            .zip(tensors)
            .map(|(g, t)| (&**g, t.layout()))
            .collect();
        let out_shape = Shape::new(out_dims);
        let storage = B::cat(&pairs, &out_shape, dim)?;
        let op = first.track(Op::Cat {
            inputs: tensors.to_vec(),
            dim,
            sizes,
        });
        Ok(first.derived(storage, out_shape, op))
    }

    /// Stack along a new dim.
    pub fn stack(tensors: &[Self], dim: usize) -> Result<Self> {
        let expanded = tensors
            .iter()
            .map(|t| t.unsqueeze(dim))
            .collect::<Result<Vec<_>>>()?;
        Self::cat(&expanded, dim)
    }

    // Reductions

    /// Sum of every element, as a scalar.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    /// Sum over `dim`; `keep_dim` leaves it in place with size 1.
    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    /// Sum over several dims. An empty `dims` returns `self` unchanged,
    /// unlike `reduce_op`, where empty means every dim.
    pub fn sum_dims(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        if dims.is_empty() {
            return Ok(self.clone());
        }
        self.reduce_op(ReduceOp::Sum, dims, keep_dim)
    }

    /// Mean of every element, as a scalar.
    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[dim], keep_dim)
    }

    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, &[dim], keep_dim)
    }

    pub fn min(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Min, &[dim], keep_dim)
    }

    /// Index of the largest entry along `dim`, as I64. Not differentiable.
    pub fn argmax(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::ArgMax, &[dim], keep_dim)
    }

    pub fn argmin(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::ArgMin, &[dim], keep_dim)
    }

    /// Reduce over `dims` (all dims when empty).
    pub fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            self.shape().dim(d)?;
        }
        let storage = B::reduce_op(op, &*self.read_storage()?, &self.inner.layout, dims, keep_dim)?;
        let shape = self.shape().reduced(dims, keep_dim);
        if matches!(op, ReduceOp::ArgMax | ReduceOp::ArgMin) {
            return Ok(Self::from_storage(
                storage,
                Layout::contiguous(shape),
                DType::I64,
                self.inner.device.clone(),
                Op::None,
            ));
        }
        let op = self.track(Op::Reduce {
            input: self.clone(),
            op,
            dims: dims.to_vec(),
            keep_dim,
        });
        Ok(self.derived(storage, shape, op))
    }

    /// Sum broadcast dims away so the result has `shape`.
    ///
    /// Inverse of broadcasting: `[2, 3, 4].sum_to_shape([1, 4])` sums dims 0
    /// and 1 and returns `[1, 4]`.
    pub fn sum_to_shape(&self, shape: &Shape) -> Result<Self> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        let dims = shape.broadcast_reduce_dims(self.shape());
        self.sum_dims(&dims, true)?.reshape(shape.clone())
    }

    // Composite ops built from differentiable primitives

    /// Softmax with the max subtracted (and detached) for stability.
    pub fn softmax(&self, dim: usize) -> Result<Self> {
        let max = self.max(dim, true)?.detach();
        let exp = self.sub(&max)?.exp()?;
        let sum = exp.sum(dim, true)?;
        exp.div(&sum)
    }

    pub fn log_softmax(&self, dim: usize) -> Result<Self> {
        let max = self.max(dim, true)?.detach();
        let shifted = self.sub(&max)?;
        let lse = shifted.exp()?.sum(dim, true)?.log()?;
        shifted.sub(&lse)
    }

    /// `x if x > 0 else alpha * x`.
    pub fn leaky_relu(&self, alpha: f64) -> Result<Self> {
        let zero = Self::zeros_like(self)?;
        let mask = self.gt(&zero)?;
        Self::where_cond(&mask, self, &self.affine(alpha, 0.0)?)
    }

    /// `min(max(x, 0), 6)`.
    pub fn relu6(&self) -> Result<Self> {
        self.clamp(0.0, 6.0)
    }

    /// `x * relu6(x + 3) / 6`.
    pub fn hswish(&self) -> Result<Self> {
        self.mul(&self.affine(1.0, 3.0)?.relu6()?)?.affine(1.0 / 6.0, 0.0)
    }

    /// Element-wise smooth L1: `0.5 d² / beta` when `|d| < beta`, else `|d| - 0.5 beta`.
    pub fn smooth_l1_loss(&self, target: &Self, beta: f64) -> Result<Self> {
        if beta <= 0.0 {
            crate::bail!("smooth_l1_loss: beta must be positive, got {}", beta);
        }
        let diff = self.sub(target)?;
        let abs = diff.abs()?;
        let beta_t = Self::full_like(&abs, beta)?;
        let quadratic = diff.square()?.affine(0.5 / beta, 0.0)?;
        let linear = abs.affine(1.0, -0.5 * beta)?;
        Self::where_cond(&abs.lt(&beta_t)?, &quadratic, &linear)
    }

    // Linear algebra

    /// Batched matmul: `[.., m, k] @ [.., k, n] -> [.., m, n]`, batch dims broadcast.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        if self.rank() < 2 || rhs.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let l = self.dims();
        let r = rhs.dims();
        let (m, k1) = (l[l.len() - 2], l[l.len() - 1]);
        let (k2, n) = (r[r.len() - 2], r[r.len() - 1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let batch = Shape::broadcast_shape(
            &Shape::from(&l[..l.len() - 2]),
            &Shape::from(&r[..r.len() - 2]),
        )?;
        let mut out = batch.dims().to_vec();
        out.extend([m, n]);
        let storage = B::matmul(
            &*self.read_storage()?,
            &self.inner.layout,
            &*rhs.read_storage()?,
            &rhs.inner.layout,
        )?;
        let op = self.track(Op::Matmul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        });
        Ok(self.derived(storage, Shape::new(out), op))
    }

    // Conversion and extraction

    /// Host copy of the elements in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        B::to_f64_vec(&*self.read_storage()?, &self.inner.layout)
    }

    /// The single element of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    /// Cast to `dtype`. Float-to-float casts stay on the tape.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let storage = B::cast(&*self.read_storage()?, &self.inner.layout, dtype, self.device())?;
        let op = if self.dtype().is_float() && dtype.is_float() {
            Op::ToDType {
                input: self.clone(),
                src_dtype: self.dtype(),
            }
        } else {
            Op::None
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            dtype,
            self.device().clone(),
            op,
        ))
    }

    // Autograd

    /// Reverse-mode gradients of this scalar with respect to every tensor
    /// on its tape.
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }
}
