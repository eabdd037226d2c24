// KernelRegistry — binds primitive names to device kernels
//
// Kernels are keyed by (op, target, dtype). A Native kernel runs on the
// tensor's own backend; a Host kernel pulls data to the host and computes in
// f64 (linear algebra lives there).
//
// SELECTION (select_kernel):
//
//   1. Native kernel for the input dtype
//   2. Native kernel after widening the dtype (F16|BF16 -> F32 -> F64,
//      U8|U32 -> I64 -> F64)
//   3. Host kernel for the input dtype
//   4. Host kernel after widening
//
// Anything else is `UnsupportedOp`. When the chosen kernel's dtype differs
// from the input's, dispatch casts the inputs on the way in and float results
// back on the way out, and logs the fallback.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use marten_core::{Backend, DType, Error, Result, Tensor};

use crate::attrs::Attrs;
use crate::kernels;

/// A kernel: inputs and attributes in, outputs out.
pub type KernelFn<B> = Arc<dyn Fn(&[Tensor<B>], &Attrs) -> Result<Vec<Tensor<B>>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelTarget {
    Native,
    Host,
}

impl fmt::Display for KernelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelTarget::Native => write!(f, "native"),
            KernelTarget::Host => write!(f, "host"),
        }
    }
}

/// The outcome of kernel selection for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSelection {
    pub op: String,
    pub target: KernelTarget,
    /// The dtype the kernel is registered for.
    pub kernel_dtype: DType,
    /// The dtype that drove the selection (see [`key_dtype`]).
    pub input_dtype: DType,
    pub needs_cast: bool,
}

/// The dtype that selects a kernel: the first float input, else the first
/// input. Index and mask operands never drive selection.
pub fn key_dtype(dtypes: &[DType]) -> Option<DType> {
    dtypes
        .iter()
        .copied()
        .find(DType::is_float)
        .or_else(|| dtypes.first().copied())
}

/// Kernels for one backend.
pub struct KernelRegistry<B: Backend> {
    kernels: HashMap<(String, KernelTarget, DType), KernelFn<B>>,
}

impl<B: Backend> Clone for KernelRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            kernels: self.kernels.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for KernelRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl<B: Backend> Default for KernelRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> KernelRegistry<B> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    /// Native kernels for every primitive plus the host linear algebra.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        kernels::register_native(&mut reg);
        kernels::register_host(&mut reg);
        reg
    }

    pub fn register(&mut self, op: &str, target: KernelTarget, dtype: DType, kernel: KernelFn<B>) {
        self.kernels.insert((op.to_string(), target, dtype), kernel);
    }

    /// Register one function for several dtypes.
    pub fn register_fn<F>(&mut self, op: &str, target: KernelTarget, dtypes: &[DType], f: F)
    where
        F: Fn(&[Tensor<B>], &Attrs) -> Result<Vec<Tensor<B>>> + Send + Sync + 'static,
    {
        let kernel: KernelFn<B> = Arc::new(f);
        for &dtype in dtypes {
            self.register(op, target, dtype, Arc::clone(&kernel));
        }
    }

    pub fn get(&self, op: &str, target: KernelTarget, dtype: DType) -> Option<&KernelFn<B>> {
        self.kernels.get(&(op.to_string(), target, dtype))
    }

    pub fn contains(&self, op: &str, target: KernelTarget, dtype: DType) -> bool {
        self.get(op, target, dtype).is_some()
    }

    /// Whether any kernel exists for `op`.
    pub fn has_op(&self, op: &str) -> bool {
        self.kernels.keys().any(|(name, _, _)| name == op)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Pick a kernel for `op` applied to inputs of `dtypes`.
    pub fn select_kernel(&self, op: &str, dtypes: &[DType]) -> Result<KernelSelection> {
        let input_dtype = key_dtype(dtypes)
            .ok_or_else(|| Error::msg(format!("cannot select a kernel for {op} without inputs")))?;
        for target in [KernelTarget::Native, KernelTarget::Host] {
            let mut candidate = Some(input_dtype);
            while let Some(dtype) = candidate {
                if self.contains(op, target, dtype) {
                    let selection = KernelSelection {
                        op: op.to_string(),
                        target,
                        kernel_dtype: dtype,
                        input_dtype,
                        needs_cast: dtype != input_dtype,
                    };
                    tracing::debug!(op, %target, %dtype, "kernel selected");
                    return Ok(selection);
                }
                candidate = dtype.promote();
            }
        }
        Err(Error::UnsupportedOp {
            op: op.to_string(),
            dtype: input_dtype,
            target: "native or host".to_string(),
        })
    }

    /// Select, cast if needed, and run.
    pub fn dispatch(&self, op: &str, inputs: &[Tensor<B>], attrs: &Attrs) -> Result<Vec<Tensor<B>>> {
        let dtypes: Vec<DType> = inputs.iter().map(|t| t.dtype()).collect();
        let sel = self.select_kernel(op, &dtypes)?;
        let kernel = self
            .get(op, sel.target, sel.kernel_dtype)
            .ok_or_else(|| Error::msg(format!("kernel for {op} vanished during dispatch")))?;
        if !sel.needs_cast {
            return kernel(inputs, attrs);
        }
        tracing::warn!(
            op,
            from = %sel.input_dtype,
            to = %sel.kernel_dtype,
            target = %sel.target,
            "kernel fallback with cast"
        );
        let cast_inputs = inputs
            .iter()
            .map(|t| {
                if t.dtype() == sel.input_dtype {
                    t.to_dtype(sel.kernel_dtype)
                } else {
                    Ok(t.clone())
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = kernel(&cast_inputs, attrs)?;
        if !sel.input_dtype.is_float() {
            return Ok(outputs);
        }
        outputs
            .into_iter()
            .map(|t| {
                if t.dtype() == sel.kernel_dtype {
                    t.to_dtype(sel.input_dtype)
                } else {
                    Ok(t)
                }
            })
            .collect()
    }

    /// [`dispatch`](Self::dispatch) for single-output primitives.
    pub fn dispatch_one(&self, op: &str, inputs: &[Tensor<B>], attrs: &Attrs) -> Result<Tensor<B>> {
        let mut outputs = self.dispatch(op, inputs, attrs)?;
        if outputs.len() != 1 {
            return Err(Error::msg(format!(
                "{op} produced {} outputs, expected 1",
                outputs.len()
            )));
        }
        Ok(outputs.remove(0))
    }
}
