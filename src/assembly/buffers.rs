//! Per-thread scratch storage for one element's local quantities.

use std::error::Error;
use std::fmt;

use nalgebra::{DMatrix, DVector};

use crate::AssemblyScalar;

/// Default per-element scratch budget, in scalars.
pub const DEFAULT_SCRATCH_BUDGET: usize = 1 << 20;

/// Raised when an element's local matrices would exceed the scratch budget.
///
/// During matrix-free application this is recovered by retrying with an enlarged
/// budget; everywhere else it is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchExhausted {
    pub required: usize,
    pub budget: usize,
}

impl fmt::Display for ScratchExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "element scratch exhausted: {} scalars required, budget is {}",
            self.required, self.budget
        )
    }
}

impl Error for ScratchExhausted {}

/// Reusable buffers for processing a single element.
///
/// One instance is owned by each worker thread for the duration of an assembly phase
/// and bulk-reset at the start of every element. The dense matrix buffers are subject
/// to the scratch budget; the index buffers are not (they are bounded by the element
/// dof count).
#[derive(Debug)]
pub struct ElementScratch<T: AssemblyScalar> {
    pub(crate) budget: usize,
    pub(crate) dofs: Vec<usize>,
    pub(crate) internal_dofs: Vec<usize>,
    pub(crate) internal_local: Vec<usize>,
    pub(crate) internal_mask: Vec<bool>,
    pub(crate) index_buf: Vec<usize>,
    pub(crate) facet_buf: Vec<usize>,
    pub(crate) sum_matrix: DMatrix<T>,
    pub(crate) work_matrix: DMatrix<T>,
    pub(crate) vec_a: DVector<T>,
    pub(crate) vec_b: DVector<T>,
    pub(crate) vec_c: DVector<T>,
}

impl<T: AssemblyScalar> Default for ElementScratch<T> {
    fn default() -> Self {
        Self {
            budget: DEFAULT_SCRATCH_BUDGET,
            dofs: Vec::new(),
            internal_dofs: Vec::new(),
            internal_local: Vec::new(),
            internal_mask: Vec::new(),
            index_buf: Vec::new(),
            facet_buf: Vec::new(),
            sum_matrix: DMatrix::zeros(0, 0),
            work_matrix: DMatrix::zeros(0, 0),
            vec_a: DVector::zeros(0),
            vec_b: DVector::zeros(0),
            vec_c: DVector::zeros(0),
        }
    }
}

impl<T: AssemblyScalar> ElementScratch<T> {
    pub(crate) fn with_budget(budget: usize) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    /// Zeroes and resizes the two square matrix buffers for an element of the given
    /// matrix dimension.
    pub(crate) fn prepare_square(&mut self, dim: usize) -> Result<(), ScratchExhausted> {
        let required = dim * dim;
        if required > self.budget {
            return Err(ScratchExhausted {
                required,
                budget: self.budget,
            });
        }
        self.sum_matrix.resize_mut(dim, dim, T::zero());
        self.sum_matrix.fill(T::zero());
        self.work_matrix.resize_mut(dim, dim, T::zero());
        self.work_matrix.fill(T::zero());
        Ok(())
    }

    /// Zeroes and resizes the three vector buffers.
    pub(crate) fn prepare_vectors(&mut self, dim: usize) {
        for vec in [&mut self.vec_a, &mut self.vec_b, &mut self.vec_c] {
            vec.resize_vertically_mut(dim, T::zero());
            vec.fill(T::zero());
        }
    }
}
