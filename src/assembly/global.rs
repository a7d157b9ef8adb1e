//! Scatter-add of local contributions into shared global structures.
//!
//! Two regimes are offered. In the colored regime, elements of one color group have
//! pairwise disjoint dof lists, so their rows of the CSR matrix (or entries of the
//! output vector) can be mutated concurrently without synchronization; the unchecked
//! access wrappers below encode exactly that contract. In the serialized regime, a
//! mutex scoped to the global structure guards every scatter.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use eyre::bail;
use nalgebra::{ComplexField, DMatrix, DVector, DVectorView};
use nalgebra_sparse::CsrMatrix;
use parking_lot::Mutex;

use crate::{AssemblyScalar, UNUSED_DOF};

/// Storage layout of the global matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixLayout {
    /// Every structurally nonzero entry is stored.
    General,
    /// Only the lower triangle (`row >= col`) is stored; the upper half is implied by
    /// symmetry.
    SymmetricLower,
}

/// Row-wise access to a CSR matrix that can be shared across worker threads.
///
/// The wrapper hands out unchecked mutable row views; callers must guarantee that no
/// two threads touch the same row concurrently. Element coloring provides exactly this
/// guarantee within one color group.
pub(crate) struct SharedCsrRows<'a, T> {
    row_offsets: &'a [usize],
    col_indices: &'a [usize],
    values: *mut T,
}

unsafe impl<'a, T: Send> Send for SharedCsrRows<'a, T> {}
unsafe impl<'a, T: Send + Sync> Sync for SharedCsrRows<'a, T> {}

impl<'a, T> SharedCsrRows<'a, T> {
    pub fn from_csr(matrix: &'a mut CsrMatrix<T>) -> Self {
        let (row_offsets, col_indices, values) = matrix.csr_data_mut();
        Self {
            row_offsets,
            col_indices,
            values: values.as_mut_ptr(),
        }
    }

    /// Returns the column indices and mutable values of one row.
    ///
    /// # Safety
    ///
    /// No other thread may hold a view of the same row while the returned slices are
    /// alive.
    pub unsafe fn row_unchecked(&self, row: usize) -> (&[usize], &mut [T]) {
        let begin = self.row_offsets[row];
        let end = self.row_offsets[row + 1];
        let values = std::slice::from_raw_parts_mut(self.values.add(begin), end - begin);
        (&self.col_indices[begin..end], values)
    }
}

/// Entry-wise shared access to a dense vector, with the same contract as
/// [`SharedCsrRows`]: callers guarantee disjointness of concurrently touched entries.
pub(crate) struct SharedVectorAccess<'a, T> {
    values: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<'a, T: Send> Send for SharedVectorAccess<'a, T> {}
unsafe impl<'a, T: Send + Sync> Sync for SharedVectorAccess<'a, T> {}

impl<'a, T: AssemblyScalar> SharedVectorAccess<'a, T> {
    pub fn from_vector(vector: &'a mut DVector<T>) -> Self {
        let len = vector.len();
        Self {
            values: vector.as_mut_slice().as_mut_ptr(),
            len,
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// No other thread may access the same entry concurrently.
    pub unsafe fn add_assign_unchecked(&self, index: usize, value: T) {
        debug_assert!(index < self.len);
        *self.values.add(index) += value;
    }
}

/// Adds a local element matrix into the rows of the global matrix selected by `dofs`.
///
/// `elmat` is blocked by `field_dim`: local row `field_dim * i + a` corresponds to
/// global row `field_dim * dofs[i] + a`. Sentinel dofs are skipped on both sides, and
/// under [`MatrixLayout::SymmetricLower`] only entries with `row >= col` are stored.
/// A target entry missing from the sparsity pattern is a fatal consistency error.
///
/// # Safety
///
/// The caller must have exclusive access to every global row touched by `dofs`, either
/// through coloring disjointness or an external lock.
pub(crate) unsafe fn add_element_matrix_unsynced<T: AssemblyScalar>(
    access: &SharedCsrRows<'_, T>,
    layout: MatrixLayout,
    field_dim: usize,
    dofs: &[usize],
    elmat: &DMatrix<T>,
) -> eyre::Result<()> {
    let d = field_dim;
    debug_assert_eq!(elmat.nrows(), d * dofs.len());
    debug_assert_eq!(elmat.ncols(), d * dofs.len());

    for (i, &dof_i) in dofs.iter().enumerate() {
        if dof_i == UNUSED_DOF {
            continue;
        }
        for a in 0..d {
            let global_row = d * dof_i + a;
            let local_row = d * i + a;
            let (cols, values) = access.row_unchecked(global_row);

            for (j, &dof_j) in dofs.iter().enumerate() {
                if dof_j == UNUSED_DOF {
                    continue;
                }
                for b in 0..d {
                    let global_col = d * dof_j + b;
                    if layout == MatrixLayout::SymmetricLower && global_col > global_row {
                        continue;
                    }
                    match cols.binary_search(&global_col) {
                        Ok(k) => values[k] += elmat[(local_row, d * j + b)].clone(),
                        Err(_) => bail!(
                            "entry ({global_row}, {global_col}) is not part of the sparsity pattern"
                        ),
                    }
                }
            }
        }
    }
    Ok(())
}

/// Adds per-dof diagonal values (one per scalar component) to the global diagonal.
///
/// # Safety
///
/// Same row-exclusivity contract as [`add_element_matrix_unsynced`].
pub(crate) unsafe fn add_element_diagonal_unsynced<T: AssemblyScalar>(
    access: &SharedCsrRows<'_, T>,
    field_dim: usize,
    dofs: &[usize],
    diag: &DVector<T>,
) -> eyre::Result<()> {
    let d = field_dim;
    debug_assert_eq!(diag.len(), d * dofs.len());

    for (i, &dof) in dofs.iter().enumerate() {
        if dof == UNUSED_DOF {
            continue;
        }
        for a in 0..d {
            let global_row = d * dof + a;
            let (cols, values) = access.row_unchecked(global_row);
            match cols.binary_search(&global_row) {
                Ok(k) => values[k] += diag[d * i + a].clone(),
                Err(_) => bail!("diagonal entry {global_row} is not part of the sparsity pattern"),
            }
        }
    }
    Ok(())
}

/// Adds `value` to all `field_dim` diagonal entries of one dof. Used by the
/// regularization passes, which act as 1-dof element matrices.
///
/// # Safety
///
/// Same row-exclusivity contract as [`add_element_matrix_unsynced`].
pub(crate) unsafe fn add_diagonal_block_unsynced<T: AssemblyScalar>(
    access: &SharedCsrRows<'_, T>,
    field_dim: usize,
    dof: usize,
    value: T,
) -> eyre::Result<()> {
    for a in 0..field_dim {
        let global_row = field_dim * dof + a;
        let (cols, values) = access.row_unchecked(global_row);
        match cols.binary_search(&global_row) {
            Ok(k) => values[k] += value.clone(),
            Err(_) => bail!("diagonal entry {global_row} is not part of the sparsity pattern"),
        }
    }
    Ok(())
}

/// Scatters a local vector into the shared output vector.
///
/// # Safety
///
/// The caller must have exclusive access to every entry selected by `dofs`.
pub(crate) unsafe fn add_local_vector_unsynced<T: AssemblyScalar>(
    access: &SharedVectorAccess<'_, T>,
    field_dim: usize,
    dofs: &[usize],
    local: &DVector<T>,
) {
    let d = field_dim;
    debug_assert_eq!(local.len(), d * dofs.len());
    for (i, &dof) in dofs.iter().enumerate() {
        if dof == UNUSED_DOF {
            continue;
        }
        for a in 0..d {
            access.add_assign_unchecked(d * dof + a, local[d * i + a].clone());
        }
    }
}

/// Gathers the local values selected by `dofs` from a global vector. Sentinel entries
/// gather as zero. `local` is resized to `field_dim * dofs.len()`.
pub fn gather_global_to_local<T: AssemblyScalar>(
    global: DVectorView<'_, T>,
    local: &mut DVector<T>,
    dofs: &[usize],
    field_dim: usize,
) {
    let d = field_dim;
    local.resize_vertically_mut(d * dofs.len(), T::zero());
    for (i, &dof) in dofs.iter().enumerate() {
        for a in 0..d {
            local[d * i + a] = if dof == UNUSED_DOF {
                T::zero()
            } else {
                global[d * dof + a].clone()
            };
        }
    }
}

/// Looks up an entry of the effective (fully populated) matrix, resolving symmetric
/// storage: under [`MatrixLayout::SymmetricLower`], `(i, j)` with `j > i` reads the
/// stored entry `(j, i)`. Entries outside the pattern read as zero.
pub fn matrix_entry<T: ComplexField>(
    matrix: &CsrMatrix<T>,
    layout: MatrixLayout,
    row: usize,
    col: usize,
) -> T {
    let (row, col) = match layout {
        MatrixLayout::SymmetricLower if col > row => (col, row),
        _ => (row, col),
    };
    let (offsets, cols, values) = matrix.csr_data();
    let range = offsets[row]..offsets[row + 1];
    match cols[range.clone()].binary_search(&col) {
        Ok(k) => values[range.start + k].clone(),
        Err(_) => T::zero(),
    }
}

pub(crate) fn mark_used_dofs(used: &[AtomicBool], dofs: &[usize]) {
    for &dof in dofs {
        if dof != UNUSED_DOF {
            used[dof].store(true, Ordering::Relaxed);
        }
    }
}

/// Time-throttled progress reporting over the combined step count of all phases.
pub(crate) struct ProgressReporter {
    total: usize,
    counter: AtomicUsize,
    last_report: Mutex<Instant>,
}

const REPORT_INTERVAL: Duration = Duration::from_millis(100);

impl ProgressReporter {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            counter: AtomicUsize::new(0),
            last_report: Mutex::new(Instant::now()),
        }
    }

    pub fn bump(&self, phase: &str) {
        let done = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        // Reporting is best-effort; a thread that loses the race just moves on.
        let Some(mut last) = self.last_report.try_lock() else {
            return;
        };
        if last.elapsed() >= REPORT_INTERVAL {
            *last = Instant::now();
            let percent = 100.0 * done as f64 / self.total.max(1) as f64;
            log::info!("{phase}: {done} of {} steps ({percent:.0}%)", self.total);
        }
    }
}
