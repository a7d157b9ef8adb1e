//! Static condensation: per-element elimination of internal dofs via the Schur
//! complement, and the element-indexed operator collections that make the eliminated
//! values recoverable after the reduced system has been solved.

use eyre::eyre;
use itertools::izip;
use nalgebra::{DMatrix, DVector, DVectorView};
use parking_lot::Mutex;

use crate::{AssemblyScalar, UNUSED_DOF};

/// The per-element operators produced by keep-mode condensation.
#[derive(Debug, Clone)]
pub struct CondensedBlocks<T: AssemblyScalar> {
    /// Harmonic extension `He = -D^{-1} C`, mapping external values to the condensed
    /// contribution of the internal dofs.
    pub extension: DMatrix<T>,
    /// `Het = -B D^{-1}`; only stored for nonsymmetric problems, the symmetric case
    /// uses the transpose of `extension`.
    pub extension_transpose: Option<DMatrix<T>>,
    /// `D^{-1}`, mapping an internal right-hand side to the internal solution.
    pub inner_solve: DMatrix<T>,
    /// The unfactored internal block, retained for inspection on request.
    pub inner_matrix: Option<DMatrix<T>>,
}

#[derive(Debug)]
pub struct CondensationOutcome<T: AssemblyScalar> {
    pub kept: Option<CondensedBlocks<T>>,
    /// `B D^{-1} f_int` in external (ascending local index) order; the caller subtracts
    /// it from the external right-hand-side entries.
    pub rhs_correction: Option<DVector<T>>,
}

/// Eliminates the given local scalar indices from `elmat` by the Schur complement
/// `A' = A - B D^{-1} C`.
///
/// On return the external rows and columns of `elmat` hold `A'` in their original
/// positions; the internal rows and columns are stale and must not be scattered (the
/// caller marks the corresponding dof-list entries [`UNUSED_DOF`]). With zero internal
/// indices this is a no-op. A singular internal block is a fatal numerical error and is
/// not regularized.
///
/// `internal_rhs` holds the right-hand-side values of the internal indices (in the
/// order of `internal`) and requests the discard-mode correction of the external part.
pub fn eliminate_internal_dofs<T: AssemblyScalar>(
    elmat: &mut DMatrix<T>,
    internal: &[usize],
    keep: bool,
    store_inner: bool,
    symmetric: bool,
    internal_rhs: Option<DVectorView<'_, T>>,
) -> eyre::Result<CondensationOutcome<T>> {
    if internal.is_empty() {
        return Ok(CondensationOutcome {
            kept: None,
            rhs_correction: None,
        });
    }

    let size = elmat.nrows();
    let ni = internal.len();
    let mut is_internal = vec![false; size];
    for &index in internal {
        is_internal[index] = true;
    }
    let external: Vec<usize> = (0..size).filter(|&index| !is_internal[index]).collect();
    let no = external.len();

    let mut b = DMatrix::zeros(no, ni);
    let mut c = DMatrix::zeros(ni, no);
    let mut d = DMatrix::zeros(ni, ni);
    for (k, &ok) in external.iter().enumerate() {
        for (l, &il) in internal.iter().enumerate() {
            b[(k, l)] = elmat[(ok, il)].clone();
            c[(l, k)] = elmat[(il, ok)].clone();
        }
    }
    for (k, &ik) in internal.iter().enumerate() {
        for (l, &il) in internal.iter().enumerate() {
            d[(k, l)] = elmat[(ik, il)].clone();
        }
    }

    let inner_matrix = (keep && store_inner).then(|| d.clone());
    let inner_solve = d
        .lu()
        .try_inverse()
        .ok_or_else(|| eyre!("singular internal dof block of dimension {ni}"))?;

    // He = -D^{-1} C, then A' = A + B He written back in place
    let extension = -(&inner_solve * &c);
    for (k, &ok) in external.iter().enumerate() {
        for (l, &ol) in external.iter().enumerate() {
            let mut sum = elmat[(ok, ol)].clone();
            for m in 0..ni {
                sum += b[(k, m)].clone() * extension[(m, l)].clone();
            }
            elmat[(ok, ol)] = sum;
        }
    }

    let rhs_correction = internal_rhs.map(|f_int| {
        debug_assert_eq!(f_int.len(), ni);
        &b * (&inner_solve * f_int)
    });

    let kept = keep.then(|| CondensedBlocks {
        extension_transpose: (!symmetric).then(|| -(&b * &inner_solve)),
        extension,
        inner_solve,
        inner_matrix,
    });

    Ok(CondensationOutcome {
        kept,
        rhs_correction,
    })
}

/// Solves the internal block of `elmat` for the given residual, for the
/// compute-internal path that revisits the integrators instead of using stored
/// operators.
pub(crate) fn solve_internal_block<T: AssemblyScalar>(
    elmat: &DMatrix<T>,
    internal: &[usize],
    residual: DVectorView<'_, T>,
) -> eyre::Result<DVector<T>> {
    let ni = internal.len();
    debug_assert_eq!(residual.len(), ni);
    let mut d = DMatrix::zeros(ni, ni);
    for (k, &ik) in internal.iter().enumerate() {
        for (l, &il) in internal.iter().enumerate() {
            d[(k, l)] = elmat[(ik, il)].clone();
        }
    }
    d.lu()
        .solve(&residual)
        .ok_or_else(|| eyre!("singular internal dof block of dimension {ni}"))
}

struct ElementBlock<T: AssemblyScalar> {
    row_dofs: Vec<usize>,
    col_dofs: Vec<usize>,
    matrix: DMatrix<T>,
}

/// An element-indexed collection of small dense operators acting on global vectors,
/// the storage scheme of the harmonic extension and inner-solve operators.
pub struct ElementByElementMatrix<T: AssemblyScalar> {
    dim: usize,
    blocks: Mutex<Vec<Option<ElementBlock<T>>>>,
}

impl<T: AssemblyScalar> ElementByElementMatrix<T> {
    pub fn new(dim: usize, num_elements: usize) -> Self {
        let mut blocks = Vec::new();
        blocks.resize_with(num_elements, || None);
        Self {
            dim,
            blocks: Mutex::new(blocks),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Stores the block of one element, replacing any previous one. Row/column dofs are
    /// global scalar indices; sentinel entries are skipped on application.
    pub fn set_element_matrix(
        &self,
        element: usize,
        row_dofs: Vec<usize>,
        col_dofs: Vec<usize>,
        matrix: DMatrix<T>,
    ) {
        assert_eq!(matrix.nrows(), row_dofs.len());
        assert_eq!(matrix.ncols(), col_dofs.len());
        self.blocks.lock()[element] = Some(ElementBlock {
            row_dofs,
            col_dofs,
            matrix,
        });
    }

    /// Returns a copy of one element's block, if stored.
    pub fn element_block(&self, element: usize) -> Option<(Vec<usize>, Vec<usize>, DMatrix<T>)> {
        self.blocks.lock()[element]
            .as_ref()
            .map(|block| (block.row_dofs.clone(), block.col_dofs.clone(), block.matrix.clone()))
    }

    /// `y += A x`
    pub fn mul_add(&self, x: DVectorView<'_, T>, y: &mut DVector<T>) {
        let blocks = self.blocks.lock();
        for block in blocks.iter().flatten() {
            for (&row, matrix_row) in izip!(&block.row_dofs, block.matrix.row_iter()) {
                if row == UNUSED_DOF {
                    continue;
                }
                let mut sum = T::zero();
                for (&col, value) in izip!(&block.col_dofs, matrix_row.iter()) {
                    if col == UNUSED_DOF {
                        continue;
                    }
                    sum += value.clone() * x[col].clone();
                }
                y[row] += sum;
            }
        }
    }

    /// `y += A^T x`
    pub fn transpose_mul_add(&self, x: DVectorView<'_, T>, y: &mut DVector<T>) {
        let blocks = self.blocks.lock();
        for block in blocks.iter().flatten() {
            for (&col, matrix_col) in izip!(&block.col_dofs, block.matrix.column_iter()) {
                if col == UNUSED_DOF {
                    continue;
                }
                let mut sum = T::zero();
                for (&row, value) in izip!(&block.row_dofs, matrix_col.iter()) {
                    if row == UNUSED_DOF {
                        continue;
                    }
                    sum += value.clone() * x[row].clone();
                }
                y[col] += sum;
            }
        }
    }
}

/// The operator collections retained by keep-mode condensation: harmonic extension,
/// its transpose (for nonsymmetric problems), the inner solve and optionally the
/// unfactored internal blocks. Owned by the assembling form and invalidated whenever
/// the matrix is reallocated.
pub struct CondensedOperators<T: AssemblyScalar> {
    extension: ElementByElementMatrix<T>,
    extension_transpose: Option<ElementByElementMatrix<T>>,
    inner_solve: ElementByElementMatrix<T>,
    inner_matrix: Option<ElementByElementMatrix<T>>,
}

impl<T: AssemblyScalar> CondensedOperators<T> {
    pub(crate) fn new(dim: usize, num_elements: usize, symmetric: bool, store_inner: bool) -> Self {
        Self {
            extension: ElementByElementMatrix::new(dim, num_elements),
            extension_transpose: (!symmetric)
                .then(|| ElementByElementMatrix::new(dim, num_elements)),
            inner_solve: ElementByElementMatrix::new(dim, num_elements),
            inner_matrix: store_inner.then(|| ElementByElementMatrix::new(dim, num_elements)),
        }
    }

    pub(crate) fn insert(
        &self,
        element: usize,
        internal_dofs: &[usize],
        external_dofs: &[usize],
        blocks: CondensedBlocks<T>,
    ) -> eyre::Result<()> {
        if let Some(het) = blocks.extension_transpose {
            let collection = self
                .extension_transpose
                .as_ref()
                .ok_or_else(|| eyre!("transpose extension block for a symmetric form"))?;
            collection.set_element_matrix(element, external_dofs.to_vec(), internal_dofs.to_vec(), het);
        }
        if let Some(inner) = blocks.inner_matrix {
            let collection = self
                .inner_matrix
                .as_ref()
                .ok_or_else(|| eyre!("inner matrix block without store-inner mode"))?;
            collection.set_element_matrix(element, internal_dofs.to_vec(), internal_dofs.to_vec(), inner);
        }
        self.extension.set_element_matrix(
            element,
            internal_dofs.to_vec(),
            external_dofs.to_vec(),
            blocks.extension,
        );
        self.inner_solve.set_element_matrix(
            element,
            internal_dofs.to_vec(),
            internal_dofs.to_vec(),
            blocks.inner_solve,
        );
        Ok(())
    }

    pub fn harmonic_extension(&self) -> &ElementByElementMatrix<T> {
        &self.extension
    }

    pub fn harmonic_extension_transpose(&self) -> Option<&ElementByElementMatrix<T>> {
        self.extension_transpose.as_ref()
    }

    pub fn inner_solve(&self) -> &ElementByElementMatrix<T> {
        &self.inner_solve
    }

    pub fn inner_matrix(&self) -> Option<&ElementByElementMatrix<T>> {
        self.inner_matrix.as_ref()
    }

    /// Folds the internal right-hand-side contributions into the external part:
    /// `f += Het f`.
    pub fn correct_rhs(&self, f: &mut DVector<T>) {
        let x = f.clone();
        match &self.extension_transpose {
            Some(het) => het.mul_add(DVectorView::from(&x), f),
            None => self.extension.transpose_mul_add(DVectorView::from(&x), f),
        }
    }

    /// Adds the inner solve of the right-hand side: `u += D^{-1} f`.
    pub fn solve_inner_into(&self, f: DVectorView<'_, T>, u: &mut DVector<T>) {
        self.inner_solve.mul_add(f, u);
    }

    /// Extends the external solution into the internal dofs: `u += He u`.
    pub fn extend(&self, u: &mut DVector<T>) {
        let x = u.clone();
        self.extension.mul_add(DVectorView::from(&x), u);
    }
}

/// Maps global internal dof ids to their positions in the element dof list and expands
/// them by the field dimension into local scalar indices. The dof list entries at those
/// positions are what scatter must skip after condensation.
pub(crate) fn internal_local_indices(
    dofs: &[usize],
    internal_dofs: &[usize],
    field_dim: usize,
    output: &mut Vec<usize>,
) -> eyre::Result<()> {
    output.clear();
    for &internal in internal_dofs {
        let position = dofs
            .iter()
            .position(|&dof| dof == internal)
            .ok_or_else(|| eyre!("internal dof {internal} is missing from the element dof list"))?;
        for a in 0..field_dim {
            output.push(field_dim * position + a);
        }
    }
    Ok(())
}
