//! Construction of the global sparsity pattern from per-entity dof lists.

use eyre::eyre;
use nalgebra_sparse::pattern::SparsityPattern;
use rayon::slice::ParallelSliceMut;

use crate::assembly::global::MatrixLayout;
use crate::UNUSED_DOF;

/// Accumulates the (row, col) pairs touched by scatter-add and builds a deduplicated
/// CSR [`SparsityPattern`] from them.
///
/// Every dof list registered through [`add_dof_list`](Self::add_dof_list) contributes
/// all of its pairwise index combinations, expanded by the field dimension. Sentinel
/// entries are skipped and, under symmetric layout, only the lower half (`row >= col`)
/// is retained. Cross-element (facet) coupling is expressed by registering the
/// concatenation of the coupled elements' lists. The diagonal is always part of the
/// pattern: the regularization passes write it for every dof, including untouched ones.
pub struct GraphBuilder {
    num_scalar_dofs: usize,
    field_dim: usize,
    layout: MatrixLayout,
    coordinates: Vec<(usize, usize)>,
}

impl GraphBuilder {
    pub fn new(num_dofs: usize, field_dim: usize, layout: MatrixLayout) -> Self {
        Self {
            num_scalar_dofs: num_dofs * field_dim,
            field_dim,
            layout,
            coordinates: Vec::new(),
        }
    }

    /// Registers the dof-index list of one entity (element, boundary element or
    /// auxiliary element). Duplicate pairs are coalesced when the pattern is built.
    pub fn add_dof_list(&mut self, dofs: &[usize]) {
        let d = self.field_dim;
        for &dof_i in dofs {
            if dof_i == UNUSED_DOF {
                continue;
            }
            for &dof_j in dofs {
                if dof_j == UNUSED_DOF {
                    continue;
                }
                for a in 0..d {
                    let row = d * dof_i + a;
                    for b in 0..d {
                        let col = d * dof_j + b;
                        if self.layout == MatrixLayout::SymmetricLower && col > row {
                            continue;
                        }
                        self.coordinates.push((row, col));
                    }
                }
            }
        }
    }

    /// Sorts and deduplicates the collected coordinates into a CSR pattern.
    pub fn build(mut self) -> eyre::Result<SparsityPattern> {
        let num_rows = self.num_scalar_dofs;
        for row in 0..num_rows {
            self.coordinates.push((row, row));
        }
        self.coordinates.par_sort_unstable();

        let mut row_offsets = Vec::with_capacity(num_rows + 1);
        let mut column_indices = Vec::new();
        row_offsets.push(0);

        let mut current_row = 0;
        let mut prev_col = None;
        for (row, col) in self.coordinates {
            debug_assert!(row < num_rows, "dof index out of bounds");
            while row > current_row {
                row_offsets.push(column_indices.len());
                current_row += 1;
                prev_col = None;
            }
            // Skip duplicates within the row
            if Some(col) != prev_col {
                column_indices.push(col);
                prev_col = Some(col);
            }
        }
        for _ in current_row..num_rows {
            row_offsets.push(column_indices.len());
        }

        SparsityPattern::try_from_offsets_and_indices(
            num_rows,
            num_rows,
            row_offsets,
            column_indices,
        )
        .map_err(|err| eyre!("constructed sparsity pattern is malformed: {err}"))
    }
}
