//! The contract against the finite element space collaborator.
//!
//! The assembly routines are deliberately ignorant of dof numbering schemes, basis
//! functions and orientation conventions. Everything they need from the space is
//! captured by [`FiniteElementSpace`]: per-element dof index lists (optionally
//! restricted to the internal/external split used by static condensation),
//! the two-sided local-to-global transform applied to summed element matrices,
//! subdomain membership predicates and an optional element coloring.

use nalgebra::{DMatrixViewMut, DVectorViewMut, Scalar};

use crate::assembly::local::AuxiliaryElement;
use crate::coloring::ElementColoring;

/// Sentinel for a dof index that does not participate in the global system.
///
/// Entries equal to this value are skipped during scatter; static condensation marks
/// eliminated dofs with it before the element matrix is scattered.
pub const UNUSED_DOF: usize = usize::MAX;

/// Selects which part of an element's dof list is queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DofSelection {
    /// The full dof list, in local basis-function order.
    All,
    /// Only dofs retained in the global system under static condensation.
    External,
    /// Only dofs eliminated by static condensation.
    Internal,
}

/// Distinguishes the transform convention for gathered/scattered local vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorTransform {
    /// The vector holds solution values (gather direction).
    Solution,
    /// The vector holds right-hand-side/residual values (scatter direction).
    RightHandSide,
}

pub trait FiniteElementSpace<T: Scalar>: Send + Sync {
    /// Total number of dofs in the space (before multiplication by the field dimension).
    fn num_dofs(&self) -> usize;

    /// Number of scalar components carried per dof. Element matrices are sized
    /// `dof count * field_dim` and the global matrix has `num_dofs() * field_dim` rows.
    fn field_dim(&self) -> usize {
        1
    }

    /// Number of local basis functions of the given element.
    ///
    /// Must agree with the length of the list produced by
    /// [`populate_element_dofs`](Self::populate_element_dofs) with [`DofSelection::All`];
    /// a mismatch is reported by the driver as a fatal consistency error.
    fn element_dof_count(&self, element: usize) -> usize;

    fn populate_element_dofs(&self, output: &mut Vec<usize>, element: usize, selection: DofSelection);

    fn boundary_element_dof_count(&self, boundary_element: usize) -> usize;

    fn populate_boundary_element_dofs(&self, output: &mut Vec<usize>, boundary_element: usize);

    /// Whether the space has dofs on the given (volume) subdomain index.
    fn defined_on(&self, subdomain: usize) -> bool {
        let _ = subdomain;
        true
    }

    /// Whether the space has dofs on the given boundary subdomain index.
    fn defined_on_boundary(&self, subdomain: usize) -> bool {
        let _ = subdomain;
        true
    }

    /// Whether the space supports terms that couple dofs across a facet.
    ///
    /// Facet ("skeleton") integrators require this; the driver rejects them otherwise
    /// before any element is processed. Facet-coupled spaces are expected to use the
    /// identity orientation convention, so no transform is applied to facet matrices.
    fn supports_facet_coupling(&self) -> bool {
        false
    }

    /// An ordered partition of the interior elements into groups with pairwise disjoint
    /// dof lists, used for lock-free parallel scatter. `None` selects the serialized
    /// scatter regime.
    fn element_coloring(&self) -> Option<&ElementColoring> {
        None
    }

    /// Auxiliary ("special") elements owned by the space, assembled after all mesh phases.
    fn auxiliary_elements(&self) -> &[Box<dyn AuxiliaryElement<T>>] {
        &[]
    }

    /// Applies the local-to-global basis transform to a summed element matrix, on both
    /// sides. The default is the identity convention.
    fn transform_element_matrix(&self, element: usize, matrix: DMatrixViewMut<T>) {
        let _ = (element, matrix);
    }

    fn transform_boundary_element_matrix(&self, boundary_element: usize, matrix: DMatrixViewMut<T>) {
        let _ = (boundary_element, matrix);
    }

    fn transform_element_vector(
        &self,
        element: usize,
        kind: VectorTransform,
        vector: DVectorViewMut<T>,
    ) {
        let _ = (element, kind, vector);
    }

    fn transform_boundary_element_vector(
        &self,
        boundary_element: usize,
        kind: VectorTransform,
        vector: DVectorViewMut<T>,
    ) {
        let _ = (boundary_element, kind, vector);
    }
}
