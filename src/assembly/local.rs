//! Integrator contracts and the per-element matrix combiner.

use std::any::Any;
use std::sync::Arc;

use eyre::{bail, WrapErr};
use nalgebra::{DMatrix, DMatrixViewMut, DVectorView, DVectorViewMut, Scalar};

use crate::AssemblyScalar;

/// Classifies where an integrator contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorClass {
    /// Volume terms on interior elements.
    Interior,
    /// Terms on boundary elements.
    Boundary,
    /// Skeleton terms coupling the two elements sharing an interior facet.
    InteriorFacet,
    /// Skeleton terms on the element behind a boundary facet.
    BoundaryFacet,
}

/// Identifies the facet and adjacent element(s) a facet integrator is evaluated on.
#[derive(Debug, Clone, Copy)]
pub struct FacetContext {
    pub facet: usize,
    /// The element behind the facet (the only one for boundary facets).
    pub element: usize,
    /// Position of the facet within `element`'s local facet list.
    pub local_facet: usize,
    /// The element on the other side, for interior facets.
    pub neighbor: Option<FacetNeighbor>,
}

#[derive(Debug, Clone, Copy)]
pub struct FacetNeighbor {
    pub element: usize,
    pub local_facet: usize,
}

/// One term of a bilinear form.
///
/// An integrator evaluates a dense element matrix from the element's basis and
/// coordinate transform (both of which it accesses through its own references to the
/// space and mesh; the assembly driver only hands it indices). Optional capabilities
/// are advertised through the `has_*` flags; the corresponding methods are only called
/// when the flag is `true`, except for [`linearized_matrix_into`], whose default is
/// the state-independent matrix.
///
/// Integrators must be stateless with respect to each other: contributions are summed,
/// and the sum may be evaluated in any order.
///
/// [`linearized_matrix_into`]: BilinearIntegrator::linearized_matrix_into
pub trait BilinearIntegrator<T: Scalar>: Send + Sync {
    /// Name used in error context when an evaluation fails.
    fn name(&self) -> &str;

    fn class(&self) -> IntegratorClass;

    /// Whether the integrator contributes on the given subdomain index.
    fn defined_on(&self, subdomain: usize) -> bool {
        let _ = subdomain;
        true
    }

    /// Computes the dense element matrix of a volume or boundary element.
    ///
    /// `output` is zeroed by the caller and sized `n * field_dim`, where `n` is the
    /// element's dof count.
    fn element_matrix_into(&self, element: usize, output: DMatrixViewMut<T>) -> eyre::Result<()>;

    /// Computes the element matrix of a facet term. For interior facets the matrix is
    /// blocked by the concatenation of both elements' dof lists.
    fn facet_matrix_into(&self, context: &FacetContext, output: DMatrixViewMut<T>) -> eyre::Result<()> {
        let _ = (context, output);
        bail!("integrator `{}` does not support facet assembly", self.name());
    }

    /// Whether [`element_diagonal_into`](Self::element_diagonal_into) is available.
    fn has_diagonal(&self) -> bool {
        false
    }

    /// Computes only the diagonal of the element matrix; off-diagonal entries are
    /// never materialized.
    fn element_diagonal_into(&self, element: usize, output: DVectorViewMut<T>) -> eyre::Result<()> {
        let _ = (element, output);
        bail!("integrator `{}` does not support diagonal-only assembly", self.name());
    }

    /// Computes the element matrix linearized about the given local state.
    ///
    /// State-independent integrators keep the default, which ignores the state.
    fn linearized_matrix_into(
        &self,
        element: usize,
        state: DVectorView<T>,
        output: DMatrixViewMut<T>,
    ) -> eyre::Result<()> {
        let _ = state;
        self.element_matrix_into(element, output)
    }

    /// Whether [`apply_element_matrix`](Self::apply_element_matrix) is available.
    fn has_direct_action(&self) -> bool {
        false
    }

    /// Applies the element matrix to a local vector without forming it.
    /// Overwrites `output`.
    fn apply_element_matrix(
        &self,
        element: usize,
        x: DVectorView<T>,
        output: DVectorViewMut<T>,
    ) -> eyre::Result<()> {
        let _ = (element, x, output);
        bail!("integrator `{}` does not support matrix-free application", self.name());
    }

    /// Whether [`element_energy`](Self::element_energy) is available.
    fn has_energy(&self) -> bool {
        false
    }

    /// The scalar energy contribution of one element given the local state.
    fn element_energy(&self, element: usize, state: DVectorView<T>) -> eyre::Result<T> {
        let _ = (element, state);
        bail!("integrator `{}` does not support energy evaluation", self.name());
    }

    /// Precomputes per-element data consulted by repeated matrix-free applications.
    /// `None` means nothing to cache for this element.
    fn precompute_element(&self, element: usize) -> eyre::Result<Option<Box<dyn Any + Send + Sync>>> {
        let _ = element;
        Ok(None)
    }

    /// Matrix-free application using data from [`precompute_element`](Self::precompute_element).
    fn apply_with_cache(
        &self,
        element: usize,
        cache: &(dyn Any + Send + Sync),
        x: DVectorView<T>,
        output: DVectorViewMut<T>,
    ) -> eyre::Result<()> {
        let _ = cache;
        self.apply_element_matrix(element, x, output)
    }
}

/// A "special" element owned by the space rather than the mesh, e.g. a point
/// constraint or a lumped coupling term. Assembled after all mesh phases.
pub trait AuxiliaryElement<T: Scalar>: Send + Sync {
    fn populate_dofs(&self, output: &mut Vec<usize>);

    /// Computes the dense matrix of this element. `output` is zeroed by the caller and
    /// sized `dof count * field_dim`.
    fn assemble_into(&self, output: DMatrixViewMut<T>) -> eyre::Result<()>;

    /// Applies this element's matrix to a local vector. Overwrites `output`.
    fn apply(&self, x: DVectorView<T>, output: DVectorViewMut<T>) -> eyre::Result<()> {
        let _ = (x, output);
        bail!("auxiliary element does not support matrix-free application");
    }

    fn energy(&self, x: DVectorView<T>) -> eyre::Result<T>;
}

/// Which matrices the combiner requests from the integrators.
pub(crate) enum CombineMode<'a, T: Scalar> {
    Matrix,
    Linearized(DVectorView<'a, T>),
}

// Views are Copy regardless of `T: Copy`, but a derive would demand it.
impl<'a, T: Scalar + Copy> Clone for CombineMode<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: Scalar + Copy> Copy for CombineMode<'a, T> {}

/// Sums the element matrices of all applicable integrators into `sum`.
///
/// `sum` and `work` must be zeroed and sized to the element matrix dimension by the
/// caller. Contributions are strictly additive and mathematically order-independent.
pub(crate) fn accumulate_element_matrix<T: AssemblyScalar>(
    integrators: &[Arc<dyn BilinearIntegrator<T>>],
    class: IntegratorClass,
    element: usize,
    subdomain: usize,
    mode: CombineMode<T>,
    sum: &mut DMatrix<T>,
    work: &mut DMatrix<T>,
) -> eyre::Result<()> {
    for integrator in integrators {
        if integrator.class() != class || !integrator.defined_on(subdomain) {
            continue;
        }
        work.fill(T::zero());
        match mode {
            CombineMode::Matrix => integrator
                .element_matrix_into(element, DMatrixViewMut::from(&mut *work)),
            CombineMode::Linearized(state) => integrator
                .linearized_matrix_into(element, state, DMatrixViewMut::from(&mut *work)),
        }
        .wrap_err_with(|| format!("in element matrix integration, integrator = {}", integrator.name()))?;
        *sum += &*work;
    }
    Ok(())
}

/// Facet counterpart of [`accumulate_element_matrix`]. Interior facet terms apply only
/// when the integrator is defined on the subdomains of both adjacent elements.
pub(crate) fn accumulate_facet_matrix<T: AssemblyScalar>(
    integrators: &[Arc<dyn BilinearIntegrator<T>>],
    class: IntegratorClass,
    context: &FacetContext,
    subdomains: (usize, Option<usize>),
    sum: &mut DMatrix<T>,
    work: &mut DMatrix<T>,
) -> eyre::Result<()> {
    for integrator in integrators {
        if integrator.class() != class
            || !integrator.defined_on(subdomains.0)
            || subdomains.1.map_or(false, |s| !integrator.defined_on(s))
        {
            continue;
        }
        work.fill(T::zero());
        integrator
            .facet_matrix_into(context, DMatrixViewMut::from(&mut *work))
            .wrap_err_with(|| format!("in facet matrix integration, integrator = {}", integrator.name()))?;
        *sum += &*work;
    }
    Ok(())
}
