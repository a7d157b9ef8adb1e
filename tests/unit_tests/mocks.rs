//! Mock collaborators shared by the assembly tests.

use std::any::Any;

use biform::assembly::local::{
    AuxiliaryElement, BilinearIntegrator, FacetContext, IntegratorClass,
};
use biform::coloring::ElementColoring;
use biform::space::{DofSelection, FiniteElementSpace};
use biform::topology::MeshTopology;
use eyre::{bail, eyre};
use nalgebra::{DMatrix, DMatrixViewMut, DVectorView, DVectorViewMut};

#[derive(Default)]
pub struct MockSpace {
    pub num_dofs: usize,
    pub field_dim: usize,
    pub element_dofs: Vec<Vec<usize>>,
    /// Global ids of the internal dofs of each element (empty = nothing to condense).
    pub internal_dofs: Vec<Vec<usize>>,
    pub boundary_dofs: Vec<Vec<usize>>,
    pub coloring: Option<ElementColoring>,
    pub facet_coupling: bool,
    pub auxiliary: Vec<Box<dyn AuxiliaryElement<f64>>>,
    /// Overrides the reported dof count of one element to provoke consistency errors.
    pub dof_count_override: Option<(usize, usize)>,
}

impl MockSpace {
    pub fn with_elements(num_dofs: usize, element_dofs: Vec<Vec<usize>>) -> Self {
        let num_elements = element_dofs.len();
        Self {
            num_dofs,
            field_dim: 1,
            element_dofs,
            internal_dofs: vec![Vec::new(); num_elements],
            ..Self::default()
        }
    }
}

impl FiniteElementSpace<f64> for MockSpace {
    fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    fn field_dim(&self) -> usize {
        self.field_dim
    }

    fn element_dof_count(&self, element: usize) -> usize {
        if let Some((overridden, count)) = self.dof_count_override {
            if overridden == element {
                return count;
            }
        }
        self.element_dofs[element].len()
    }

    fn populate_element_dofs(
        &self,
        output: &mut Vec<usize>,
        element: usize,
        selection: DofSelection,
    ) {
        output.clear();
        match selection {
            DofSelection::All => output.extend_from_slice(&self.element_dofs[element]),
            DofSelection::Internal => output.extend_from_slice(&self.internal_dofs[element]),
            DofSelection::External => output.extend(
                self.element_dofs[element]
                    .iter()
                    .filter(|dof| !self.internal_dofs[element].contains(dof))
                    .copied(),
            ),
        }
    }

    fn boundary_element_dof_count(&self, boundary_element: usize) -> usize {
        self.boundary_dofs[boundary_element].len()
    }

    fn populate_boundary_element_dofs(&self, output: &mut Vec<usize>, boundary_element: usize) {
        output.clear();
        output.extend_from_slice(&self.boundary_dofs[boundary_element]);
    }

    fn supports_facet_coupling(&self) -> bool {
        self.facet_coupling
    }

    fn element_coloring(&self) -> Option<&ElementColoring> {
        self.coloring.as_ref()
    }

    fn auxiliary_elements(&self) -> &[Box<dyn AuxiliaryElement<f64>>] {
        &self.auxiliary
    }
}

#[derive(Default)]
pub struct MockTopology {
    pub num_elements: usize,
    pub num_boundary_elements: usize,
    /// element -> facets, in local facet order
    pub element_facets: Vec<Vec<usize>>,
    /// facet -> adjacent elements
    pub facet_elements: Vec<Vec<usize>>,
    /// boundary element -> facet
    pub boundary_facets: Vec<usize>,
    pub ghost_elements: Vec<usize>,
}

impl MockTopology {
    pub fn with_elements(num_elements: usize) -> Self {
        Self {
            num_elements,
            element_facets: vec![Vec::new(); num_elements],
            ..Self::default()
        }
    }
}

impl MeshTopology for MockTopology {
    fn num_elements(&self) -> usize {
        self.num_elements
    }

    fn num_boundary_elements(&self) -> usize {
        self.num_boundary_elements
    }

    fn num_facets(&self) -> usize {
        self.facet_elements.len()
    }

    fn populate_element_facets(&self, output: &mut Vec<usize>, element: usize) {
        output.clear();
        output.extend_from_slice(&self.element_facets[element]);
    }

    fn populate_facet_elements(&self, output: &mut Vec<usize>, facet: usize) {
        output.clear();
        output.extend_from_slice(&self.facet_elements[facet]);
    }

    fn boundary_element_facet(&self, boundary_element: usize) -> usize {
        self.boundary_facets[boundary_element]
    }

    fn is_ghost_element(&self, element: usize) -> bool {
        self.ghost_elements.contains(&element)
    }
}

/// An integrator returning a fixed dense matrix per element, with optional
/// matrix-free action, diagonal extraction and the energy `x^T A x`.
pub struct DenseIntegrator {
    pub name: String,
    pub class: IntegratorClass,
    pub matrices: Vec<DMatrix<f64>>,
    pub direct_action: bool,
}

impl DenseIntegrator {
    pub fn interior(name: &str, matrices: Vec<DMatrix<f64>>) -> Self {
        Self {
            name: name.into(),
            class: IntegratorClass::Interior,
            matrices,
            direct_action: false,
        }
    }

    pub fn boundary(name: &str, matrices: Vec<DMatrix<f64>>) -> Self {
        Self {
            name: name.into(),
            class: IntegratorClass::Boundary,
            matrices,
            direct_action: false,
        }
    }
}

impl BilinearIntegrator<f64> for DenseIntegrator {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> IntegratorClass {
        self.class
    }

    fn element_matrix_into(&self, element: usize, mut output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        let matrix = &self.matrices[element];
        if output.shape() != matrix.shape() {
            bail!(
                "element {element}: output is {:?}, matrix is {:?}",
                output.shape(),
                matrix.shape()
            );
        }
        output.copy_from(matrix);
        Ok(())
    }

    fn has_diagonal(&self) -> bool {
        true
    }

    fn element_diagonal_into(&self, element: usize, mut output: DVectorViewMut<f64>) -> eyre::Result<()> {
        let matrix = &self.matrices[element];
        for i in 0..matrix.nrows() {
            output[i] = matrix[(i, i)];
        }
        Ok(())
    }

    fn has_direct_action(&self) -> bool {
        self.direct_action
    }

    fn apply_element_matrix(
        &self,
        element: usize,
        x: DVectorView<f64>,
        mut output: DVectorViewMut<f64>,
    ) -> eyre::Result<()> {
        output.gemv(1.0, &self.matrices[element], &x, 0.0);
        Ok(())
    }

    fn has_energy(&self) -> bool {
        true
    }

    fn element_energy(&self, element: usize, state: DVectorView<f64>) -> eyre::Result<f64> {
        Ok((state.transpose() * &self.matrices[element] * state)[(0, 0)])
    }
}

/// Linearizes to `diag(state)`; the state-independent matrix is zero.
pub struct DiagonalLinearization {
    pub name: String,
}

impl BilinearIntegrator<f64> for DiagonalLinearization {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> IntegratorClass {
        IntegratorClass::Interior
    }

    fn element_matrix_into(&self, _element: usize, _output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        Ok(())
    }

    fn linearized_matrix_into(
        &self,
        _element: usize,
        state: DVectorView<f64>,
        mut output: DMatrixViewMut<f64>,
    ) -> eyre::Result<()> {
        for i in 0..state.len() {
            output[(i, i)] = state[i];
        }
        Ok(())
    }
}

/// Fills the whole facet matrix with a constant.
pub struct ConstantFacetIntegrator {
    pub name: String,
    pub class: IntegratorClass,
    pub value: f64,
}

impl BilinearIntegrator<f64> for ConstantFacetIntegrator {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> IntegratorClass {
        self.class
    }

    fn element_matrix_into(&self, _element: usize, _output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        bail!("facet integrator has no volume matrix")
    }

    fn facet_matrix_into(&self, _context: &FacetContext, mut output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        output.fill(self.value);
        Ok(())
    }
}

/// Only usable through the precomputed cache: the uncached action fails, so a
/// successful application proves the cache was consulted.
pub struct CacheOnlyIntegrator {
    pub matrices: Vec<DMatrix<f64>>,
}

impl BilinearIntegrator<f64> for CacheOnlyIntegrator {
    fn name(&self) -> &str {
        "cache-only"
    }

    fn class(&self) -> IntegratorClass {
        IntegratorClass::Interior
    }

    fn element_matrix_into(&self, element: usize, mut output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        output.copy_from(&self.matrices[element]);
        Ok(())
    }

    fn has_direct_action(&self) -> bool {
        true
    }

    fn apply_element_matrix(
        &self,
        _element: usize,
        _x: DVectorView<f64>,
        _output: DVectorViewMut<f64>,
    ) -> eyre::Result<()> {
        bail!("cache-only integrator applied without precomputed data")
    }

    fn precompute_element(&self, element: usize) -> eyre::Result<Option<Box<dyn Any + Send + Sync>>> {
        Ok(Some(Box::new(self.matrices[element].clone())))
    }

    fn apply_with_cache(
        &self,
        _element: usize,
        cache: &(dyn Any + Send + Sync),
        x: DVectorView<f64>,
        mut output: DVectorViewMut<f64>,
    ) -> eyre::Result<()> {
        let matrix = cache
            .downcast_ref::<DMatrix<f64>>()
            .ok_or_else(|| eyre!("unexpected cache payload"))?;
        output.gemv(1.0, matrix, &x, 0.0);
        Ok(())
    }
}

pub struct MockAuxiliaryElement {
    pub dofs: Vec<usize>,
    pub matrix: DMatrix<f64>,
}

impl AuxiliaryElement<f64> for MockAuxiliaryElement {
    fn populate_dofs(&self, output: &mut Vec<usize>) {
        output.clear();
        output.extend_from_slice(&self.dofs);
    }

    fn assemble_into(&self, mut output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        output.copy_from(&self.matrix);
        Ok(())
    }

    fn apply(&self, x: DVectorView<f64>, mut output: DVectorViewMut<f64>) -> eyre::Result<()> {
        output.gemv(1.0, &self.matrix, &x, 0.0);
        Ok(())
    }

    fn energy(&self, x: DVectorView<f64>) -> eyre::Result<f64> {
        Ok((x.transpose() * &self.matrix * x)[(0, 0)])
    }
}
