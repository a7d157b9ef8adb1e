//! The assembly driver.
//!
//! [`BilinearForm`] owns the global matrix of a discretized bilinear form together with
//! the registered integrators and drives the assembly pass: sparsity graph
//! construction, allocation, the five element phases in fixed order (interior,
//! boundary, boundary facet, interior facet, auxiliary), the regularization passes and
//! the used-dof report. It also exposes the matrix-free application path, Newton-style
//! linearization, energy evaluation and post-solve recovery of condensed dofs.

use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, eyre, Report, WrapErr};
use nalgebra::{DMatrixViewMut, DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use parking_lot::Mutex;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use thread_local::ThreadLocal;

use crate::assembly::buffers::{ElementScratch, ScratchExhausted, DEFAULT_SCRATCH_BUDGET};
use crate::assembly::condense::{
    eliminate_internal_dofs, internal_local_indices, solve_internal_block, CondensedOperators,
};
use crate::assembly::global::{
    add_diagonal_block_unsynced, add_element_diagonal_unsynced, add_element_matrix_unsynced,
    add_local_vector_unsynced, gather_global_to_local, mark_used_dofs, MatrixLayout,
    ProgressReporter, SharedCsrRows, SharedVectorAccess,
};
use crate::assembly::graph::GraphBuilder;
use crate::assembly::local::{
    accumulate_element_matrix, accumulate_facet_matrix, BilinearIntegrator, CombineMode,
    FacetContext, FacetNeighbor, IntegratorClass,
};
use crate::space::{DofSelection, FiniteElementSpace, VectorTransform};
use crate::topology::MeshTopology;
use crate::{AssemblyScalar, UNUSED_DOF};

/// Maximum number of attempts for matrix-free application before a scratch budget
/// overflow becomes fatal. The budget doubles between attempts.
pub const MAX_SCRATCH_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct AssemblyOptions<T: AssemblyScalar> {
    pub layout: MatrixLayout,
    /// Eliminate internal dofs per element via static condensation.
    pub condense_internal: bool,
    /// Retain the harmonic extension and inner-solve operator collections so that
    /// internal dofs can be recovered without revisiting the integrators.
    pub keep_condensed: bool,
    /// Additionally retain the unfactored internal blocks for inspection.
    pub store_inner_matrix: bool,
    /// Assemble only the matrix diagonal.
    pub diagonal_only: bool,
    /// Added to every diagonal entry after assembly, to avoid a structurally singular
    /// matrix.
    pub eps_regularization: Option<T>,
    /// Added to the diagonal entries of dofs untouched by any element.
    pub unused_diag: Option<T>,
    /// Per-thread element scratch budget, in scalars.
    pub scratch_budget: usize,
}

impl<T: AssemblyScalar> Default for AssemblyOptions<T> {
    fn default() -> Self {
        Self {
            layout: MatrixLayout::General,
            condense_internal: false,
            keep_condensed: false,
            store_inner_matrix: false,
            diagonal_only: false,
            eps_regularization: None,
            unused_diag: Some(T::one()),
            scratch_budget: DEFAULT_SCRATCH_BUDGET,
        }
    }
}

/// Lifecycle state of a [`BilinearForm`]. The intermediate per-phase and
/// regularization states only exist while [`BilinearForm::assemble`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Idle,
    GraphBuilt,
    MatrixAllocated,
    Done,
}

/// Touched/untouched dof counts reported by the last assembly pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub used_dofs: usize,
    pub unused_dofs: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct IntegratorPresence {
    interior: bool,
    boundary: bool,
    interior_facet: bool,
    boundary_facet: bool,
}

impl IntegratorPresence {
    fn has_facet(self) -> bool {
        self.interior_facet || self.boundary_facet
    }
}

pub struct BilinearForm<T, Space, Topology>
where
    T: AssemblyScalar,
    Space: FiniteElementSpace<T>,
    Topology: MeshTopology,
{
    name: String,
    space: Arc<Space>,
    topology: Arc<Topology>,
    integrators: Vec<Arc<dyn BilinearIntegrator<T>>>,
    options: AssemblyOptions<T>,
    /// A reduced-order companion of the same form, e.g. for preconditioning.
    /// Assembled before this form in every lifecycle operation.
    low_order_form: Option<Box<BilinearForm<T, Space, Topology>>>,
    pattern: Option<SparsityPattern>,
    pattern_level: Option<usize>,
    matrix: Option<CsrMatrix<T>>,
    condensed: Option<CondensedOperators<T>>,
    precomputed: Option<Vec<Option<Box<dyn Any + Send + Sync>>>>,
    coloring_validated: bool,
    assembled: bool,
    stats: AssemblyStats,
}

impl<T, Space, Topology> BilinearForm<T, Space, Topology>
where
    T: AssemblyScalar,
    Space: FiniteElementSpace<T>,
    Topology: MeshTopology,
{
    pub fn new(name: impl Into<String>, space: Arc<Space>, topology: Arc<Topology>) -> Self {
        Self {
            name: name.into(),
            space,
            topology,
            integrators: Vec::new(),
            options: AssemblyOptions::default(),
            low_order_form: None,
            pattern: None,
            pattern_level: None,
            matrix: None,
            condensed: None,
            precomputed: None,
            coloring_validated: false,
            assembled: false,
            stats: AssemblyStats::default(),
        }
    }

    pub fn with_options(mut self, options: AssemblyOptions<T>) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &AssemblyOptions<T> {
        &self.options
    }

    pub fn add_integrator(&mut self, integrator: Arc<dyn BilinearIntegrator<T>>) {
        self.integrators.push(integrator);
        // The nonzero pattern may have to grow; force a rebuild on the next assembly.
        self.reallocate();
    }

    pub fn integrators(&self) -> &[Arc<dyn BilinearIntegrator<T>>] {
        &self.integrators
    }

    /// Attaches a reduced-order companion form that is kept in lockstep with this one:
    /// it is (re)assembled before every assembly of this form and reallocated together
    /// with it.
    pub fn set_low_order_form(&mut self, form: BilinearForm<T, Space, Topology>) {
        self.low_order_form = Some(Box::new(form));
    }

    pub fn low_order_form(&self) -> Option<&BilinearForm<T, Space, Topology>> {
        self.low_order_form.as_deref()
    }

    /// The assembled global matrix, if one has been allocated.
    pub fn matrix(&self) -> Option<&CsrMatrix<T>> {
        self.matrix.as_ref()
    }

    /// The operator collections retained by keep-mode condensation during the last
    /// assembly.
    pub fn condensed_operators(&self) -> Option<&CondensedOperators<T>> {
        self.condensed.as_ref()
    }

    pub fn stats(&self) -> AssemblyStats {
        self.stats
    }

    pub fn state(&self) -> AssemblyState {
        if self.assembled {
            AssemblyState::Done
        } else if self.matrix.is_some() {
            AssemblyState::MatrixAllocated
        } else if self.pattern.is_some() {
            AssemblyState::GraphBuilt
        } else {
            AssemblyState::Idle
        }
    }

    /// Discards the matrix, the sparsity graph and all condensation operators. The
    /// next assembly rebuilds everything from scratch.
    pub fn reallocate(&mut self) {
        if let Some(low_order) = &mut self.low_order_form {
            low_order.reallocate();
        }
        self.pattern = None;
        self.pattern_level = None;
        self.matrix = None;
        self.condensed = None;
        self.precomputed = None;
        self.coloring_validated = false;
        self.assembled = false;
    }

    /// Builds or refreshes the global matrix.
    ///
    /// The sparsity graph is rebuilt only if the discretization level changed or the
    /// matrix was discarded; otherwise the existing pattern is reused and the values
    /// are zeroed before the element phases run.
    pub fn assemble(&mut self) -> eyre::Result<&CsrMatrix<T>> {
        self.assemble_impl(None, None)?;
        Ok(self.matrix.as_ref().expect("matrix allocated by assembly"))
    }

    /// Like [`assemble`](Self::assemble), but additionally corrects the attached
    /// linear form for eliminated internal dofs when static condensation is active.
    pub fn assemble_with_rhs(&mut self, rhs: &mut DVector<T>) -> eyre::Result<&CsrMatrix<T>> {
        self.assemble_impl(Some(rhs), None)?;
        Ok(self.matrix.as_ref().expect("matrix allocated by assembly"))
    }

    /// Assembles the operator linearized about the given state vector. Static
    /// condensation is never applied in this path.
    pub fn assemble_linearization(
        &mut self,
        state: DVectorView<'_, T>,
    ) -> eyre::Result<&CsrMatrix<T>> {
        self.assemble_impl(None, Some(state))?;
        Ok(self.matrix.as_ref().expect("matrix allocated by assembly"))
    }

    fn scalar_dim(&self) -> usize {
        self.space.num_dofs() * self.space.field_dim()
    }

    fn integrator_presence(&self) -> IntegratorPresence {
        let mut presence = IntegratorPresence::default();
        for integrator in &self.integrators {
            match integrator.class() {
                IntegratorClass::Interior => presence.interior = true,
                IntegratorClass::Boundary => presence.boundary = true,
                IntegratorClass::InteriorFacet => presence.interior_facet = true,
                IntegratorClass::BoundaryFacet => presence.boundary_facet = true,
            }
        }
        presence
    }

    fn check_facet_support(&self, presence: IntegratorPresence) -> eyre::Result<()> {
        if presence.has_facet() && !self.space.supports_facet_coupling() {
            bail!(
                "form `{}` has facet integrators, but the space does not support facet coupling",
                self.name
            );
        }
        Ok(())
    }

    fn ensure_allocated(&mut self) -> eyre::Result<()> {
        let level = self.topology.num_levels();
        if self.pattern.is_none() || self.pattern_level != Some(level) {
            self.matrix = None;
            self.condensed = None;
            self.coloring_validated = false;
            self.pattern = Some(self.build_pattern()?);
            self.pattern_level = Some(level);
        }
        if let Some(matrix) = &mut self.matrix {
            matrix.values_mut().fill(T::zero());
        } else {
            let pattern = self.pattern.clone().expect("pattern built above");
            let values = vec![T::zero(); pattern.nnz()];
            self.matrix = Some(
                CsrMatrix::try_from_pattern_and_values(pattern, values)
                    .map_err(|err| eyre!("failed to allocate global matrix: {err}"))?,
            );
        }
        self.assembled = false;
        Ok(())
    }

    fn build_pattern(&self) -> eyre::Result<SparsityPattern> {
        let space = &*self.space;
        let topology = &*self.topology;
        let mut builder =
            GraphBuilder::new(space.num_dofs(), space.field_dim(), self.options.layout);
        let mut dofs = Vec::new();

        // With condensation, interior elements couple only their external dofs in the
        // global system.
        let selection = if self.options.condense_internal && !self.options.diagonal_only {
            DofSelection::External
        } else {
            DofSelection::All
        };
        for element in 0..topology.num_elements() {
            if topology.is_ghost_element(element)
                || !space.defined_on(topology.element_subdomain(element))
            {
                continue;
            }
            space.populate_element_dofs(&mut dofs, element, selection);
            builder.add_dof_list(&dofs);
        }

        if space.supports_facet_coupling() {
            // Facet terms couple an element with all of its facet neighbors, so the
            // rows must absorb the neighbors' dof lists as well.
            let mut facets = Vec::new();
            let mut adjacent = Vec::new();
            let mut coupled = Vec::new();
            for element in 0..topology.num_elements() {
                if topology.is_ghost_element(element)
                    || !space.defined_on(topology.element_subdomain(element))
                {
                    continue;
                }
                let mut neighbors = FxHashSet::default();
                topology.populate_element_facets(&mut facets, element);
                for &facet in &facets {
                    topology.populate_facet_elements(&mut adjacent, facet);
                    for &other in &adjacent {
                        if other != element {
                            neighbors.insert(other);
                        }
                    }
                }
                space.populate_element_dofs(&mut dofs, element, DofSelection::All);
                coupled.clear();
                coupled.extend_from_slice(&dofs);
                for &neighbor in &neighbors {
                    if topology.is_ghost_element(neighbor)
                        || !space.defined_on(topology.element_subdomain(neighbor))
                    {
                        continue;
                    }
                    space.populate_element_dofs(&mut dofs, neighbor, DofSelection::All);
                    coupled.extend_from_slice(&dofs);
                }
                builder.add_dof_list(&coupled);
            }
        }

        for boundary_element in 0..topology.num_boundary_elements() {
            if topology.is_ghost_boundary_element(boundary_element)
                || !space
                    .defined_on_boundary(topology.boundary_element_subdomain(boundary_element))
            {
                continue;
            }
            space.populate_boundary_element_dofs(&mut dofs, boundary_element);
            builder.add_dof_list(&dofs);
        }

        for auxiliary in space.auxiliary_elements() {
            auxiliary.populate_dofs(&mut dofs);
            builder.add_dof_list(&dofs);
        }

        builder.build()
    }

    fn assemble_impl(
        &mut self,
        rhs: Option<&mut DVector<T>>,
        linearization: Option<DVectorView<'_, T>>,
    ) -> eyre::Result<()> {
        if let Some(low_order) = &mut self.low_order_form {
            low_order
                .assemble()
                .wrap_err_with(|| format!("in low-order companion of `{}`", self.name))?;
        }
        let presence = self.integrator_presence();
        self.check_facet_support(presence)?;
        if linearization.is_some() && (self.options.condense_internal || self.options.diagonal_only)
        {
            bail!(
                "linearization assembly of form `{}` supports neither static condensation \
                 nor diagonal-only mode",
                self.name
            );
        }
        let scalar_dim = self.scalar_dim();
        if let Some(rhs) = &rhs {
            if rhs.len() != scalar_dim {
                bail!("right-hand side has length {}, expected {scalar_dim}", rhs.len());
            }
        }
        if let Some(state) = linearization {
            if state.len() != scalar_dim {
                bail!("linearization state has length {}, expected {scalar_dim}", state.len());
            }
        }

        self.ensure_allocated()
            .wrap_err_with(|| format!("in assembly of bilinear form `{}`", self.name))?;

        if presence.interior && !self.options.diagonal_only && !self.coloring_validated {
            if let Some(coloring) = self.space.element_coloring() {
                let space = &self.space;
                coloring
                    .validate_disjoint(self.topology.num_elements(), |element, dofs| {
                        space.populate_element_dofs(dofs, element, DofSelection::All)
                    })
                    .wrap_err_with(|| {
                        format!("malformed element coloring in bilinear form `{}`", self.name)
                    })?;
                self.coloring_validated = true;
            }
        }

        let condense =
            self.options.condense_internal && !self.options.diagonal_only && linearization.is_none();
        let num_elements = self.topology.num_elements();
        let num_boundary = self.topology.num_boundary_elements();
        let num_facets = self.topology.num_facets();
        let num_auxiliary = self.space.auxiliary_elements().len();
        let num_dofs = self.space.num_dofs();
        let field_dim = self.space.field_dim();

        self.condensed = (condense && self.options.keep_condensed).then(|| {
            CondensedOperators::new(
                scalar_dim,
                num_elements,
                self.options.layout == MatrixLayout::SymmetricLower,
                self.options.store_inner_matrix,
            )
        });

        let total_steps = presence.interior as usize * num_elements
            + presence.boundary as usize * num_boundary
            + presence.boundary_facet as usize * num_boundary
            + presence.interior_facet as usize * num_facets
            + num_auxiliary;
        let used_dofs: Vec<AtomicBool> =
            std::iter::repeat_with(AtomicBool::default).take(num_dofs).collect();

        {
            let matrix = self.matrix.as_mut().expect("matrix allocated above");
            let pass = AssemblyPass {
                space: &*self.space,
                topology: &*self.topology,
                integrators: &self.integrators,
                options: &self.options,
                field_dim,
                condense,
                access: SharedCsrRows::from_csr(matrix),
                scatter_lock: Mutex::new(()),
                rhs: rhs.map(Mutex::new),
                condensed: self.condensed.as_ref(),
                used_dofs: &used_dofs,
                progress: ProgressReporter::new(total_steps),
                presence,
                linearization,
            };
            pass.run()
                .wrap_err_with(|| format!("in assembly of bilinear form `{}`", self.name))?;
        }

        let used_count = used_dofs
            .iter()
            .filter(|flag| flag.load(Ordering::Relaxed))
            .count();
        self.stats = AssemblyStats {
            used_dofs: used_count,
            unused_dofs: num_dofs - used_count,
        };
        log::info!(
            "assembled `{}`: {} dofs used, {} unused, {} total",
            self.name,
            used_count,
            num_dofs - used_count,
            num_dofs
        );
        self.assembled = true;
        Ok(())
    }

    /// Populates the per-element cache consulted by repeated matrix-free applications.
    pub fn precompute(&mut self) -> eyre::Result<()> {
        let num_elements = self.topology.num_elements();
        let num_integrators = self.integrators.len();
        let mut cache = Vec::with_capacity(num_elements * num_integrators);
        for element in 0..num_elements {
            let subdomain = self.topology.element_subdomain(element);
            let skip =
                self.topology.is_ghost_element(element) || !self.space.defined_on(subdomain);
            for integrator in &self.integrators {
                let entry = if !skip
                    && integrator.class() == IntegratorClass::Interior
                    && integrator.defined_on(subdomain)
                {
                    integrator.precompute_element(element).wrap_err_with(|| {
                        format!("in precompute, integrator = {}", integrator.name())
                    })?
                } else {
                    None
                };
                cache.push(entry);
            }
        }
        self.precomputed = Some(cache);
        Ok(())
    }

    /// Matrix-free action: `y += scale * A x`, without forming the global matrix.
    ///
    /// A scratch budget overflow is retried with a doubled budget, at most
    /// [`MAX_SCRATCH_ATTEMPTS`] times; the contribution is accumulated into a private
    /// vector so a retry restarts cleanly.
    pub fn apply(&self, x: DVectorView<'_, T>, scale: T, y: &mut DVector<T>) -> eyre::Result<()> {
        self.apply_impl(ApplyKind::Standard, x, scale, y)
    }

    /// Matrix-free action of the operator linearized about `lin`.
    pub fn apply_linearized(
        &self,
        lin: DVectorView<'_, T>,
        x: DVectorView<'_, T>,
        scale: T,
        y: &mut DVector<T>,
    ) -> eyre::Result<()> {
        self.apply_impl(ApplyKind::Linearized(lin), x, scale, y)
    }

    fn apply_impl(
        &self,
        kind: ApplyKind<'_, T>,
        x: DVectorView<'_, T>,
        scale: T,
        y: &mut DVector<T>,
    ) -> eyre::Result<()> {
        let presence = self.integrator_presence();
        if presence.has_facet() {
            bail!(
                "matrix-free application of form `{}` is not implemented for facet integrators",
                self.name
            );
        }
        let scalar_dim = self.scalar_dim();
        if x.len() != scalar_dim {
            bail!("input vector has length {}, expected {scalar_dim}", x.len());
        }
        if y.len() != scalar_dim {
            bail!("output vector has length {}, expected {scalar_dim}", y.len());
        }
        if let ApplyKind::Linearized(lin) = kind {
            if lin.len() != scalar_dim {
                bail!("linearization state has length {}, expected {scalar_dim}", lin.len());
            }
        }

        let mut budget = self.options.scratch_budget;
        let mut attempt = 1;
        loop {
            match self.try_apply(kind, x, scale.clone(), budget, presence) {
                Ok(contribution) => {
                    *y += contribution;
                    return Ok(());
                }
                Err(error) => {
                    if attempt < MAX_SCRATCH_ATTEMPTS
                        && error.downcast_ref::<ScratchExhausted>().is_some()
                    {
                        budget *= 2;
                        attempt += 1;
                        log::debug!(
                            "scratch budget exhausted, retrying application of `{}` with budget {budget}",
                            self.name
                        );
                    } else {
                        return Err(error).wrap_err_with(|| {
                            format!("in application of bilinear form `{}`", self.name)
                        });
                    }
                }
            }
        }
    }

    fn try_apply(
        &self,
        kind: ApplyKind<'_, T>,
        x: DVectorView<'_, T>,
        scale: T,
        budget: usize,
        presence: IntegratorPresence,
    ) -> eyre::Result<DVector<T>> {
        let scalar_dim = self.scalar_dim();
        let num_elements = self.topology.num_elements();
        let num_boundary = self.topology.num_boundary_elements();
        let num_auxiliary = self.space.auxiliary_elements().len();
        let total_steps = presence.interior as usize * num_elements
            + presence.boundary as usize * num_boundary
            + num_auxiliary;

        let mut result = DVector::zeros(scalar_dim);
        {
            let pass = ApplyPass {
                space: &*self.space,
                topology: &*self.topology,
                integrators: &self.integrators,
                field_dim: self.space.field_dim(),
                budget,
                access: SharedVectorAccess::from_vector(&mut result),
                scatter_lock: Mutex::new(()),
                progress: ProgressReporter::new(total_steps),
                cache: self.precomputed.as_deref(),
                x,
                linearization: match kind {
                    ApplyKind::Standard => None,
                    ApplyKind::Linearized(lin) => Some(lin),
                },
                scale,
            };
            pass.run(presence)?;
        }
        Ok(result)
    }

    /// The scalar energy `sum_e E_e(x)` over all interior, boundary and auxiliary
    /// elements.
    pub fn energy(&self, x: DVectorView<'_, T>) -> eyre::Result<T> {
        let presence = self.integrator_presence();
        if presence.has_facet() {
            bail!(
                "energy evaluation of form `{}` is not implemented for facet integrators",
                self.name
            );
        }
        let scalar_dim = self.scalar_dim();
        if x.len() != scalar_dim {
            bail!("state vector has length {}, expected {scalar_dim}", x.len());
        }
        let field_dim = self.space.field_dim();
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();

        let mut energy = T::zero();
        if presence.interior {
            energy += (0..self.topology.num_elements())
                .into_par_iter()
                .try_fold(
                    || T::zero(),
                    |acc, element| -> eyre::Result<T> {
                        let mut ws = scratch.get_or(Default::default).borrow_mut();
                        let ws = &mut *ws;
                        if self.topology.is_ghost_element(element) {
                            return Ok(acc);
                        }
                        let subdomain = self.topology.element_subdomain(element);
                        if !self.space.defined_on(subdomain) {
                            return Ok(acc);
                        }
                        self.space.populate_element_dofs(&mut ws.dofs, element, DofSelection::All);
                        gather_global_to_local(x, &mut ws.vec_a, &ws.dofs, field_dim);
                        self.space.transform_element_vector(
                            element,
                            VectorTransform::Solution,
                            DVectorViewMut::from(&mut ws.vec_a),
                        );
                        let mut local = T::zero();
                        for integrator in &self.integrators {
                            if integrator.class() != IntegratorClass::Interior
                                || !integrator.defined_on(subdomain)
                            {
                                continue;
                            }
                            local += integrator
                                .element_energy(element, DVectorView::from(&ws.vec_a))
                                .wrap_err_with(|| {
                                    format!("in energy evaluation of element {element}")
                                })?;
                        }
                        Ok(acc + local)
                    },
                )
                .try_reduce(|| T::zero(), |a, b| Ok(a + b))?;
        }
        if presence.boundary {
            energy += (0..self.topology.num_boundary_elements())
                .into_par_iter()
                .try_fold(
                    || T::zero(),
                    |acc, boundary_element| -> eyre::Result<T> {
                        let mut ws = scratch.get_or(Default::default).borrow_mut();
                        let ws = &mut *ws;
                        if self.topology.is_ghost_boundary_element(boundary_element) {
                            return Ok(acc);
                        }
                        let subdomain = self.topology.boundary_element_subdomain(boundary_element);
                        if !self.space.defined_on_boundary(subdomain) {
                            return Ok(acc);
                        }
                        self.space
                            .populate_boundary_element_dofs(&mut ws.dofs, boundary_element);
                        gather_global_to_local(x, &mut ws.vec_a, &ws.dofs, field_dim);
                        self.space.transform_boundary_element_vector(
                            boundary_element,
                            VectorTransform::Solution,
                            DVectorViewMut::from(&mut ws.vec_a),
                        );
                        let mut local = T::zero();
                        for integrator in &self.integrators {
                            if integrator.class() != IntegratorClass::Boundary
                                || !integrator.defined_on(subdomain)
                            {
                                continue;
                            }
                            local += integrator
                                .element_energy(boundary_element, DVectorView::from(&ws.vec_a))
                                .wrap_err_with(|| {
                                    format!(
                                        "in energy evaluation of boundary element {boundary_element}"
                                    )
                                })?;
                        }
                        Ok(acc + local)
                    },
                )
                .try_reduce(|| T::zero(), |a, b| Ok(a + b))?;
        }
        let mut dofs = Vec::new();
        let mut local = DVector::zeros(0);
        for (index, auxiliary) in self.space.auxiliary_elements().iter().enumerate() {
            auxiliary.populate_dofs(&mut dofs);
            gather_global_to_local(x, &mut local, &dofs, field_dim);
            energy += auxiliary
                .energy(DVectorView::from(&local))
                .wrap_err_with(|| format!("in energy evaluation of auxiliary element {index}"))?;
        }
        Ok(energy)
    }

    /// Recovers the values of condensed internal dofs after the external system has
    /// been solved.
    ///
    /// With retained operators this applies the stored inner solve and harmonic
    /// extension; otherwise the interior integrators are revisited element by element
    /// and the internal residual is solved directly.
    pub fn compute_internal(&self, u: &mut DVector<T>, f: DVectorView<'_, T>) -> eyre::Result<()> {
        if !self.options.condense_internal {
            return Ok(());
        }
        let scalar_dim = self.scalar_dim();
        if u.len() != scalar_dim {
            bail!("solution vector has length {}, expected {scalar_dim}", u.len());
        }
        if f.len() != scalar_dim {
            bail!("right-hand side has length {}, expected {scalar_dim}", f.len());
        }

        if let Some(operators) = &self.condensed {
            operators.solve_inner_into(f, u);
            operators.extend(u);
            return Ok(());
        }

        let presence = self.integrator_presence();
        if !presence.interior {
            return Ok(());
        }
        let field_dim = self.space.field_dim();
        let num_elements = self.topology.num_elements();
        let progress = ProgressReporter::new(num_elements);
        let u_lock = Mutex::new(u);
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();

        (0..num_elements)
            .into_par_iter()
            .try_for_each(|element| -> eyre::Result<()> {
                let mut ws = scratch
                    .get_or(|| RefCell::new(ElementScratch::with_budget(self.options.scratch_budget)))
                    .borrow_mut();
                let ws = &mut *ws;
                progress.bump("computing internal dofs");
                if self.topology.is_ghost_element(element) {
                    return Ok(());
                }
                let subdomain = self.topology.element_subdomain(element);
                if !self.space.defined_on(subdomain) {
                    return Ok(());
                }
                self.space
                    .populate_element_dofs(&mut ws.internal_dofs, element, DofSelection::Internal);
                if ws.internal_dofs.is_empty() {
                    return Ok(());
                }
                self.space.populate_element_dofs(&mut ws.dofs, element, DofSelection::All);
                let count = self.space.element_dof_count(element);
                if ws.dofs.len() != count {
                    bail!(
                        "inconsistent number of degrees of freedom for element {element}: \
                         dof list has {}, element has {count}",
                        ws.dofs.len()
                    );
                }
                let dim = field_dim * count;
                ws.prepare_square(dim).map_err(Report::new)?;
                accumulate_element_matrix(
                    &self.integrators,
                    IntegratorClass::Interior,
                    element,
                    subdomain,
                    CombineMode::Matrix,
                    &mut ws.sum_matrix,
                    &mut ws.work_matrix,
                )
                .wrap_err_with(|| format!("in compute-internal of element {element}"))?;
                self.space
                    .transform_element_matrix(element, DMatrixViewMut::from(&mut ws.sum_matrix));

                internal_local_indices(&ws.dofs, &ws.internal_dofs, field_dim, &mut ws.internal_local)
                    .wrap_err_with(|| format!("in compute-internal of element {element}"))?;

                gather_global_to_local(f, &mut ws.vec_a, &ws.dofs, field_dim);
                {
                    let guard = u_lock.lock();
                    gather_global_to_local(
                        DVectorView::from(&**guard),
                        &mut ws.vec_b,
                        &ws.dofs,
                        field_dim,
                    );
                }
                ws.vec_c.resize_vertically_mut(dim, T::zero());
                ws.vec_c.gemv(T::one(), &ws.sum_matrix, &ws.vec_b, T::zero());
                let residual = DVector::from_iterator(
                    ws.internal_local.len(),
                    ws.internal_local
                        .iter()
                        .map(|&index| ws.vec_a[index].clone() - ws.vec_c[index].clone()),
                );
                let update = solve_internal_block(
                    &ws.sum_matrix,
                    &ws.internal_local,
                    DVectorView::from(&residual),
                )
                .wrap_err_with(|| format!("in compute-internal of element {element}"))?;

                let mut guard = u_lock.lock();
                let u = &mut **guard;
                for (k, &index) in ws.internal_local.iter().enumerate() {
                    let dof = ws.dofs[index / field_dim];
                    if dof != UNUSED_DOF {
                        u[field_dim * dof + index % field_dim] += update[k].clone();
                    }
                }
                Ok(())
            })
            .wrap_err_with(|| format!("in compute-internal of bilinear form `{}`", self.name))
    }
}

enum ApplyKind<'a, T: AssemblyScalar> {
    Standard,
    Linearized(DVectorView<'a, T>),
}

// Views are Copy regardless of `T: Copy`, but a derive would demand it.
impl<'a, T: AssemblyScalar> Clone for ApplyKind<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: AssemblyScalar> Copy for ApplyKind<'a, T> {}

/// Borrowed context for one assembly pass over all phases.
struct AssemblyPass<'a, T, Space, Topology>
where
    T: AssemblyScalar,
    Space: FiniteElementSpace<T>,
    Topology: MeshTopology,
{
    space: &'a Space,
    topology: &'a Topology,
    integrators: &'a [Arc<dyn BilinearIntegrator<T>>],
    options: &'a AssemblyOptions<T>,
    field_dim: usize,
    condense: bool,
    access: SharedCsrRows<'a, T>,
    scatter_lock: Mutex<()>,
    rhs: Option<Mutex<&'a mut DVector<T>>>,
    condensed: Option<&'a CondensedOperators<T>>,
    used_dofs: &'a [AtomicBool],
    progress: ProgressReporter,
    presence: IntegratorPresence,
    linearization: Option<DVectorView<'a, T>>,
}

impl<'a, T, Space, Topology> AssemblyPass<'a, T, Space, Topology>
where
    T: AssemblyScalar,
    Space: FiniteElementSpace<T>,
    Topology: MeshTopology,
{
    fn run(&self) -> eyre::Result<()> {
        if self.presence.interior {
            if self.options.diagonal_only {
                self.interior_diagonal()
                    .wrap_err("in diagonal assembly of interior elements")?;
            } else {
                self.interior().wrap_err("in assembly of interior elements")?;
                if let (Some(rhs), Some(operators)) = (&self.rhs, self.condensed) {
                    let mut guard = rhs.lock();
                    operators.correct_rhs(&mut **guard);
                }
            }
        }
        if self.presence.boundary {
            self.boundary().wrap_err("in assembly of boundary elements")?;
        }
        if self.presence.boundary_facet {
            self.boundary_facet()
                .wrap_err("in assembly of boundary facet elements")?;
        }
        if self.presence.interior_facet {
            self.interior_facet()
                .wrap_err("in assembly of interior facet elements")?;
        }
        if !self.space.auxiliary_elements().is_empty() {
            self.auxiliary().wrap_err("in assembly of auxiliary elements")?;
        }
        self.regularize().wrap_err("in regularization passes")?;
        Ok(())
    }

    fn scratch(&self) -> ElementScratch<T> {
        ElementScratch::with_budget(self.options.scratch_budget)
    }

    fn interior(&self) -> eyre::Result<()> {
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();
        match self.space.element_coloring() {
            Some(coloring) => {
                for group in coloring.groups() {
                    // Elements of one color have disjoint dof lists, so their rows can
                    // be written without synchronization. The par_iter completion acts
                    // as the barrier between colors.
                    group.par_iter().try_for_each(|&element| {
                        let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                        self.process_interior_element(element, &mut ws, false)
                    })?;
                }
                Ok(())
            }
            None => (0..self.topology.num_elements())
                .into_par_iter()
                .try_for_each(|element| {
                    let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                    self.process_interior_element(element, &mut ws, true)
                }),
        }
    }

    fn process_interior_element(
        &self,
        element: usize,
        ws: &mut ElementScratch<T>,
        locked: bool,
    ) -> eyre::Result<()> {
        self.progress.bump("assembling interior elements");
        if self.topology.is_ghost_element(element) {
            return Ok(());
        }
        let subdomain = self.topology.element_subdomain(element);
        if !self.space.defined_on(subdomain) {
            return Ok(());
        }

        self.space.populate_element_dofs(&mut ws.dofs, element, DofSelection::All);
        let count = self.space.element_dof_count(element);
        if ws.dofs.len() != count {
            bail!(
                "inconsistent number of degrees of freedom for element {element}: \
                 dof list has {}, element has {count}",
                ws.dofs.len()
            );
        }
        let d = self.field_dim;
        let dim = d * count;
        ws.prepare_square(dim).map_err(Report::new)?;

        match self.linearization {
            None => accumulate_element_matrix(
                self.integrators,
                IntegratorClass::Interior,
                element,
                subdomain,
                CombineMode::Matrix,
                &mut ws.sum_matrix,
                &mut ws.work_matrix,
            ),
            Some(state) => {
                gather_global_to_local(state, &mut ws.vec_a, &ws.dofs, d);
                self.space.transform_element_vector(
                    element,
                    VectorTransform::Solution,
                    DVectorViewMut::from(&mut ws.vec_a),
                );
                accumulate_element_matrix(
                    self.integrators,
                    IntegratorClass::Interior,
                    element,
                    subdomain,
                    CombineMode::Linearized(DVectorView::from(&ws.vec_a)),
                    &mut ws.sum_matrix,
                    &mut ws.work_matrix,
                )
            }
        }
        .wrap_err_with(|| format!("in assembly of element {element}"))?;

        self.space
            .transform_element_matrix(element, DMatrixViewMut::from(&mut ws.sum_matrix));

        if self.condense {
            self.condense_element(element, ws)
                .wrap_err_with(|| format!("in static condensation of element {element}"))?;
        }

        let guard = locked.then(|| self.scatter_lock.lock());
        // Safety: either the scatter lock is held, or the element coloring guarantees
        // that concurrently processed elements touch disjoint rows.
        unsafe {
            add_element_matrix_unsynced(
                &self.access,
                self.options.layout,
                d,
                &ws.dofs,
                &ws.sum_matrix,
            )?;
        }
        drop(guard);
        mark_used_dofs(self.used_dofs, &ws.dofs);
        Ok(())
    }

    fn condense_element(&self, element: usize, ws: &mut ElementScratch<T>) -> eyre::Result<()> {
        self.space
            .populate_element_dofs(&mut ws.internal_dofs, element, DofSelection::Internal);
        if ws.internal_dofs.is_empty() {
            return Ok(());
        }
        let d = self.field_dim;
        let dim = ws.sum_matrix.nrows();
        internal_local_indices(&ws.dofs, &ws.internal_dofs, d, &mut ws.internal_local)?;
        ws.internal_mask.clear();
        ws.internal_mask.resize(dim, false);
        for &index in &ws.internal_local {
            ws.internal_mask[index] = true;
        }
        let scalar_id = |dofs: &[usize], index: usize| {
            let dof = dofs[index / d];
            if dof == UNUSED_DOF {
                UNUSED_DOF
            } else {
                d * dof + index % d
            }
        };

        // In discard mode the external right-hand side is corrected per element; the
        // internal entries are private to this element, so only the final subtraction
        // below needs the lock.
        let keep = self.condensed.is_some();
        let mut internal_rhs = None;
        if !keep {
            if let Some(rhs) = &self.rhs {
                let guard = rhs.lock();
                let f: &DVector<T> = &**guard;
                internal_rhs = Some(DVector::from_iterator(
                    ws.internal_local.len(),
                    ws.internal_local.iter().map(|&index| {
                        let id = scalar_id(&ws.dofs, index);
                        if id == UNUSED_DOF {
                            T::zero()
                        } else {
                            f[id].clone()
                        }
                    }),
                ));
            }
        }

        let outcome = eliminate_internal_dofs(
            &mut ws.sum_matrix,
            &ws.internal_local,
            keep,
            self.options.store_inner_matrix,
            self.options.layout == MatrixLayout::SymmetricLower,
            internal_rhs.as_ref().map(|f| DVectorView::from(f)),
        )?;

        if let (Some(operators), Some(blocks)) = (self.condensed, outcome.kept) {
            let internal_ids: Vec<usize> = ws
                .internal_local
                .iter()
                .map(|&index| scalar_id(&ws.dofs, index))
                .collect();
            let external_ids: Vec<usize> = (0..dim)
                .filter(|&index| !ws.internal_mask[index])
                .map(|index| scalar_id(&ws.dofs, index))
                .collect();
            operators.insert(element, &internal_ids, &external_ids, blocks)?;
        }

        if let Some(correction) = outcome.rhs_correction {
            if let Some(rhs) = &self.rhs {
                let mut guard = rhs.lock();
                let f: &mut DVector<T> = &mut **guard;
                let mut k = 0;
                for index in 0..dim {
                    if ws.internal_mask[index] {
                        continue;
                    }
                    let id = scalar_id(&ws.dofs, index);
                    if id != UNUSED_DOF {
                        f[id] -= correction[k].clone();
                    }
                    k += 1;
                }
            }
        }

        // The internal rows and columns must not reach the global matrix.
        for &index in &ws.internal_local {
            ws.dofs[index / d] = UNUSED_DOF;
        }
        Ok(())
    }

    fn interior_diagonal(&self) -> eyre::Result<()> {
        let mut ws = self.scratch();
        let d = self.field_dim;
        for element in 0..self.topology.num_elements() {
            self.progress.bump("assembling interior element diagonals");
            if self.topology.is_ghost_element(element) {
                continue;
            }
            let subdomain = self.topology.element_subdomain(element);
            if !self.space.defined_on(subdomain) {
                continue;
            }
            self.space.populate_element_dofs(&mut ws.dofs, element, DofSelection::All);
            let count = self.space.element_dof_count(element);
            if ws.dofs.len() != count {
                bail!(
                    "inconsistent number of degrees of freedom for element {element}: \
                     dof list has {}, element has {count}",
                    ws.dofs.len()
                );
            }
            ws.prepare_vectors(d * count);
            for integrator in self.integrators {
                if integrator.class() != IntegratorClass::Interior
                    || !integrator.defined_on(subdomain)
                {
                    continue;
                }
                if !integrator.has_diagonal() {
                    bail!(
                        "integrator `{}` does not support diagonal-only assembly",
                        integrator.name()
                    );
                }
                ws.vec_b.fill(T::zero());
                integrator
                    .element_diagonal_into(element, DVectorViewMut::from(&mut ws.vec_b))
                    .wrap_err_with(|| {
                        format!(
                            "in diagonal assembly of element {element}, integrator = {}",
                            integrator.name()
                        )
                    })?;
                ws.vec_a += &ws.vec_b;
            }
            // Single-threaded phase, exclusive row access is trivial.
            unsafe {
                add_element_diagonal_unsynced(&self.access, d, &ws.dofs, &ws.vec_a)?;
            }
            mark_used_dofs(self.used_dofs, &ws.dofs);
        }
        Ok(())
    }

    fn boundary(&self) -> eyre::Result<()> {
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();
        (0..self.topology.num_boundary_elements())
            .into_par_iter()
            .try_for_each(|boundary_element| -> eyre::Result<()> {
                let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                let ws = &mut *ws;
                self.progress.bump("assembling boundary elements");
                if self.topology.is_ghost_boundary_element(boundary_element) {
                    return Ok(());
                }
                let subdomain = self.topology.boundary_element_subdomain(boundary_element);
                if !self.space.defined_on_boundary(subdomain) {
                    return Ok(());
                }
                self.space
                    .populate_boundary_element_dofs(&mut ws.dofs, boundary_element);
                let count = self.space.boundary_element_dof_count(boundary_element);
                if ws.dofs.len() != count {
                    bail!(
                        "inconsistent number of degrees of freedom for boundary element \
                         {boundary_element}: dof list has {}, element has {count}",
                        ws.dofs.len()
                    );
                }
                let d = self.field_dim;
                ws.prepare_square(d * count).map_err(Report::new)?;

                match self.linearization {
                    None => accumulate_element_matrix(
                        self.integrators,
                        IntegratorClass::Boundary,
                        boundary_element,
                        subdomain,
                        CombineMode::Matrix,
                        &mut ws.sum_matrix,
                        &mut ws.work_matrix,
                    ),
                    Some(state) => {
                        gather_global_to_local(state, &mut ws.vec_a, &ws.dofs, d);
                        self.space.transform_boundary_element_vector(
                            boundary_element,
                            VectorTransform::Solution,
                            DVectorViewMut::from(&mut ws.vec_a),
                        );
                        accumulate_element_matrix(
                            self.integrators,
                            IntegratorClass::Boundary,
                            boundary_element,
                            subdomain,
                            CombineMode::Linearized(DVectorView::from(&ws.vec_a)),
                            &mut ws.sum_matrix,
                            &mut ws.work_matrix,
                        )
                    }
                }
                .wrap_err_with(|| format!("in assembly of boundary element {boundary_element}"))?;

                self.space.transform_boundary_element_matrix(
                    boundary_element,
                    DMatrixViewMut::from(&mut ws.sum_matrix),
                );

                let guard = self.scatter_lock.lock();
                // Safety: the scatter lock serializes all writers of this phase.
                unsafe {
                    add_element_matrix_unsynced(
                        &self.access,
                        self.options.layout,
                        d,
                        &ws.dofs,
                        &ws.sum_matrix,
                    )?;
                }
                drop(guard);
                mark_used_dofs(self.used_dofs, &ws.dofs);
                Ok(())
            })
    }

    fn boundary_facet(&self) -> eyre::Result<()> {
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();
        (0..self.topology.num_boundary_elements())
            .into_par_iter()
            .try_for_each(|boundary_element| -> eyre::Result<()> {
                let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                let ws = &mut *ws;
                self.progress.bump("assembling boundary facet elements");
                if self.topology.is_ghost_boundary_element(boundary_element) {
                    return Ok(());
                }
                let subdomain = self.topology.boundary_element_subdomain(boundary_element);
                if !self.space.defined_on_boundary(subdomain) {
                    return Ok(());
                }
                let facet = self.topology.boundary_element_facet(boundary_element);
                self.topology.populate_facet_elements(&mut ws.index_buf, facet);
                let Some(&element) = ws.index_buf.first() else {
                    bail!("boundary facet {facet} has no adjacent element");
                };
                self.topology.populate_element_facets(&mut ws.facet_buf, element);
                let local_facet = ws
                    .facet_buf
                    .iter()
                    .position(|&f| f == facet)
                    .ok_or_else(|| eyre!("facet {facet} is not a facet of element {element}"))?;

                self.space.populate_element_dofs(&mut ws.dofs, element, DofSelection::All);
                let count = self.space.element_dof_count(element);
                if ws.dofs.len() != count {
                    bail!(
                        "inconsistent number of degrees of freedom for element {element}: \
                         dof list has {}, element has {count}",
                        ws.dofs.len()
                    );
                }
                let d = self.field_dim;
                ws.prepare_square(d * count).map_err(Report::new)?;

                let context = FacetContext {
                    facet,
                    element,
                    local_facet,
                    neighbor: None,
                };
                accumulate_facet_matrix(
                    self.integrators,
                    IntegratorClass::BoundaryFacet,
                    &context,
                    (subdomain, None),
                    &mut ws.sum_matrix,
                    &mut ws.work_matrix,
                )
                .wrap_err_with(|| {
                    format!("in assembly of boundary facet element {boundary_element}")
                })?;

                let guard = self.scatter_lock.lock();
                // Safety: the scatter lock serializes all writers of this phase.
                unsafe {
                    add_element_matrix_unsynced(
                        &self.access,
                        self.options.layout,
                        d,
                        &ws.dofs,
                        &ws.sum_matrix,
                    )?;
                }
                drop(guard);
                mark_used_dofs(self.used_dofs, &ws.dofs);
                Ok(())
            })
    }

    fn interior_facet(&self) -> eyre::Result<()> {
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();
        (0..self.topology.num_facets())
            .into_par_iter()
            .try_for_each(|facet| -> eyre::Result<()> {
                let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                let ws = &mut *ws;
                self.progress.bump("assembling interior facet elements");
                self.topology.populate_facet_elements(&mut ws.index_buf, facet);
                // Facets with fewer than two neighbors carry no coupling term; any
                // further neighbors (non-manifold configurations) are ignored.
                if ws.index_buf.len() < 2 {
                    return Ok(());
                }
                let element = ws.index_buf[0];
                let neighbor = ws.index_buf[1];
                if self.topology.is_ghost_element(element)
                    || self.topology.is_ghost_element(neighbor)
                {
                    return Ok(());
                }
                let subdomain = self.topology.element_subdomain(element);
                let neighbor_subdomain = self.topology.element_subdomain(neighbor);
                if !self.space.defined_on(subdomain) || !self.space.defined_on(neighbor_subdomain) {
                    return Ok(());
                }

                self.topology.populate_element_facets(&mut ws.facet_buf, element);
                let local_facet = ws
                    .facet_buf
                    .iter()
                    .position(|&f| f == facet)
                    .ok_or_else(|| eyre!("facet {facet} is not a facet of element {element}"))?;
                self.topology.populate_element_facets(&mut ws.facet_buf, neighbor);
                let neighbor_local_facet = ws
                    .facet_buf
                    .iter()
                    .position(|&f| f == facet)
                    .ok_or_else(|| eyre!("facet {facet} is not a facet of element {neighbor}"))?;

                self.space.populate_element_dofs(&mut ws.dofs, element, DofSelection::All);
                let count = self.space.element_dof_count(element);
                if ws.dofs.len() != count {
                    bail!(
                        "inconsistent number of degrees of freedom for element {element}: \
                         dof list has {}, element has {count}",
                        ws.dofs.len()
                    );
                }
                self.space
                    .populate_element_dofs(&mut ws.index_buf, neighbor, DofSelection::All);
                let neighbor_count = self.space.element_dof_count(neighbor);
                if ws.index_buf.len() != neighbor_count {
                    bail!(
                        "inconsistent number of degrees of freedom for element {neighbor}: \
                         dof list has {}, element has {neighbor_count}",
                        ws.index_buf.len()
                    );
                }
                ws.dofs.extend_from_slice(&ws.index_buf);

                let d = self.field_dim;
                ws.prepare_square(d * (count + neighbor_count)).map_err(Report::new)?;

                let context = FacetContext {
                    facet,
                    element,
                    local_facet,
                    neighbor: Some(FacetNeighbor {
                        element: neighbor,
                        local_facet: neighbor_local_facet,
                    }),
                };
                accumulate_facet_matrix(
                    self.integrators,
                    IntegratorClass::InteriorFacet,
                    &context,
                    (subdomain, Some(neighbor_subdomain)),
                    &mut ws.sum_matrix,
                    &mut ws.work_matrix,
                )
                .wrap_err_with(|| format!("in assembly of interior facet {facet}"))?;

                let guard = self.scatter_lock.lock();
                // Safety: the scatter lock serializes all writers of this phase.
                unsafe {
                    add_element_matrix_unsynced(
                        &self.access,
                        self.options.layout,
                        d,
                        &ws.dofs,
                        &ws.sum_matrix,
                    )?;
                }
                drop(guard);
                mark_used_dofs(self.used_dofs, &ws.dofs);
                Ok(())
            })
    }

    fn auxiliary(&self) -> eyre::Result<()> {
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();
        self.space
            .auxiliary_elements()
            .par_iter()
            .enumerate()
            .try_for_each(|(index, auxiliary)| -> eyre::Result<()> {
                let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                let ws = &mut *ws;
                self.progress.bump("assembling auxiliary elements");
                auxiliary.populate_dofs(&mut ws.dofs);
                let dim = self.field_dim * ws.dofs.len();
                ws.prepare_square(dim).map_err(Report::new)?;
                auxiliary
                    .assemble_into(DMatrixViewMut::from(&mut ws.sum_matrix))
                    .wrap_err_with(|| format!("in assembly of auxiliary element {index}"))?;

                let guard = self.scatter_lock.lock();
                // Safety: the scatter lock serializes all writers of this phase.
                unsafe {
                    add_element_matrix_unsynced(
                        &self.access,
                        self.options.layout,
                        self.field_dim,
                        &ws.dofs,
                        &ws.sum_matrix,
                    )?;
                }
                drop(guard);
                mark_used_dofs(self.used_dofs, &ws.dofs);
                Ok(())
            })
    }

    fn regularize(&self) -> eyre::Result<()> {
        let d = self.field_dim;
        let num_dofs = self.used_dofs.len();
        if let Some(eps) = &self.options.eps_regularization {
            for dof in 0..num_dofs {
                // Safety: this pass runs single-threaded after all element phases.
                unsafe {
                    add_diagonal_block_unsynced(&self.access, d, dof, eps.clone())?;
                }
            }
        }
        if let Some(value) = &self.options.unused_diag {
            for (dof, used) in self.used_dofs.iter().enumerate() {
                if !used.load(Ordering::Relaxed) {
                    // Safety: this pass runs single-threaded after all element phases.
                    unsafe {
                        add_diagonal_block_unsynced(&self.access, d, dof, value.clone())?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Borrowed context for one matrix-free application pass.
struct ApplyPass<'a, T, Space, Topology>
where
    T: AssemblyScalar,
    Space: FiniteElementSpace<T>,
    Topology: MeshTopology,
{
    space: &'a Space,
    topology: &'a Topology,
    integrators: &'a [Arc<dyn BilinearIntegrator<T>>],
    field_dim: usize,
    budget: usize,
    access: SharedVectorAccess<'a, T>,
    scatter_lock: Mutex<()>,
    progress: ProgressReporter,
    cache: Option<&'a [Option<Box<dyn Any + Send + Sync>>]>,
    x: DVectorView<'a, T>,
    linearization: Option<DVectorView<'a, T>>,
    scale: T,
}

impl<'a, T, Space, Topology> ApplyPass<'a, T, Space, Topology>
where
    T: AssemblyScalar,
    Space: FiniteElementSpace<T>,
    Topology: MeshTopology,
{
    fn run(&self, presence: IntegratorPresence) -> eyre::Result<()> {
        if presence.interior {
            self.interior().wrap_err("in application of interior elements")?;
        }
        if presence.boundary {
            self.boundary().wrap_err("in application of boundary elements")?;
        }
        if !self.space.auxiliary_elements().is_empty() {
            self.auxiliary()
                .wrap_err("in application of auxiliary elements")?;
        }
        Ok(())
    }

    fn scratch(&self) -> ElementScratch<T> {
        ElementScratch::with_budget(self.budget)
    }

    fn interior(&self) -> eyre::Result<()> {
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();
        match self.space.element_coloring() {
            Some(coloring) => {
                for group in coloring.groups() {
                    group.par_iter().try_for_each(|&element| {
                        let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                        self.process_interior_element(element, &mut ws, false)
                    })?;
                }
                Ok(())
            }
            None => (0..self.topology.num_elements())
                .into_par_iter()
                .try_for_each(|element| {
                    let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                    self.process_interior_element(element, &mut ws, true)
                }),
        }
    }

    fn process_interior_element(
        &self,
        element: usize,
        ws: &mut ElementScratch<T>,
        locked: bool,
    ) -> eyre::Result<()> {
        self.progress.bump("applying interior elements");
        if self.topology.is_ghost_element(element) {
            return Ok(());
        }
        let subdomain = self.topology.element_subdomain(element);
        if !self.space.defined_on(subdomain) {
            return Ok(());
        }
        self.space.populate_element_dofs(&mut ws.dofs, element, DofSelection::All);
        let count = self.space.element_dof_count(element);
        if ws.dofs.len() != count {
            bail!(
                "inconsistent number of degrees of freedom for element {element}: \
                 dof list has {}, element has {count}",
                ws.dofs.len()
            );
        }
        let d = self.field_dim;
        let dim = d * count;
        ws.prepare_vectors(dim);
        gather_global_to_local(self.x, &mut ws.vec_a, &ws.dofs, d);
        self.space.transform_element_vector(
            element,
            VectorTransform::Solution,
            DVectorViewMut::from(&mut ws.vec_a),
        );
        if let Some(lin) = self.linearization {
            gather_global_to_local(lin, &mut ws.vec_c, &ws.dofs, d);
            self.space.transform_element_vector(
                element,
                VectorTransform::Solution,
                DVectorViewMut::from(&mut ws.vec_c),
            );
        }

        for (j, integrator) in self.integrators.iter().enumerate() {
            if integrator.class() != IntegratorClass::Interior || !integrator.defined_on(subdomain)
            {
                continue;
            }
            match self.linearization {
                None if integrator.has_direct_action() => {
                    ws.vec_c.fill(T::zero());
                    let cached = self
                        .cache
                        .and_then(|cache| cache[element * self.integrators.len() + j].as_ref());
                    match cached {
                        Some(data) => integrator.apply_with_cache(
                            element,
                            &**data,
                            DVectorView::from(&ws.vec_a),
                            DVectorViewMut::from(&mut ws.vec_c),
                        ),
                        None => integrator.apply_element_matrix(
                            element,
                            DVectorView::from(&ws.vec_a),
                            DVectorViewMut::from(&mut ws.vec_c),
                        ),
                    }
                    .wrap_err_with(|| {
                        format!(
                            "in application of element {element}, integrator = {}",
                            integrator.name()
                        )
                    })?;
                    ws.vec_b += &ws.vec_c;
                }
                None => {
                    ws.prepare_square(dim).map_err(Report::new)?;
                    integrator
                        .element_matrix_into(element, DMatrixViewMut::from(&mut ws.work_matrix))
                        .wrap_err_with(|| {
                            format!(
                                "in application of element {element}, integrator = {}",
                                integrator.name()
                            )
                        })?;
                    ws.vec_b.gemv(T::one(), &ws.work_matrix, &ws.vec_a, T::one());
                }
                Some(_) => {
                    ws.prepare_square(dim).map_err(Report::new)?;
                    integrator
                        .linearized_matrix_into(
                            element,
                            DVectorView::from(&ws.vec_c),
                            DMatrixViewMut::from(&mut ws.work_matrix),
                        )
                        .wrap_err_with(|| {
                            format!(
                                "in linearized application of element {element}, integrator = {}",
                                integrator.name()
                            )
                        })?;
                    ws.vec_b.gemv(T::one(), &ws.work_matrix, &ws.vec_a, T::one());
                }
            }
        }

        self.space.transform_element_vector(
            element,
            VectorTransform::RightHandSide,
            DVectorViewMut::from(&mut ws.vec_b),
        );
        ws.vec_b *= self.scale.clone();

        let guard = locked.then(|| self.scatter_lock.lock());
        // Safety: either the scatter lock is held, or the element coloring guarantees
        // that concurrently processed elements touch disjoint entries.
        unsafe {
            add_local_vector_unsynced(&self.access, d, &ws.dofs, &ws.vec_b);
        }
        drop(guard);
        Ok(())
    }

    fn boundary(&self) -> eyre::Result<()> {
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();
        (0..self.topology.num_boundary_elements())
            .into_par_iter()
            .try_for_each(|boundary_element| -> eyre::Result<()> {
                let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                let ws = &mut *ws;
                self.progress.bump("applying boundary elements");
                if self.topology.is_ghost_boundary_element(boundary_element) {
                    return Ok(());
                }
                let subdomain = self.topology.boundary_element_subdomain(boundary_element);
                if !self.space.defined_on_boundary(subdomain) {
                    return Ok(());
                }
                self.space
                    .populate_boundary_element_dofs(&mut ws.dofs, boundary_element);
                let count = self.space.boundary_element_dof_count(boundary_element);
                if ws.dofs.len() != count {
                    bail!(
                        "inconsistent number of degrees of freedom for boundary element \
                         {boundary_element}: dof list has {}, element has {count}",
                        ws.dofs.len()
                    );
                }
                let d = self.field_dim;
                let dim = d * count;
                ws.prepare_vectors(dim);
                gather_global_to_local(self.x, &mut ws.vec_a, &ws.dofs, d);
                self.space.transform_boundary_element_vector(
                    boundary_element,
                    VectorTransform::Solution,
                    DVectorViewMut::from(&mut ws.vec_a),
                );
                if let Some(lin) = self.linearization {
                    gather_global_to_local(lin, &mut ws.vec_c, &ws.dofs, d);
                    self.space.transform_boundary_element_vector(
                        boundary_element,
                        VectorTransform::Solution,
                        DVectorViewMut::from(&mut ws.vec_c),
                    );
                }

                for integrator in self.integrators {
                    if integrator.class() != IntegratorClass::Boundary
                        || !integrator.defined_on(subdomain)
                    {
                        continue;
                    }
                    match self.linearization {
                        None if integrator.has_direct_action() => {
                            ws.vec_c.fill(T::zero());
                            integrator
                                .apply_element_matrix(
                                    boundary_element,
                                    DVectorView::from(&ws.vec_a),
                                    DVectorViewMut::from(&mut ws.vec_c),
                                )
                                .wrap_err_with(|| {
                                    format!(
                                        "in application of boundary element {boundary_element}, \
                                         integrator = {}",
                                        integrator.name()
                                    )
                                })?;
                            ws.vec_b += &ws.vec_c;
                        }
                        None => {
                            ws.prepare_square(dim).map_err(Report::new)?;
                            integrator
                                .element_matrix_into(
                                    boundary_element,
                                    DMatrixViewMut::from(&mut ws.work_matrix),
                                )
                                .wrap_err_with(|| {
                                    format!(
                                        "in application of boundary element {boundary_element}, \
                                         integrator = {}",
                                        integrator.name()
                                    )
                                })?;
                            ws.vec_b.gemv(T::one(), &ws.work_matrix, &ws.vec_a, T::one());
                        }
                        Some(_) => {
                            ws.prepare_square(dim).map_err(Report::new)?;
                            integrator
                                .linearized_matrix_into(
                                    boundary_element,
                                    DVectorView::from(&ws.vec_c),
                                    DMatrixViewMut::from(&mut ws.work_matrix),
                                )
                                .wrap_err_with(|| {
                                    format!(
                                        "in linearized application of boundary element \
                                         {boundary_element}, integrator = {}",
                                        integrator.name()
                                    )
                                })?;
                            ws.vec_b.gemv(T::one(), &ws.work_matrix, &ws.vec_a, T::one());
                        }
                    }
                }

                self.space.transform_boundary_element_vector(
                    boundary_element,
                    VectorTransform::RightHandSide,
                    DVectorViewMut::from(&mut ws.vec_b),
                );
                ws.vec_b *= self.scale.clone();

                let guard = self.scatter_lock.lock();
                // Safety: the scatter lock serializes all writers of this phase.
                unsafe {
                    add_local_vector_unsynced(&self.access, d, &ws.dofs, &ws.vec_b);
                }
                drop(guard);
                Ok(())
            })
    }

    fn auxiliary(&self) -> eyre::Result<()> {
        let scratch: ThreadLocal<RefCell<ElementScratch<T>>> = ThreadLocal::new();
        self.space
            .auxiliary_elements()
            .par_iter()
            .enumerate()
            .try_for_each(|(index, auxiliary)| -> eyre::Result<()> {
                let mut ws = scratch.get_or(|| RefCell::new(self.scratch())).borrow_mut();
                let ws = &mut *ws;
                self.progress.bump("applying auxiliary elements");
                auxiliary.populate_dofs(&mut ws.dofs);
                let dim = self.field_dim * ws.dofs.len();
                ws.prepare_vectors(dim);
                gather_global_to_local(self.x, &mut ws.vec_a, &ws.dofs, self.field_dim);
                auxiliary
                    .apply(DVectorView::from(&ws.vec_a), DVectorViewMut::from(&mut ws.vec_b))
                    .wrap_err_with(|| format!("in application of auxiliary element {index}"))?;
                ws.vec_b *= self.scale.clone();

                let guard = self.scatter_lock.lock();
                // Safety: the scatter lock serializes all writers of this phase.
                unsafe {
                    add_local_vector_unsynced(&self.access, self.field_dim, &ws.dofs, &ws.vec_b);
                }
                drop(guard);
                Ok(())
            })
    }
}
