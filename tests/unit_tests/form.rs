use std::sync::Arc;

use biform::assembly::buffers::ScratchExhausted;
use biform::assembly::form::{AssemblyOptions, AssemblyState, BilinearForm};
use biform::assembly::global::{matrix_entry, MatrixLayout};
use biform::assembly::local::IntegratorClass;
use biform::coloring::sequential_greedy_coloring;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector, DVectorView};

use super::mocks::{
    ConstantFacetIntegrator, DenseIntegrator, DiagonalLinearization, MockAuxiliaryElement,
    MockSpace, MockTopology,
};

fn identity_integrator(name: &str, sizes: &[usize]) -> DenseIntegrator {
    DenseIntegrator::interior(
        name,
        sizes.iter().map(|&n| DMatrix::identity(n, n)).collect(),
    )
}

fn stiffness_matrix() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[2.0, -1.0, -1.0, 2.0])
}

/// A 1D "mesh" of `num_elements` segments sharing their endpoints.
fn line_mesh(num_elements: usize) -> (MockSpace, MockTopology) {
    let element_dofs: Vec<Vec<usize>> = (0..num_elements).map(|e| vec![e, e + 1]).collect();
    let space = MockSpace::with_elements(num_elements + 1, element_dofs);
    let topology = MockTopology::with_elements(num_elements);
    (space, topology)
}

fn dense<Space, Topology>(form: &BilinearForm<f64, Space, Topology>) -> DMatrix<f64>
where
    Space: biform::space::FiniteElementSpace<f64>,
    Topology: biform::topology::MeshTopology,
{
    DMatrix::from(form.matrix().expect("matrix assembled"))
}

#[test]
fn single_element_identity_assembles_to_identity() {
    let space = MockSpace::with_elements(3, vec![vec![0, 1, 2]]);
    let topology = MockTopology::with_elements(1);
    let mut form = BilinearForm::new("identity", Arc::new(space), Arc::new(topology));
    form.add_integrator(Arc::new(identity_integrator("id", &[3])));

    form.assemble().unwrap();
    assert_matrix_eq!(dense(&form), DMatrix::identity(3, 3));
    assert_eq!(form.stats().used_dofs, 3);
    assert_eq!(form.stats().unused_dofs, 0);

    let ones = DVector::from_element(3, 1.0);
    let energy = form.energy(DVectorView::from(&ones)).unwrap();
    assert!((energy - 3.0).abs() < 1e-14);
}

#[test]
fn untouched_dof_receives_the_unused_diagonal_value() {
    let space = MockSpace::with_elements(4, vec![vec![0, 1, 2]]);
    let topology = MockTopology::with_elements(1);
    let mut form = BilinearForm::new("untouched", Arc::new(space), Arc::new(topology))
        .with_options(AssemblyOptions {
            unused_diag: Some(5.0),
            ..AssemblyOptions::default()
        });
    form.add_integrator(Arc::new(identity_integrator("id", &[3])));

    let matrix = form.assemble().unwrap();
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 3, 3), 5.0);
    for j in 0..3 {
        assert_eq!(matrix_entry(matrix, MatrixLayout::General, 3, j), 0.0);
        assert_eq!(matrix_entry(matrix, MatrixLayout::General, j, 3), 0.0);
    }
    assert_eq!(form.stats().unused_dofs, 1);
}

#[test]
fn eps_regularization_shifts_every_diagonal() {
    let space = MockSpace::with_elements(2, vec![vec![0, 1]]);
    let topology = MockTopology::with_elements(1);
    let mut form = BilinearForm::new("eps", Arc::new(space), Arc::new(topology)).with_options(
        AssemblyOptions {
            eps_regularization: Some(0.5),
            unused_diag: None,
            ..AssemblyOptions::default()
        },
    );
    form.add_integrator(Arc::new(identity_integrator("id", &[2])));

    form.assemble().unwrap();
    assert_matrix_eq!(dense(&form), DMatrix::identity(2, 2) * 1.5, comp = abs, tol = 1e-14);
}

#[test]
fn contributions_of_multiple_integrators_are_additive() {
    let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
    let b = DMatrix::from_row_slice(2, 2, &[0.5, -1.0, 2.5, 0.25]);

    let make_form = |integrators: Vec<DenseIntegrator>| {
        let space = MockSpace::with_elements(2, vec![vec![0, 1]]);
        let topology = MockTopology::with_elements(1);
        let mut form = BilinearForm::new("additive", Arc::new(space), Arc::new(topology));
        for integrator in integrators {
            form.add_integrator(Arc::new(integrator));
        }
        form
    };

    let mut split = make_form(vec![
        DenseIntegrator::interior("a", vec![a.clone()]),
        DenseIntegrator::interior("b", vec![b.clone()]),
    ]);
    let mut combined = make_form(vec![DenseIntegrator::interior("ab", vec![&a + &b])]);

    split.assemble().unwrap();
    combined.assemble().unwrap();
    assert_matrix_eq!(dense(&split), dense(&combined));
}

#[test]
fn reassembly_without_reallocation_is_idempotent() {
    let (mut space, topology) = line_mesh(4);
    space.coloring = Some(sequential_greedy_coloring(&space.element_dofs));
    let mut form = BilinearForm::new("idempotent", Arc::new(space), Arc::new(topology));
    form.add_integrator(Arc::new(DenseIntegrator::interior(
        "stiffness",
        vec![stiffness_matrix(); 4],
    )));

    form.assemble().unwrap();
    let first = dense(&form);
    assert_eq!(form.state(), AssemblyState::Done);

    form.assemble().unwrap();
    let second = dense(&form);
    assert_eq!(first, second);
}

#[test]
fn colored_and_serialized_assembly_agree() {
    let build = |colored: bool| {
        let (mut space, topology) = line_mesh(4);
        if colored {
            space.coloring = Some(sequential_greedy_coloring(&space.element_dofs));
        }
        let mut form = BilinearForm::new("regime", Arc::new(space), Arc::new(topology));
        form.add_integrator(Arc::new(DenseIntegrator::interior(
            "stiffness",
            vec![stiffness_matrix(); 4],
        )));
        form.assemble().unwrap();
        dense(&form)
    };
    assert_matrix_eq!(build(true), build(false), comp = abs, tol = 1e-13);
}

#[test]
fn symmetric_storage_matches_the_full_layout() {
    let (space, topology) = line_mesh(2);
    let space = Arc::new(space);
    let topology = Arc::new(topology);

    let mut symmetric = BilinearForm::new("sym", space.clone(), topology.clone()).with_options(
        AssemblyOptions {
            layout: MatrixLayout::SymmetricLower,
            ..AssemblyOptions::default()
        },
    );
    let mut general = BilinearForm::new("gen", space, topology);
    for form in [&mut symmetric, &mut general] {
        form.add_integrator(Arc::new(DenseIntegrator::interior(
            "stiffness",
            vec![stiffness_matrix(); 2],
        )));
    }
    let stored = symmetric.assemble().unwrap().clone();
    let reference = general.assemble().unwrap();

    for i in 0..3 {
        for j in 0..3 {
            let effective = matrix_entry(&stored, MatrixLayout::SymmetricLower, i, j);
            let transposed = matrix_entry(&stored, MatrixLayout::SymmetricLower, j, i);
            assert_eq!(effective, transposed);
            assert_eq!(effective, matrix_entry(reference, MatrixLayout::General, i, j));
        }
    }
}

fn condensed_example_form(
    keep: bool,
) -> BilinearForm<f64, MockSpace, MockTopology> {
    let mut space = MockSpace::with_elements(3, vec![vec![0, 1, 2]]);
    space.internal_dofs = vec![vec![2]];
    let topology = MockTopology::with_elements(1);
    let mut form = BilinearForm::new("condensed", Arc::new(space), Arc::new(topology))
        .with_options(AssemblyOptions {
            condense_internal: true,
            keep_condensed: keep,
            ..AssemblyOptions::default()
        });
    form.add_integrator(Arc::new(DenseIntegrator::interior(
        "example",
        vec![DMatrix::from_row_slice(
            3,
            3,
            &[4.0, 1.0, 1.0, 1.0, 4.0, 1.0, 1.0, 1.0, 4.0],
        )],
    )));
    form
}

#[test]
fn condensation_scatters_the_schur_complement() {
    let mut form = condensed_example_form(false);
    let matrix = form.assemble().unwrap();

    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 0, 0), 3.75);
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 0, 1), 0.75);
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 1, 0), 0.75);
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 1, 1), 3.75);
    // The eliminated dof is structurally decoupled and only regularized.
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 0, 2), 0.0);
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 2, 2), 1.0);
    assert_eq!(form.stats().unused_dofs, 1);
}

#[test]
fn condensation_round_trip_reproduces_the_full_solution() {
    for keep in [false, true] {
        let full_matrix =
            DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 1.0, 1.0, 4.0, 1.0, 1.0, 1.0, 4.0]);
        let f = DVector::from_column_slice(&[1.0, 2.0, 3.0]);
        let reference = full_matrix.clone().lu().solve(&f).unwrap();

        let mut form = condensed_example_form(keep);
        let mut rhs = f.clone();
        form.assemble_with_rhs(&mut rhs).unwrap();

        // External part of the corrected right-hand side: f_ext - B D^{-1} f_int
        assert!((rhs[0] - 0.25).abs() < 1e-14);
        assert!((rhs[1] - 1.25).abs() < 1e-14);
        assert!((rhs[2] - 3.0).abs() < 1e-14);

        let reduced = dense(&form).view((0, 0), (2, 2)).clone_owned();
        let external = reduced
            .lu()
            .solve(&DVector::from_column_slice(&[rhs[0], rhs[1]]))
            .unwrap();

        let mut solution = DVector::zeros(3);
        solution.rows_mut(0, 2).copy_from(&external);
        form.compute_internal(&mut solution, DVectorView::from(&rhs)).unwrap();

        assert_matrix_eq!(solution, reference, comp = abs, tol = 1e-12);
        assert_eq!(form.condensed_operators().is_some(), keep);
    }
}

#[test]
fn kept_operators_store_the_harmonic_extension() {
    let mut form = condensed_example_form(true);
    form.assemble().unwrap();
    let operators = form.condensed_operators().unwrap();
    let (rows, cols, extension) = operators.harmonic_extension().element_block(0).unwrap();
    assert_eq!(rows, vec![2]);
    assert_eq!(cols, vec![0, 1]);
    assert_matrix_eq!(
        extension,
        DMatrix::from_row_slice(1, 2, &[-0.25, -0.25]),
        comp = abs,
        tol = 1e-14
    );
    assert!(operators.inner_matrix().is_none());
}

#[test]
fn inconsistent_dof_count_aborts_assembly() {
    let mut space = MockSpace::with_elements(3, vec![vec![0, 1, 2]]);
    space.dof_count_override = Some((0, 5));
    let topology = MockTopology::with_elements(1);
    let mut form = BilinearForm::new("broken", Arc::new(space), Arc::new(topology));
    form.add_integrator(Arc::new(identity_integrator("id", &[3])));

    let error = form.assemble().unwrap_err();
    let message = format!("{error:#}");
    assert!(message.contains("inconsistent number of degrees of freedom"));
    assert!(message.contains("element 0"));
    assert!(message.contains("interior"));
    assert!(message.contains("broken"));
}

#[test]
fn facet_integrators_require_facet_coupling_support() {
    let space = MockSpace::with_elements(2, vec![vec![0, 1]]);
    let topology = MockTopology::with_elements(1);
    let mut form = BilinearForm::new("no-dg", Arc::new(space), Arc::new(topology));
    form.add_integrator(Arc::new(ConstantFacetIntegrator {
        name: "jump".into(),
        class: IntegratorClass::InteriorFacet,
        value: 1.0,
    }));

    assert!(form.assemble().is_err());
    // The failure is reported before any allocation happens.
    assert_eq!(form.state(), AssemblyState::Idle);
}

#[test]
fn interior_facet_terms_couple_both_elements() {
    let mut space = MockSpace::with_elements(4, vec![vec![0, 1], vec![2, 3]]);
    space.facet_coupling = true;
    let mut topology = MockTopology::with_elements(2);
    topology.element_facets = vec![vec![0], vec![0]];
    topology.facet_elements = vec![vec![0, 1]];

    let mut form = BilinearForm::new("dg", Arc::new(space), Arc::new(topology)).with_options(
        AssemblyOptions {
            unused_diag: None,
            ..AssemblyOptions::default()
        },
    );
    form.add_integrator(Arc::new(ConstantFacetIntegrator {
        name: "jump".into(),
        class: IntegratorClass::InteriorFacet,
        value: 1.0,
    }));

    form.assemble().unwrap();
    assert_matrix_eq!(dense(&form), DMatrix::from_element(4, 4, 1.0));
}

#[test]
fn boundary_facet_terms_scatter_into_the_adjacent_element() {
    let mut space = MockSpace::with_elements(2, vec![vec![0, 1]]);
    space.facet_coupling = true;
    space.boundary_dofs = vec![vec![0]];
    let mut topology = MockTopology::with_elements(1);
    topology.num_boundary_elements = 1;
    topology.element_facets = vec![vec![0]];
    topology.facet_elements = vec![vec![0]];
    topology.boundary_facets = vec![0];

    let mut form = BilinearForm::new("bdg", Arc::new(space), Arc::new(topology)).with_options(
        AssemblyOptions {
            unused_diag: None,
            ..AssemblyOptions::default()
        },
    );
    form.add_integrator(Arc::new(ConstantFacetIntegrator {
        name: "trace".into(),
        class: IntegratorClass::BoundaryFacet,
        value: 2.0,
    }));

    form.assemble().unwrap();
    assert_matrix_eq!(dense(&form), DMatrix::from_element(2, 2, 2.0));
}

#[test]
fn diagonal_only_assembly_never_touches_off_diagonals() {
    let matrix = DMatrix::from_row_slice(3, 3, &[1.0, 9.0, 9.0, 9.0, 2.0, 9.0, 9.0, 9.0, 3.0]);
    let space = MockSpace::with_elements(3, vec![vec![0, 1, 2]]);
    let topology = MockTopology::with_elements(1);
    let mut form = BilinearForm::new("diag", Arc::new(space), Arc::new(topology)).with_options(
        AssemblyOptions {
            diagonal_only: true,
            ..AssemblyOptions::default()
        },
    );
    form.add_integrator(Arc::new(DenseIntegrator::interior("d", vec![matrix])));

    form.assemble().unwrap();
    assert_matrix_eq!(
        dense(&form),
        DMatrix::from_diagonal(&DVector::from_column_slice(&[1.0, 2.0, 3.0]))
    );
}

#[test]
fn ghost_elements_are_skipped() {
    let (space, mut topology) = line_mesh(2);
    topology.ghost_elements = vec![1];
    let mut form = BilinearForm::new("ghost", Arc::new(space), Arc::new(topology));
    form.add_integrator(Arc::new(DenseIntegrator::interior(
        "stiffness",
        vec![stiffness_matrix(); 2],
    )));

    let matrix = form.assemble().unwrap();
    // Only element 0 contributes; dof 2 falls back to the unused-diagonal value.
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 1, 1), 2.0);
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 1, 2), 0.0);
    assert_eq!(matrix_entry(matrix, MatrixLayout::General, 2, 2), 1.0);
    assert_eq!(form.stats().unused_dofs, 1);
}

#[test]
fn linearization_uses_the_supplied_state() {
    let space = MockSpace::with_elements(3, vec![vec![0, 1, 2]]);
    let topology = MockTopology::with_elements(1);
    let mut form = BilinearForm::new("newton", Arc::new(space), Arc::new(topology));
    form.add_integrator(Arc::new(DiagonalLinearization {
        name: "nl".into(),
    }));

    let state = DVector::from_column_slice(&[1.0, 2.0, 3.0]);
    form.assemble_linearization(DVectorView::from(&state)).unwrap();
    assert_matrix_eq!(dense(&form), DMatrix::from_diagonal(&state));
}

#[test]
fn energy_sums_interior_boundary_and_auxiliary_contributions() {
    let mut space = MockSpace::with_elements(2, vec![vec![0, 1]]);
    space.boundary_dofs = vec![vec![0]];
    space.auxiliary.push(Box::new(MockAuxiliaryElement {
        dofs: vec![1],
        matrix: DMatrix::from_element(1, 1, 2.0),
    }));
    let mut topology = MockTopology::with_elements(1);
    topology.num_boundary_elements = 1;

    let mut form = BilinearForm::new("energy", Arc::new(space), Arc::new(topology));
    form.add_integrator(Arc::new(identity_integrator("id", &[2])));
    form.add_integrator(Arc::new(DenseIntegrator::boundary(
        "robin",
        vec![DMatrix::from_element(1, 1, 5.0)],
    )));

    let x = DVector::from_column_slice(&[1.0, 2.0]);
    let energy = form.energy(DVectorView::from(&x)).unwrap();
    // x^T I x + 5 x_0^2 + 2 x_1^2 = 5 + 5 + 8
    assert!((energy - 18.0).abs() < 1e-14);
}

#[test]
fn state_machine_transitions() {
    let (space, topology) = line_mesh(2);
    let mut form = BilinearForm::new("states", Arc::new(space), Arc::new(topology));
    assert_eq!(form.state(), AssemblyState::Idle);

    form.add_integrator(Arc::new(DenseIntegrator::interior(
        "stiffness",
        vec![stiffness_matrix(); 2],
    )));
    form.assemble().unwrap();
    assert_eq!(form.state(), AssemblyState::Done);

    form.reallocate();
    assert_eq!(form.state(), AssemblyState::Idle);
    assert!(form.matrix().is_none());

    form.assemble().unwrap();
    assert_eq!(form.state(), AssemblyState::Done);
}

#[test]
fn low_order_companion_is_assembled_first() {
    let (space, topology) = line_mesh(2);
    let space = Arc::new(space);
    let topology = Arc::new(topology);

    let mut low_order = BilinearForm::new("low-order", space.clone(), topology.clone());
    low_order.add_integrator(Arc::new(DenseIntegrator::interior(
        "mass",
        vec![DMatrix::identity(2, 2); 2],
    )));

    let mut form = BilinearForm::new("high-order", space, topology);
    form.add_integrator(Arc::new(DenseIntegrator::interior(
        "stiffness",
        vec![stiffness_matrix(); 2],
    )));
    form.set_low_order_form(low_order);

    form.assemble().unwrap();
    let companion = form.low_order_form().unwrap();
    assert_eq!(companion.state(), AssemblyState::Done);
    assert!(companion.matrix().is_some());
}

#[test]
fn scratch_budget_exhaustion_is_fatal_during_assembly() {
    let (space, topology) = line_mesh(2);
    let mut form = BilinearForm::new("tiny", Arc::new(space), Arc::new(topology)).with_options(
        AssemblyOptions {
            scratch_budget: 1,
            ..AssemblyOptions::default()
        },
    );
    form.add_integrator(Arc::new(DenseIntegrator::interior(
        "stiffness",
        vec![stiffness_matrix(); 2],
    )));

    let error = form.assemble().unwrap_err();
    assert!(error.downcast_ref::<ScratchExhausted>().is_some());
}
