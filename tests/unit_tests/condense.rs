use biform::assembly::condense::eliminate_internal_dofs;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector, DVectorView};

fn example_element_matrix() -> DMatrix<f64> {
    DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 1.0, 1.0, 4.0, 1.0, 1.0, 1.0, 4.0])
}

#[test]
fn schur_complement_of_example_matrix() {
    let mut elmat = example_element_matrix();
    let outcome = eliminate_internal_dofs(&mut elmat, &[2], false, false, true, None).unwrap();
    assert!(outcome.kept.is_none());
    assert!(outcome.rhs_correction.is_none());

    let schur = elmat.view((0, 0), (2, 2)).clone_owned();
    let expected = DMatrix::from_row_slice(2, 2, &[3.75, 0.75, 0.75, 3.75]);
    assert_matrix_eq!(schur, expected, comp = abs, tol = 1e-14);
}

#[test]
fn no_internal_dofs_is_a_no_op() {
    let mut elmat = example_element_matrix();
    let outcome = eliminate_internal_dofs(&mut elmat, &[], false, false, true, None).unwrap();
    assert!(outcome.kept.is_none());
    assert_matrix_eq!(elmat, example_element_matrix());
}

#[test]
fn singular_internal_block_is_an_error() {
    let mut elmat = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 0.0]);
    let error = eliminate_internal_dofs(&mut elmat, &[1], false, false, true, None).unwrap_err();
    assert!(error.to_string().contains("singular internal dof block"));
}

#[test]
fn keep_mode_produces_extension_and_inner_solve() {
    let mut elmat = example_element_matrix();
    let outcome = eliminate_internal_dofs(&mut elmat, &[2], true, true, false, None).unwrap();
    let blocks = outcome.kept.unwrap();

    // D = [4], He = -D^{-1} C = [-0.25, -0.25], Het = -B D^{-1}
    assert_matrix_eq!(
        blocks.inner_solve,
        DMatrix::from_element(1, 1, 0.25),
        comp = abs,
        tol = 1e-14
    );
    assert_matrix_eq!(
        blocks.extension,
        DMatrix::from_row_slice(1, 2, &[-0.25, -0.25]),
        comp = abs,
        tol = 1e-14
    );
    assert_matrix_eq!(
        blocks.extension_transpose.unwrap(),
        DMatrix::from_row_slice(2, 1, &[-0.25, -0.25]),
        comp = abs,
        tol = 1e-14
    );
    assert_matrix_eq!(
        blocks.inner_matrix.unwrap(),
        DMatrix::from_element(1, 1, 4.0),
        comp = abs,
        tol = 1e-14
    );
}

#[test]
fn symmetric_keep_mode_omits_the_transpose_extension() {
    let mut elmat = example_element_matrix();
    let outcome = eliminate_internal_dofs(&mut elmat, &[2], true, false, true, None).unwrap();
    let blocks = outcome.kept.unwrap();
    assert!(blocks.extension_transpose.is_none());
    assert!(blocks.inner_matrix.is_none());
}

#[test]
fn discard_mode_corrects_the_right_hand_side() {
    let mut elmat = example_element_matrix();
    let internal_rhs = DVector::from_element(1, 3.0);
    let outcome = eliminate_internal_dofs(
        &mut elmat,
        &[2],
        false,
        false,
        true,
        Some(DVectorView::from(&internal_rhs)),
    )
    .unwrap();

    // B D^{-1} f_int = [0.25 * 3, 0.25 * 3]
    let correction = outcome.rhs_correction.unwrap();
    assert_matrix_eq!(
        correction,
        DVector::from_element(2, 0.75),
        comp = abs,
        tol = 1e-14
    );
}

#[test]
fn interior_internal_index_is_handled() {
    // Eliminate the middle dof; the Schur complement lands on positions {0, 2}.
    let mut elmat = example_element_matrix();
    eliminate_internal_dofs(&mut elmat, &[1], false, false, true, None).unwrap();
    assert!((elmat[(0, 0)] - 3.75).abs() < 1e-14);
    assert!((elmat[(0, 2)] - 0.75).abs() < 1e-14);
    assert!((elmat[(2, 0)] - 0.75).abs() < 1e-14);
    assert!((elmat[(2, 2)] - 3.75).abs() < 1e-14);
}
