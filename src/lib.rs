use nalgebra::ComplexField;

pub mod assembly;
pub mod coloring;
pub mod space;
pub mod topology;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

pub use crate::space::UNUSED_DOF;

/// A scalar type that can be assembled into a global matrix.
///
/// Used as a trait alias for the bounds required throughout the assembly routines:
/// a (real or complex) field whose values may be shared between worker threads.
pub trait AssemblyScalar: ComplexField + Copy + Send + Sync {}

impl<T> AssemblyScalar for T where T: ComplexField + Copy + Send + Sync {}
