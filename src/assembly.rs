//! Assembly of discretized bilinear forms.
//!
//! The entry point is [`form::BilinearForm`], which drives a full pass over interior,
//! boundary, facet and auxiliary elements. Per element, the contributions of all
//! applicable integrators ([`local::BilinearIntegrator`]) are summed into one dense
//! local matrix, optionally reduced by static condensation ([`condense`]) and
//! scattered into a global CSR matrix whose pattern is determined once per
//! discretization level ([`graph`]). The matrix-free path accumulates into an output
//! vector instead. Parallel scatter follows two regimes ([`global`]): lock-free within
//! an element color group, lock-protected everywhere else.

pub mod buffers;
pub mod condense;
pub mod form;
pub mod global;
pub mod graph;
pub mod local;
