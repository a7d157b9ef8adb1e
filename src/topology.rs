//! The contract against the mesh/topology collaborator.

/// Topological queries needed to drive assembly: entity counts, facet adjacency for
/// skeleton terms, subdomain indices for applicability predicates and ghost/ownership
/// flags for distributed runs. Geometry is of no concern here; coordinate transforms
/// live behind the integrators.
pub trait MeshTopology: Send + Sync {
    fn num_elements(&self) -> usize;

    fn num_boundary_elements(&self) -> usize;

    fn num_facets(&self) -> usize;

    /// Number of discretization levels. Assembly reuses the sparsity graph as long as
    /// this value does not change.
    fn num_levels(&self) -> usize {
        1
    }

    fn element_subdomain(&self, element: usize) -> usize {
        let _ = element;
        0
    }

    fn boundary_element_subdomain(&self, boundary_element: usize) -> usize {
        let _ = boundary_element;
        0
    }

    /// The facets of a (volume) element, in local facet order.
    fn populate_element_facets(&self, output: &mut Vec<usize>, element: usize);

    /// The elements adjacent to a facet. One entry for boundary facets, two for
    /// interior facets; further entries (non-manifold configurations) are ignored
    /// by facet assembly, which pairs the first two.
    fn populate_facet_elements(&self, output: &mut Vec<usize>, facet: usize);

    /// The facet that a boundary element coincides with.
    fn boundary_element_facet(&self, boundary_element: usize) -> usize;

    /// Elements owned by another process are skipped in every assembly phase.
    fn is_ghost_element(&self, element: usize) -> bool {
        let _ = element;
        false
    }

    fn is_ghost_boundary_element(&self, boundary_element: usize) -> bool {
        let _ = boundary_element;
        false
    }
}
