//! Element coloring for conflict-free parallel scatter-add.
//!
//! A coloring partitions the interior elements into ordered groups such that no two
//! elements in the same group share a dof. Within a group, scatter-add into the global
//! matrix needs no synchronization; groups are separated by a barrier. The coloring is
//! normally produced by the finite element space and treated as opaque here, but a
//! greedy fallback is provided for spaces that do not precompute one.

use eyre::bail;

use crate::UNUSED_DOF;

/// An ordered partition of element indices into groups with pairwise disjoint dof lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementColoring {
    groups: Vec<Vec<usize>>,
}

impl ElementColoring {
    pub fn from_groups(groups: Vec<Vec<usize>>) -> Self {
        Self { groups }
    }

    pub fn num_colors(&self) -> usize {
        self.groups.len()
    }

    pub fn num_elements(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    /// Checks that the coloring is a partition of `0..num_elements` and that elements
    /// of the same color have disjoint dof lists (sentinel entries are ignored).
    ///
    /// `element_dofs` must populate the full dof list of the given element.
    pub fn validate_disjoint<F>(&self, num_elements: usize, mut element_dofs: F) -> eyre::Result<()>
    where
        F: FnMut(usize, &mut Vec<usize>),
    {
        let mut seen = vec![false; num_elements];
        // For every dof, the last (color, element) that visited it. The table is grown
        // on demand since the dof range is not known up front. Tracking the element as
        // well keeps duplicate entries within one element's list from counting as a
        // conflict.
        let mut last_visited: Vec<(usize, usize)> = Vec::new();
        let mut dofs = Vec::new();

        for (color, group) in self.groups.iter().enumerate() {
            for &element in group {
                if element >= num_elements {
                    bail!(
                        "coloring references element {element}, \
                         but the mesh has only {num_elements} elements"
                    );
                }
                if seen[element] {
                    bail!("element {element} occurs in more than one color group");
                }
                seen[element] = true;

                element_dofs(element, &mut dofs);
                for &dof in &dofs {
                    if dof == UNUSED_DOF {
                        continue;
                    }
                    if dof >= last_visited.len() {
                        last_visited.resize(dof + 1, (usize::MAX, usize::MAX));
                    }
                    let (last_color, last_element) = last_visited[dof];
                    if last_color == color && last_element != element {
                        bail!("elements of color {color} share dof {dof}");
                    }
                    last_visited[dof] = (color, element);
                }
            }
        }

        let covered = seen.iter().filter(|&&covered| covered).count();
        if covered != num_elements {
            bail!("coloring covers {covered} of {num_elements} elements");
        }
        Ok(())
    }
}

/// Greedy fallback coloring of the given dof lists.
///
/// Repeatedly sweeps the remaining elements, assigning each to the current color unless
/// one of its dofs was already visited by that color, in which case it is postponed to
/// a later sweep. The resulting groups are disjoint by construction.
pub fn sequential_greedy_coloring(element_dofs: &[Vec<usize>]) -> ElementColoring {
    let mut groups = Vec::new();
    let mut postponed = Vec::new();
    let mut current: Vec<usize> = (0..element_dofs.len()).collect();
    // For every dof, the last color that visited it.
    let mut last_visited: Vec<usize> = Vec::new();

    let mut color = 0;
    while !current.is_empty() {
        let mut group = Vec::new();
        for &element in &current {
            let dofs = &element_dofs[element];
            let blocked = dofs.iter().any(|&dof| {
                dof != UNUSED_DOF && last_visited.get(dof).map_or(false, |&c| c == color)
            });
            if blocked {
                postponed.push(element);
            } else {
                for &dof in dofs {
                    if dof == UNUSED_DOF {
                        continue;
                    }
                    if dof >= last_visited.len() {
                        // Grow past the immediate need to amortize repeated resizes.
                        last_visited.resize(2 * dof + 1, usize::MAX);
                    }
                    last_visited[dof] = color;
                }
                group.push(element);
            }
        }
        groups.push(group);
        std::mem::swap(&mut postponed, &mut current);
        postponed.clear();
        color += 1;
    }

    ElementColoring::from_groups(groups)
}
