//! Topological recompute pass.
//!
//! After a write batch the pending change set holds the atoms whose values
//! actually changed. This pass walks the mounted dependents of those atoms
//! in dependency order and re-reads each one exactly once, so a diamond
//! (two paths from the same source converging on one atom) never recomputes
//! the convergence point twice and never observes a half-updated graph.

use std::collections::HashSet;

use smallvec::SmallVec;
use tracing::trace;

use crate::atom::AtomId;

use super::engine::StoreInner;

impl StoreInner {
    /// Recompute everything the pending change set may have affected.
    ///
    /// Runs a depth-first postorder over mounted dependents, then visits the
    /// order in reverse so an atom is only recomputed after all of its
    /// changed dependencies have settled. Atoms whose dependencies turn out
    /// to be unchanged at their recorded epochs are skipped entirely, which
    /// is what stops propagation when a recompute yields an equal value.
    pub(crate) fn recompute_invalidated(&mut self) {
        let roots: SmallVec<[AtomId; 8]> = self.changed.iter().copied().collect();
        if roots.is_empty() {
            return;
        }
        trace!(roots = roots.len(), "recompute pass");

        let mut order: Vec<AtomId> = Vec::new();
        let mut visiting: HashSet<AtomId> = HashSet::new();
        let mut visited: HashSet<AtomId> = HashSet::new();
        let mut stack: Vec<AtomId> = roots.into_iter().rev().collect();

        while let Some(&id) = stack.last() {
            if visited.contains(&id) {
                stack.pop();
                continue;
            }
            if visiting.contains(&id) {
                stack.pop();
                visited.insert(id);
                order.push(id);
                continue;
            }
            visiting.insert(id);
            if let Some(mounted) = self.mounted.get(&id) {
                for dependent in mounted.dependents.iter().copied() {
                    if !visited.contains(&dependent) && !visiting.contains(&dependent) {
                        stack.push(dependent);
                    }
                }
            }
        }

        // Postorder puts dependents before their dependencies; reverse it.
        for &id in order.iter().rev() {
            let stale = self.states.get(&id).map_or(false, |state| {
                state.deps.keys().any(|dep| *dep != id && self.changed.contains(dep))
            });
            if stale {
                if let Some(atom) = self.resolve(id) {
                    let _ = self.read_atom_state(&atom);
                }
            }
            self.invalidated.remove(&id);
        }
    }
}
