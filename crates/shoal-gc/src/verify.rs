//! Heap verification
//!
//! Expensive consistency checks, run after every cycle when
//! `verify = true`. A failure is reported as [`GcError::Verification`].

use rustc_hash::FxHashSet;

use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::ObjRef;
use crate::region::RegionState;

impl Heap {
    /// Walk the object graph from the roots, calling `check` on every
    /// reference found (roots and fields, nulls excluded).
    fn walk_reachable(
        &self,
        mut check: impl FnMut(ObjRef, Option<ObjRef>) -> GcResult<()>,
    ) -> GcResult<()> {
        let mut roots = Vec::new();
        self.visit_roots(&mut |slot| roots.push(slot.load()));

        let mut visited: FxHashSet<ObjRef> = FxHashSet::default();
        let mut stack: Vec<ObjRef> = Vec::new();
        for r in roots.into_iter().filter(|r| !r.is_null()) {
            check(r, None)?;
            if visited.insert(r) {
                stack.push(r);
            }
        }
        while let Some(r) = stack.pop() {
            let obj = self
                .directory
                .object(r)
                .ok_or_else(|| GcError::Verification(format!("dangling reference {r:?}")))?;
            let mut children = Vec::new();
            obj.for_each_field(|_, child| children.push(child));
            for child in children {
                check(child, Some(r))?;
                if visited.insert(child) {
                    stack.push(child);
                }
            }
        }
        Ok(())
    }

    /// No root or reachable field may point into the collection set.
    ///
    /// Runs in the final-update-refs pause, before the set is recycled.
    pub(crate) fn verify_region_closure(&self) -> GcResult<()> {
        self.walk_reachable(|r, holder| {
            match self.directory.region_state(r.region()) {
                Some(RegionState::Cset) => Err(GcError::Verification(format!(
                    "{r:?} (held by {holder:?}) still points into the collection set"
                ))),
                _ => Ok(()),
            }
        })
    }

    /// Check region accounting and that every reachable reference names an
    /// unforwarded object in an active region. Must run in a pause outside
    /// a cycle.
    pub(crate) fn verify_heap(&self) -> GcResult<()> {
        for region in self.directory.regions() {
            let state = region.state();
            let objects = region.objects();
            match state {
                RegionState::Empty | RegionState::Trash => {
                    if !objects.is_empty() || region.used() != 0 {
                        return Err(GcError::Verification(format!(
                            "{:?} region {} holds {} objects",
                            state,
                            region.id(),
                            objects.len()
                        )));
                    }
                }
                RegionState::Cset => {
                    return Err(GcError::Verification(format!(
                        "region {} left in the collection set",
                        region.id()
                    )));
                }
                RegionState::HumongousStart | RegionState::HumongousContinuation => {}
                RegionState::Regular | RegionState::Pinned => {
                    let sum: usize = objects.iter().map(|(_, o)| o.size()).sum();
                    if sum != region.used() {
                        return Err(GcError::Verification(format!(
                            "region {} accounts {} bytes but holds {}",
                            region.id(),
                            region.used(),
                            sum
                        )));
                    }
                    if let Some((off, _)) = objects
                        .iter()
                        .find(|(off, o)| *off as usize + o.size() > region.top())
                    {
                        return Err(GcError::Verification(format!(
                            "object at {}:{} extends past top",
                            region.id(),
                            off
                        )));
                    }
                }
            }
        }

        self.walk_reachable(|r, holder| {
            let state = self.directory.region_state(r.region());
            if !state.is_some_and(RegionState::is_active) {
                return Err(GcError::Verification(format!(
                    "{r:?} (held by {holder:?}) points into a {state:?} region"
                )));
            }
            let obj = self.directory.object(r).ok_or_else(|| {
                GcError::Verification(format!("{r:?} (held by {holder:?}) names no object"))
            })?;
            if obj.forwardee().is_some() {
                return Err(GcError::Verification(format!(
                    "{r:?} is still forwarded outside a cycle"
                )));
            }
            Ok(())
        })
    }

    /// Check heap consistency. Blocks until no cycle is running and stops
    /// mutators while it runs.
    pub fn verify(&self) -> GcResult<()> {
        let _cycle = self.cycle_lock.lock();
        let _pause = self.safepoint.pause("verify");
        self.verify_heap()
    }
}
