//! Use/def tracking: for each versioned register, its writer, the instructions that read it, its
//! facts, and whether generic code may need it after a deopt.

use super::{Facts, Graph, InstAnn, InstIdx, Var};
use smallvec::SmallVec;

#[derive(Clone, Debug, Default)]
pub struct VarInfo {
    pub writer: Option<InstIdx>,
    /// One entry per read: an instruction reading a var twice appears twice.
    pub users: SmallVec<[InstIdx; 4]>,
    pub facts: Facts,
    /// Generic code may read this var after a deopt, so its writer must not be removed.
    pub deopt_required: bool,
}

impl Graph {
    pub fn var(&self, v: Var) -> &VarInfo {
        &self.vars[usize::from(v.reg)][v.version as usize]
    }

    pub(crate) fn var_mut(&mut self, v: Var) -> &mut VarInfo {
        &mut self.vars[usize::from(v.reg)][v.version as usize]
    }

    pub fn facts(&self, v: Var) -> &Facts {
        &self.var(v).facts
    }

    pub(crate) fn facts_mut(&mut self, v: Var) -> &mut Facts {
        &mut self.var_mut(v).facts
    }

    /// Create a fresh version of `reg` with no writer.
    pub(crate) fn new_version(&mut self, reg: u16) -> Var {
        let versions = &mut self.vars[usize::from(reg)];
        versions.push(VarInfo::default());
        Var::new(reg, (versions.len() - 1) as u32)
    }

    /// The number of versions of `reg`, including version 0.
    pub fn num_versions(&self, reg: u16) -> usize {
        self.vars[usize::from(reg)].len()
    }

    pub fn is_used(&self, v: Var) -> bool {
        !self.var(v).users.is_empty()
    }

    /// Record `iidx`'s reads and write.
    pub(crate) fn track(&mut self, iidx: InstIdx) {
        let inst = &self.insts[iidx];
        let reads = inst.reads();
        let write = inst.write();
        for v in reads {
            self.var_mut(v).users.push(iidx);
        }
        if let Some(v) = write {
            self.var_mut(v).writer = Some(iidx);
        }
    }

    /// Forget `iidx`'s reads and write.
    pub(crate) fn untrack(&mut self, iidx: InstIdx) {
        let inst = &self.insts[iidx];
        let reads = inst.reads();
        let write = inst.write();
        for v in reads {
            let users = &mut self.var_mut(v).users;
            if let Some(i) = users.iter().position(|x| *x == iidx) {
                users.remove(i);
            }
        }
        if let Some(v) = write {
            let vi = self.var_mut(v);
            if vi.writer == Some(iidx) {
                vi.writer = None;
            }
        }
    }

    /// Rebuild all use/def information from scratch, keeping facts and deopt flags.
    pub(crate) fn retrack_all(&mut self) {
        for versions in self.vars.iter_mut() {
            for vi in versions.iter_mut() {
                vi.writer = None;
                vi.users.clear();
            }
        }
        for iidx in self.insts_in_order() {
            self.track(iidx);
        }
    }

    /// Flag every var whose definition dominates a deoptimizing instruction as required for
    /// deopt. Vars written by instructions reachable only after every deopt point are left alone.
    pub(crate) fn mark_deopt_usages(&mut self) {
        let deopts = self
            .insts_in_order()
            .into_iter()
            .filter(|x| {
                self.insts[*x]
                    .anns
                    .iter()
                    .any(|a| matches!(a, InstAnn::Deopt { .. }))
            })
            .collect::<Vec<_>>();
        let mut required = Vec::new();
        for d in deopts {
            let db = self.insts[d].block;
            // Definitions earlier in the same block.
            for iidx in &self.blocks[db].insts {
                if *iidx == d {
                    break;
                }
                required.extend(self.insts[*iidx].write());
            }
            // Definitions in strictly dominating blocks.
            let mut b = db;
            while let Some(idom) = self.dom.idom(b) {
                for iidx in &self.blocks[idom].insts {
                    required.extend(self.insts[*iidx].write());
                }
                b = idom;
            }
        }
        for v in required {
            // Only registers generic code knows about matter.
            if usize::from(v.reg) < self.generic_locals {
                self.var_mut(v).deopt_required = true;
            }
        }
    }
}
