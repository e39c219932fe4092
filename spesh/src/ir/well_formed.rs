//! Structural checks on a [Graph], run after each pass in debug builds.

use super::{Graph, InstIdx, Opcode, Var};
use std::collections::HashMap;

impl Graph {
    /// Panic if the graph is not well formed:
    ///   * every live instruction is in exactly one reachable block, which its `block` field names;
    ///   * every version other than 0 has exactly one writer, which use/def information records;
    ///   * use/def information matches the operands of live instructions;
    ///   * `PHI`s come first in their block and have one source per predecessor;
    ///   * predecessor and successor lists mirror one another.
    pub(crate) fn assert_well_formed(&self) {
        assert!(
            self.local_kinds.len() <= usize::from(u16::MAX),
            "{} registers exceeds the register limit",
            self.local_kinds.len()
        );
        let mut seen = HashMap::<InstIdx, usize>::new();
        let mut writers = HashMap::<Var, InstIdx>::new();
        let mut users = HashMap::<Var, usize>::new();
        for bidx in &self.order {
            let b = &self.blocks[*bidx];
            for s in &b.succs {
                assert!(
                    self.blocks[*s].preds.contains(bidx),
                    "b{}: successor b{} does not list it as a predecessor",
                    bidx.index(),
                    s.index()
                );
            }
            for p in &b.preds {
                assert!(
                    self.blocks[*p].succs.contains(bidx),
                    "b{}: predecessor b{} does not list it as a successor",
                    bidx.index(),
                    p.index()
                );
            }
            let mut past_phis = false;
            for iidx in &b.insts {
                *seen.entry(*iidx).or_default() += 1;
                let inst = &self.insts[*iidx];
                assert!(!inst.deleted, "{iidx:?}: deleted instruction in b{}", bidx.index());
                assert_eq!(inst.block, *bidx, "{iidx:?}: in the wrong block");
                if inst.op == Opcode::Phi {
                    assert!(!past_phis, "{iidx:?}: PHI after a non-PHI instruction");
                    assert_eq!(
                        inst.operands.len(),
                        b.preds.len() + 1,
                        "{iidx:?}: PHI does not have one source per predecessor"
                    );
                } else {
                    past_phis = true;
                    assert_eq!(
                        inst.operands.len(),
                        inst.op.operands().len(),
                        "{iidx:?}: wrong number of operands for {}",
                        inst.op
                    );
                }
                if let Some(v) = inst.write() {
                    assert_ne!(v.version, 0, "{iidx:?}: writes version 0 of r{}", v.reg);
                    if let Some(other) = writers.insert(v, *iidx) {
                        panic!("{iidx:?}: {v} is also written by {other:?}");
                    }
                    assert_eq!(self.var(v).writer, Some(*iidx), "{iidx:?}: {v} writer not tracked");
                }
                for v in inst.reads() {
                    *users.entry(v).or_default() += 1;
                    assert!(
                        self.var(v).users.iter().filter(|x| *x == iidx).count() > 0,
                        "{iidx:?}: read of {v} not tracked"
                    );
                }
            }
        }
        for (iidx, n) in seen {
            assert_eq!(n, 1, "{iidx:?}: appears in {n} places");
        }
        for (reg, versions) in self.vars.iter().enumerate() {
            for (version, vi) in versions.iter().enumerate() {
                let v = Var::new(reg as u16, version as u32);
                assert_eq!(
                    vi.users.len(),
                    users.get(&v).copied().unwrap_or(0),
                    "{v}: tracked users do not match the graph"
                );
                if let Some(w) = vi.writer {
                    assert!(!self.insts[w].deleted, "{v}: written by deleted {w:?}");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::ir::{test::graph, Operand, Var};

    #[test]
    fn built_graphs_are_well_formed() {
        let g = graph(
            "
              param_rp_i r0, 0
              if_i r0, @a
              const_i64 r1, 1
              goto @b
            a:
              const_i64 r1, 2
            b:
              add_i r1, r1, r1
              return_i r1
            ",
        );
        g.assert_well_formed();
    }

    #[test]
    #[should_panic(expected = "not tracked")]
    fn untracked_read() {
        let mut g = graph(
            "
              const_i64 r0, 1
              return_i r0
            ",
        );
        let ret = g.insts_in_order()[1];
        g.insts[ret].operands[0] = Operand::Var(Var::new(0, 0));
        g.assert_well_formed();
    }
}
