//! Dead code elimination.

use super::{Graph, InstIdx};
use vob::Vob;

impl Graph {
    /// Delete pure instructions whose results are unused and not needed by deoptimization,
    /// repeating until nothing more can be removed. Returns the number of instructions deleted.
    pub(crate) fn eliminate_dead_code(&mut self) -> usize {
        let mut deleted = 0;
        loop {
            let mut dead = Vob::from_elem(false, self.insts.len());
            for iidx in self.insts_in_order() {
                let inst = &self.insts[iidx];
                if !inst.op.is_pure() {
                    continue;
                }
                if let Some(v) = inst.write() {
                    let vi = self.var(v);
                    // A PHI that only feeds itself is dead.
                    let used = vi.users.iter().any(|u| *u != iidx);
                    if !used && !vi.deopt_required {
                        dead.set(iidx.index(), true);
                    }
                }
            }
            let dead = dead.iter_set_bits(..).map(InstIdx::from).collect::<Vec<_>>();
            if dead.is_empty() {
                return deleted;
            }
            for iidx in dead {
                self.delete_inst(iidx);
                deleted += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        bytecode::Opcode,
        ir::test::{graph, match_ptn},
    };

    #[test]
    fn removes_chains() {
        let mut g = graph(
            "
              param_rp_i r0, 0
              const_i64 r1, 1
              add_i r2, r0, r1
              mul_i r3, r2, r2
              return_i r0
            ",
        );
        assert_eq!(g.eliminate_dead_code(), 3);
        match_ptn(
            &g.to_string(),
            "
            block b0: -> [b1]
            block b1: <- [b0]
              param_rp_i r0(1), 0
              return_i r0(1)
            ",
        );
        g.assert_well_formed();
    }

    #[test]
    fn keeps_deopt_required() {
        let mut g = graph(
            "
            .callsite obj
              const_i64 r1, 1
              dispatch_o r0, cs0, \"m\"
              return_o r0
            ",
        );
        assert_eq!(g.eliminate_dead_code(), 0);
        assert_eq!(g.count_op(Opcode::ConstI64), 1);
    }
}
