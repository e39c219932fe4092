//! Dominance and register versioning.
//!
//! Dominators are computed with the iterative algorithm of Cooper, Harvey, and Kennedy ("A Simple,
//! Fast Dominance Algorithm") over reverse postorder. Versioning inserts `PHI`s on dominance
//! frontiers and renames along the dominator tree.

use super::{Block, BlockIdx, Graph, Opcode, Operand, Var, VarInfo};
use index_vec::IndexVec;
use std::collections::BTreeSet;

#[derive(Clone, Debug, Default)]
pub(crate) struct Dominance {
    rpo: Vec<BlockIdx>,
    rpo_idx: IndexVec<BlockIdx, Option<usize>>,
    idom: IndexVec<BlockIdx, Option<BlockIdx>>,
    children: IndexVec<BlockIdx, Vec<BlockIdx>>,
}

impl Dominance {
    pub(crate) fn compute(blocks: &IndexVec<BlockIdx, Block>, entry: BlockIdx) -> Self {
        // Postorder via an explicit stack of (block, next successor to visit).
        let mut visited = vec![false; blocks.len()];
        let mut post = Vec::with_capacity(blocks.len());
        let mut stack = vec![(entry, 0)];
        visited[entry.index()] = true;
        while let Some((b, i)) = stack.pop() {
            if let Some(s) = blocks[b].succs.get(i) {
                stack.push((b, i + 1));
                if !visited[s.index()] {
                    visited[s.index()] = true;
                    stack.push((*s, 0));
                }
            } else {
                post.push(b);
            }
        }
        let rpo = post.into_iter().rev().collect::<Vec<_>>();
        let mut rpo_idx = IndexVec::from_vec(vec![None; blocks.len()]);
        for (i, b) in rpo.iter().enumerate() {
            rpo_idx[*b] = Some(i);
        }

        let mut idom: IndexVec<BlockIdx, Option<BlockIdx>> =
            IndexVec::from_vec(vec![None; blocks.len()]);
        idom[entry] = Some(entry);
        let intersect =
            |idom: &IndexVec<BlockIdx, Option<BlockIdx>>, mut a: BlockIdx, mut b: BlockIdx| {
                while a != b {
                    while rpo_idx[a] > rpo_idx[b] {
                        a = idom[a].unwrap_or(entry);
                    }
                    while rpo_idx[b] > rpo_idx[a] {
                        b = idom[b].unwrap_or(entry);
                    }
                }
                a
            };
        let mut changed = true;
        while changed {
            changed = false;
            for b in rpo.iter().skip(1) {
                let mut new_idom = None;
                for p in &blocks[*b].preds {
                    if idom[*p].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => *p,
                        Some(x) => intersect(&idom, *p, x),
                    });
                }
                if new_idom.is_some() && idom[*b] != new_idom {
                    idom[*b] = new_idom;
                    changed = true;
                }
            }
        }

        let mut children = IndexVec::from_vec(vec![Vec::new(); blocks.len()]);
        for b in rpo.iter().skip(1) {
            if let Some(d) = idom[*b] {
                children[d].push(*b);
            }
        }
        // The entry block is its own idom only for the purposes of the algorithm above.
        idom[entry] = None;
        Self {
            rpo,
            rpo_idx,
            idom,
            children,
        }
    }

    /// The reachable blocks in reverse postorder.
    pub(crate) fn rpo(&self) -> &[BlockIdx] {
        &self.rpo
    }

    pub(crate) fn is_reachable(&self, b: BlockIdx) -> bool {
        self.rpo_idx.get(b).copied().flatten().is_some()
    }

    /// The immediate dominator of `b`, or `None` for the entry block and unreachable blocks.
    pub(crate) fn idom(&self, b: BlockIdx) -> Option<BlockIdx> {
        self.idom.get(b).copied().flatten()
    }

    pub(crate) fn children(&self, b: BlockIdx) -> &[BlockIdx] {
        &self.children[b]
    }

    /// Does `a` dominate `b`? Every block dominates itself.
    pub(crate) fn dominates(&self, a: BlockIdx, b: BlockIdx) -> bool {
        let mut cur = Some(b);
        while let Some(x) = cur {
            if x == a {
                return true;
            }
            cur = self.idom(x);
        }
        false
    }

    /// Does any reachable edge go backwards in reverse postorder (i.e. is there a loop)?
    pub(crate) fn has_back_edge(&self, blocks: &IndexVec<BlockIdx, Block>) -> bool {
        self.rpo.iter().any(|b| {
            blocks[*b]
                .succs
                .iter()
                .any(|s| self.rpo_idx[*s] <= self.rpo_idx[*b])
        })
    }
}

enum Walk {
    Enter(BlockIdx),
    Exit(Vec<u16>),
}

/// Version every register in `g`, whose operands must all currently be version 0, and build its
/// use/def information.
pub(super) fn construct(g: &mut Graph) {
    g.dom = Dominance::compute(&g.blocks, g.entry);
    let nregs = g.local_kinds.len();

    // Dominance frontiers.
    let mut df = IndexVec::<BlockIdx, BTreeSet<BlockIdx>>::from_vec(vec![
        BTreeSet::new();
        g.blocks.len()
    ]);
    for b in g.dom.rpo().to_vec() {
        let preds = g.blocks[b]
            .preds
            .iter()
            .filter(|p| g.dom.is_reachable(**p))
            .copied()
            .collect::<Vec<_>>();
        if preds.len() < 2 {
            continue;
        }
        let Some(idom) = g.dom.idom(b) else { continue };
        for p in preds {
            let mut runner = p;
            while runner != idom {
                df[runner].insert(b);
                match g.dom.idom(runner) {
                    Some(x) => runner = x,
                    None => break,
                }
            }
        }
    }

    // Insert PHIs.
    let mut defsites = vec![BTreeSet::new(); nregs];
    for b in g.dom.rpo() {
        for iidx in &g.blocks[*b].insts {
            if let Some(v) = g.insts[*iidx].write() {
                defsites[usize::from(v.reg)].insert(*b);
            }
        }
    }
    for (reg, sites) in defsites.into_iter().enumerate() {
        let mut has_phi = BTreeSet::new();
        let mut work = sites.iter().copied().collect::<Vec<_>>();
        let mut in_work = sites;
        while let Some(d) = work.pop() {
            for y in df[d].clone() {
                if has_phi.insert(y) {
                    let mut ops = vec![Operand::Var(Var::new(reg as u16, 0))];
                    ops.extend(
                        g.blocks[y]
                            .preds
                            .iter()
                            .map(|_| Operand::Var(Var::new(reg as u16, 0))),
                    );
                    let iidx = g.new_inst(y, Opcode::Phi, &ops);
                    g.blocks[y].insts.insert(0, iidx);
                    if in_work.insert(y) {
                        work.push(y);
                    }
                }
            }
        }
    }

    // Rename.
    let mut counters = vec![0u32; nregs];
    let mut stacks = vec![vec![0u32]; nregs];
    let mut walk = vec![Walk::Enter(g.entry)];
    while let Some(w) = walk.pop() {
        match w {
            Walk::Enter(b) => {
                let mut pushed = Vec::new();
                for iidx in g.blocks[b].insts.clone() {
                    let inst = &mut g.insts[iidx];
                    for i in 0..inst.operands.len() {
                        if inst.op != Opcode::Phi && inst.is_read(i) {
                            if let Operand::Var(v) = inst.operands[i] {
                                let top = *stacks[usize::from(v.reg)].last().unwrap_or(&0);
                                inst.operands[i] = Operand::Var(Var::new(v.reg, top));
                            }
                        }
                    }
                    for i in 0..inst.operands.len() {
                        if inst.is_write(i) {
                            if let Operand::Var(v) = inst.operands[i] {
                                let r = usize::from(v.reg);
                                counters[r] += 1;
                                stacks[r].push(counters[r]);
                                pushed.push(v.reg);
                                inst.operands[i] = Operand::Var(Var::new(v.reg, counters[r]));
                            }
                        }
                    }
                }
                for s in g.blocks[b].succs.clone() {
                    let j = match g.blocks[s].preds.iter().position(|p| *p == b) {
                        Some(j) => j + 1,
                        None => continue,
                    };
                    for iidx in g.blocks[s].insts.clone() {
                        let inst = &mut g.insts[iidx];
                        if inst.op != Opcode::Phi {
                            break;
                        }
                        if let Operand::Var(v) = inst.operands[j] {
                            let top = *stacks[usize::from(v.reg)].last().unwrap_or(&0);
                            inst.operands[j] = Operand::Var(Var::new(v.reg, top));
                        }
                    }
                }
                walk.push(Walk::Exit(pushed));
                for c in g.dom.children(b).iter().rev() {
                    walk.push(Walk::Enter(*c));
                }
            }
            Walk::Exit(pushed) => {
                for reg in pushed {
                    stacks[usize::from(reg)].pop();
                }
            }
        }
    }

    g.vars = counters
        .iter()
        .map(|n| vec![VarInfo::default(); *n as usize + 1])
        .collect();
    g.retrack_all();
}

#[cfg(test)]
mod test {
    use crate::{bytecode::Opcode, ir::test::{graph, match_ptn}};

    #[test]
    fn diamond_gets_phi() {
        let g = graph(
            "
              param_rp_i r0, 0
              if_i r0, @a
              const_i64 r1, 1
              goto @b
            a:
              const_i64 r1, 2
            b:
              return_i r1
            ",
        );
        match_ptn(
            &g.to_string(),
            "
            block b0: -> [b1]
            block b1: <- [b0] -> [b3, b2]
              param_rp_i r0(1), 0
              if_i r0(1), @b3
            block b2: <- [b1] -> [b4]
              const_i64 r1(1), 1
              goto @b4
            block b3: <- [b1] -> [b4]
              const_i64 r1(2), 2
            block b4: <- [b2, b3]
              PHI r1(3), r1(1), r1(2)
              return_i r1(3)
            ",
        );
        let ret = g.insts_with_op(Opcode::ReturnI)[0];
        assert!(g.dom.dominates(g.inst(ret).block, g.inst(ret).block));
        assert!(!g.dom.has_back_edge(&g.blocks));
    }

    #[test]
    fn loop_detected() {
        let g = graph(
            "
              const_i64 r0, 0
            top:
              const_i64 r1, 1
              add_i r0, r0, r1
              lt_i r2, r0, r1
              if_i r2, @top
              return_i r0
            ",
        );
        assert!(g.dom.has_back_edge(&g.blocks));
        match_ptn(
            &g.to_string(),
            "
            ...
            block b2: <- [b1, b2] -> [b2, b3]
              ...
              PHI r0(2), r0(1), r0(3)
              const_i64 r1(2), 1
              add_i r0(3), r0(2), r1(2)
            ...
            ",
        );
    }
}
