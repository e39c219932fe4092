//! Building a [Graph] from bytecode.

use super::{ssa, Block, BlockAnn, BlockIdx, Dominance, Graph, InstAnn, Operand, Var};
use crate::{
    bytecode::{Bytecode, DecodedInst, RawOperand},
    candidate::CallTargetId,
    deopt::DeoptKind,
    errors::SpeshError,
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

impl Graph {
    /// Build a versioned graph from `bc`. Blocks are split at branch targets, after branches and
    /// returns, and at handler boundaries. A synthetic, empty entry block precedes the block at
    /// offset 0.
    pub fn from_bytecode(call_target: CallTargetId, bc: &Bytecode) -> Result<Self, SpeshError> {
        let decoded = bc.decode()?;
        let starts = decoded.iter().map(|x| x.offset).collect::<BTreeSet<_>>();
        let end = bc.code.len() as u32;
        let check_target = |at: u32, target: u32| {
            if starts.contains(&target) || target == end {
                Ok(())
            } else {
                Err(SpeshError::InvalidBytecode {
                    offset: at,
                    msg: format!("{target} is not an instruction boundary"),
                })
            }
        };

        let mut leaders = BTreeSet::new();
        if !decoded.is_empty() {
            leaders.insert(0);
        }
        for inst in &decoded {
            for x in &inst.operands {
                if let RawOperand::Label(t) = x {
                    check_target(inst.offset, *t)?;
                    leaders.insert(*t);
                }
            }
            if inst.op.is_branch() || inst.op.ends_block() {
                leaders.insert(inst.next_offset());
            }
        }
        for h in &bc.handlers {
            for x in [h.start, h.end, h.goto] {
                check_target(x, x)?;
                leaders.insert(x);
            }
        }
        leaders.remove(&end);

        let mut blocks = IndexVec::<BlockIdx, Block>::new();
        let entry = blocks.push(Block::default());
        let mut block_at = BTreeMap::new();
        for l in &leaders {
            block_at.insert(
                *l,
                blocks.push(Block {
                    generic_offset: Some(*l),
                    ..Block::default()
                }),
            );
        }

        let mut g = Graph {
            call_target,
            blocks,
            order: Vec::new(),
            insts: IndexVec::new(),
            entry,
            vars: Vec::new(),
            local_kinds: bc.local_kinds.clone(),
            generic_locals: bc.local_kinds.len(),
            lexical_names: bc.lexical_names.to_vec(),
            strings: bc.strings.clone(),
            callsites: bc.callsites.clone(),
            handlers: bc.handlers.clone(),
            spesh_slots: Vec::new(),
            inlines: Vec::new(),
            materializations: Vec::new(),
            dom: Dominance::default(),
        };

        // Instructions.
        let mut cur = entry;
        for inst in &decoded {
            if let Some(b) = block_at.get(&inst.offset) {
                cur = *b;
            }
            let iidx = g.lower_inst(cur, inst, &block_at)?;
            g.blocks[cur].insts.push(iidx);
        }

        // Edges.
        let first = block_at.values().next().copied();
        if let Some(first) = first {
            g.add_edge(entry, first);
        }
        let linear = block_at.values().copied().collect::<Vec<_>>();
        for (i, b) in linear.iter().enumerate() {
            let last = g.blocks[*b].insts.last().map(|x| g.insts[*x].clone());
            let falls_through = match &last {
                Some(inst) => {
                    if inst.op.is_branch() {
                        if let Some(Operand::Block(t)) = inst.operands.last() {
                            g.add_edge(*b, *t);
                        }
                    }
                    !inst.op.ends_block()
                }
                None => true,
            };
            if falls_through {
                if let Some(next) = linear.get(i + 1) {
                    g.add_edge(*b, *next);
                }
            }
        }
        // Any instruction in a handler's region may transfer control to its goto.
        for h in &bc.handlers {
            let Some(goto) = block_at.get(&h.goto).copied() else {
                continue;
            };
            for (_, b) in block_at.range(h.start..h.end) {
                g.add_edge(*b, goto);
            }
        }

        // Drop unreachable blocks.
        let dom = Dominance::compute(&g.blocks, entry);
        let mut order = vec![entry];
        for b in linear {
            if dom.is_reachable(b) {
                order.push(b);
            } else {
                for iidx in std::mem::take(&mut g.blocks[b].insts) {
                    g.insts[iidx].deleted = true;
                }
                for s in std::mem::take(&mut g.blocks[b].succs) {
                    g.blocks[s].preds.retain(|p| *p != b);
                }
            }
        }
        g.order = order;

        // Handler boundaries. A handler whose region or goto is entirely unreachable is dropped.
        let mut handlers = Vec::new();
        for h in std::mem::take(&mut g.handlers) {
            let region = block_at
                .range(h.start..h.end)
                .map(|(_, b)| *b)
                .filter(|b| dom.is_reachable(*b))
                .collect::<Vec<_>>();
            let goto = block_at.get(&h.goto).copied();
            match (region.first(), region.last(), goto) {
                (Some(s), Some(e), Some(goto)) if dom.is_reachable(goto) => {
                    let hidx = handlers.len();
                    g.blocks[*s].anns.push(BlockAnn::HandlerStart(hidx));
                    g.blocks[*e].anns.push(BlockAnn::HandlerEnd(hidx));
                    g.blocks[goto].anns.push(BlockAnn::HandlerGoto(hidx));
                    handlers.push(h);
                }
                _ => (),
            }
        }
        g.handlers = handlers;

        ssa::construct(&mut g);
        g.mark_deopt_usages();
        Ok(g)
    }

    fn lower_inst(
        &mut self,
        block: BlockIdx,
        inst: &DecodedInst,
        block_at: &BTreeMap<u32, BlockIdx>,
    ) -> Result<super::InstIdx, SpeshError> {
        let mut operands = SmallVec::<[Operand; 4]>::new();
        for x in &inst.operands {
            operands.push(match *x {
                RawOperand::Reg(r) => {
                    if usize::from(r) >= self.local_kinds.len() {
                        return Err(SpeshError::InvalidBytecode {
                            offset: inst.offset,
                            msg: format!("register r{r} out of range"),
                        });
                    }
                    Operand::Var(Var::new(r, 0))
                }
                RawOperand::Lex { idx, outers } => Operand::Lex { idx, outers },
                RawOperand::I16(v) => Operand::I16(v),
                RawOperand::I64(v) => Operand::I64(v),
                RawOperand::N64(v) => Operand::N64(v),
                RawOperand::Str(v) => Operand::Str(v),
                RawOperand::Type(v) => Operand::Type(v),
                RawOperand::U32(v) => Operand::U32(v),
                RawOperand::Label(t) => match block_at.get(&t) {
                    Some(b) => Operand::Block(*b),
                    None => {
                        return Err(SpeshError::InvalidBytecode {
                            offset: inst.offset,
                            msg: format!("branch to end of bytecode ({t})"),
                        })
                    }
                },
                RawOperand::Callsite(v) => Operand::Callsite(v),
                RawOperand::Slot(v) => Operand::Slot(v),
            });
        }
        let iidx = self.new_inst(block, inst.op, &operands);
        self.insts[iidx].generic_offset = Some(inst.offset);
        if inst.op.invokes() {
            // On return, generic code resumes after the invoking instruction.
            self.insts[iidx].anns.push(InstAnn::Deopt {
                kind: DeoptKind::All,
                generic: inst.next_offset(),
            });
        }
        Ok(iidx)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        bytecode::{text::assemble, Opcode},
        candidate::CallTargetId,
        errors::SpeshError,
        ir::{test::{graph, match_ptn}, BlockAnn, Graph},
    };

    #[test]
    fn handlers_and_unreachable_code() {
        let g = graph(
            "
            .handler @s @e @h 1
              const_i64 r0, 1
            s:
              decont r1, r2
            e:
              return_o r1
              const_i64 r0, 2
            h:
              return_o r2
            ",
        );
        match_ptn(
            &g.to_string(),
            "
            block b0: -> [b1]
            block b1: <- [b0] -> [b2]
              const_i64 r0(1), 1
            block b2: <- [b1] -> [b3, b5] [handler-start 0] [handler-end 0]
              decont r1(1), r2(0)
            block b3: <- [b2]
              return_o r1(1)
            block b5: <- [b2] [handler-goto 0]
              return_o r2(0)
            ",
        );
        assert_eq!(g.handlers.len(), 1);
        assert!(g.block(g.order()[2]).anns.contains(&BlockAnn::HandlerStart(0)));
    }

    #[test]
    fn dispatch_gets_deopt_all() {
        let g = graph(
            "
            .callsite obj
              param_rp_o r0, 0
              arg_o 0, r0
              dispatch_o r1, cs0, \"call\"
              return_o r1
            ",
        );
        match_ptn(
            &g.to_string(),
            "
            ...
              dispatch_o r1(1), cs0, \"call\" [deopt-all 22]
            ...
            ",
        );
        assert_eq!(g.count_op(Opcode::DispatchO), 1);
        // The parameter is live across the dispatch.
        assert!(g.var(crate::ir::Var::new(0, 1)).deopt_required);
        assert!(!g.var(crate::ir::Var::new(1, 1)).deopt_required);
    }

    #[test]
    fn bad_label() {
        let mut bc = assemble("goto @a\na:\nreturn_o r0").unwrap();
        let mut code = bc.code.to_vec();
        code[2] = 3;
        bc.code = code.into_boxed_slice();
        assert!(matches!(
            Graph::from_bytecode(CallTargetId(0), &bc),
            Err(SpeshError::InvalidBytecode { offset: 0, .. })
        ));
    }
}
