//! Turning a [Graph] back into bytecode.
//!
//! Blocks are emitted in [Graph::order] and a block that does not end in an unconditional control
//! transfer falls through to the next block in that order. Branch targets are written as
//! placeholders and patched once every block's offset is known. `PHI`s are never emitted: all
//! versions of a register share that register.

use crate::{
    bytecode::{Handler, Opcode, RawOperand, Writer},
    candidate::{CandidateBody, InlineRecord},
    deopt::DeoptPoint,
    errors::{HandlerOffset, SpeshError},
    ir::{BlockAnn, BlockIdx, Graph, InstAnn, Operand},
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::sync::Arc;

/// Generate the bytecode for `g`.
pub(crate) fn generate(g: &Graph) -> Result<CandidateBody, SpeshError> {
    let mut w = Writer::new();
    let mut block_offs = IndexVec::<BlockIdx, Option<u32>>::from_vec(vec![None; g.blocks.len()]);
    // (offset of the placeholder, target block).
    let mut fixups = Vec::new();
    let mut handler_offs = vec![[None; 3]; g.handlers.len()];
    let mut inline_offs = vec![(None, None); g.inlines.len()];
    let mut deopts = Vec::new();

    for bidx in &g.order {
        let b = &g.blocks[*bidx];
        block_offs[*bidx] = Some(w.pos());
        for ann in &b.anns {
            match ann {
                BlockAnn::HandlerStart(h) => handler_offs[*h][0] = Some(w.pos()),
                BlockAnn::HandlerGoto(h) => handler_offs[*h][2] = Some(w.pos()),
                BlockAnn::InlineStart(i) => inline_offs[*i].0 = Some(w.pos()),
                BlockAnn::HandlerEnd(_) | BlockAnn::InlineEnd(_) => (),
            }
        }
        for iidx in &b.insts {
            let inst = &g.insts[*iidx];
            if inst.op == Opcode::Phi {
                continue;
            }
            w.op(inst.op);
            for x in &inst.operands {
                let raw = match *x {
                    Operand::Var(v) => RawOperand::Reg(v.reg),
                    Operand::Lex { idx, outers } => RawOperand::Lex { idx, outers },
                    Operand::I16(v) => RawOperand::I16(v),
                    Operand::I64(v) => RawOperand::I64(v),
                    Operand::N64(v) => RawOperand::N64(v),
                    Operand::Str(v) => RawOperand::Str(v),
                    Operand::Type(v) => RawOperand::Type(v),
                    Operand::U32(v) => RawOperand::U32(v),
                    Operand::Block(t) => {
                        fixups.push((w.pos(), t));
                        RawOperand::Label(0)
                    }
                    Operand::Callsite(v) => RawOperand::Callsite(v),
                    Operand::Slot(v) => RawOperand::Slot(v),
                };
                w.operand(raw);
            }
            let materializations = inst
                .anns
                .iter()
                .filter_map(|x| match x {
                    InstAnn::Materialize(m) => Some(*m),
                    InstAnn::Deopt { .. } => None,
                })
                .collect::<SmallVec<[usize; 1]>>();
            for ann in &inst.anns {
                if let InstAnn::Deopt { kind, generic } = ann {
                    let mut dp = DeoptPoint::new(w.pos(), *generic, *kind);
                    dp.materializations = materializations.clone();
                    deopts.push(dp);
                }
            }
        }
        for ann in &b.anns {
            match ann {
                BlockAnn::HandlerEnd(h) => handler_offs[*h][1] = Some(w.pos()),
                BlockAnn::InlineEnd(i) => inline_offs[*i].1 = Some(w.pos()),
                _ => (),
            }
        }
    }

    for (at, t) in fixups {
        let off = block_offs[t].ok_or(SpeshError::UnresolvedLabel {
            call_target: g.call_target,
            block: t,
        })?;
        w.patch_u32(at, off);
    }

    let mut handlers = Vec::with_capacity(g.handlers.len());
    for (i, (h, offs)) in g.handlers.iter().zip(handler_offs).enumerate() {
        let resolve = |x: Option<u32>, which| {
            x.ok_or(SpeshError::UnresolvedHandler {
                call_target: g.call_target,
                handler: i,
                which,
            })
        };
        handlers.push(Handler {
            start: resolve(offs[0], HandlerOffset::Start)?,
            end: resolve(offs[1], HandlerOffset::End)?,
            goto: resolve(offs[2], HandlerOffset::Goto)?,
            category: h.category,
        });
    }

    let mut inlines = Vec::with_capacity(g.inlines.len());
    for (i, (inl, offs)) in g.inlines.iter().zip(inline_offs).enumerate() {
        let (Some(start), Some(end)) = offs else {
            return Err(SpeshError::Internal(format!(
                "inline {i} of call target {} has no emitted boundary",
                g.call_target
            )));
        };
        inlines.push(InlineRecord {
            call_target: inl.call_target.clone(),
            name: Arc::clone(&inl.name),
            lexical_names: Arc::clone(&inl.lexical_names),
            locals_start: inl.locals_start,
            lexicals_start: inl.lexicals_start,
            start,
            end,
        });
    }

    deopts.sort_by_key(|x: &DeoptPoint| x.specialized);

    Ok(CandidateBody {
        code: w.into_inner().into_boxed_slice(),
        handlers,
        deopts,
        spesh_slots: g.spesh_slots.clone(),
        inlines,
        materializations: g.materializations.clone(),
        local_kinds: g.local_kinds.clone(),
        lexical_names: Arc::from(g.lexical_names.clone()),
        strings: g.strings.clone(),
        callsites: g.callsites.clone(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::text::{assemble, disassemble},
        candidate::CallTargetId,
        deopt::DeoptKind,
        ir::{test::graph, Var},
    };

    #[test]
    fn unchanged_graph_roundtrips() {
        let src = "
            .handler @s @e @h 3
              param_rp_o r0, 0
              const_i64 r1, 0
            top:
              if_i r1, @out
            s:
              decont r2, r0
              add_i r1, r1, r1
            e:
              goto @top
            out:
              return_o r0
            h:
              return_o r2
            ";
        let bc = assemble(src).unwrap();
        let g = Graph::from_bytecode(CallTargetId(0), &bc).unwrap();
        assert!(g.count_op(Opcode::Phi) > 0);
        let body = generate(&g).unwrap();
        assert_eq!(
            disassemble(&body.code, &body.strings).unwrap(),
            disassemble(&bc.code, &bc.strings).unwrap()
        );
        assert_eq!(body.code, bc.code);
        assert_eq!(body.handlers, bc.handlers);
        assert!(body.deopts.is_empty());
        assert_eq!(generate(&g).unwrap().code, body.code);
    }

    #[test]
    fn deopt_points_follow_their_instruction() {
        let mut g = graph(
            "
            .callsite obj
              param_rp_o r0, 0
              arg_o 0, r0
              dispatch_o r1, cs0, \"m\"
              return_o r1
            ",
        );
        let param = g.insts_with_op(Opcode::ParamRpO)[0];
        let new = g.new_version(0);
        let guard = g.insert_after(
            param,
            Opcode::SpGuardConc,
            &[Operand::Var(new), Operand::Var(Var::new(0, 1))],
        );
        g.add_deopt(guard, DeoptKind::One, 6);
        let body = generate(&g).unwrap();
        // param_rp_o (6) + sp_guardconc (6); arg_o (6) + dispatch_o (10).
        assert_eq!(
            body.deopts,
            vec![
                DeoptPoint::new(12, 6, DeoptKind::One),
                DeoptPoint::new(28, 22, DeoptKind::All)
            ]
        );
        assert_eq!(body.deopt_point(28, DeoptKind::All).map(|x| x.generic), Some(22));
    }

    #[test]
    fn unresolved_label() {
        let mut g = graph(
            "
              const_i64 r0, 1
              if_i r0, @l
            l:
              return_o r0
            ",
        );
        // Drop the branch target from the emission order.
        let last = g.order.pop().unwrap();
        match generate(&g) {
            Err(SpeshError::UnresolvedLabel { block, .. }) => assert_eq!(block, last),
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn unresolved_handler() {
        let mut g = graph(
            "
            .handler @s @e @h 1
            s:
              const_i64 r0, 1
            e:
              return_o r0
            h:
              return_o r0
            ",
        );
        let goto = g.order.pop().unwrap();
        g.blocks[goto].anns.clear();
        match generate(&g) {
            Err(SpeshError::UnresolvedHandler {
                handler: 0, which, ..
            }) => assert_eq!(which, HandlerOffset::Goto),
            x => panic!("{x:?}"),
        }
    }
}
