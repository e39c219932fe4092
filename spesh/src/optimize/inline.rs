//! Inlining of small leaf callees at direct invocation sites.
//!
//! Only `sp_fastinvoke_o`s are candidates: their callee is known. The callee's generic bytecode is
//! built into a graph of its own, renumbered into fresh registers, lexicals, and strings of the
//! caller, and spliced in between the invocation's block and a new continuation block. Parameter
//! reads become copies of the arguments and the single return becomes a copy into the
//! invocation's result register. The inlined region is recorded so that deoptimization and frame
//! walking can reconstruct the callee's frame.

use super::Opt;
use crate::{
    bytecode::{Opcode, RawOperand},
    candidate::{CallTarget, SpeshSlot},
    ir::{BlockAnn, BlockIdx, Graph, GraphInline, InstIdx, Operand, Var},
    log::Verbosity,
};
use std::{collections::HashMap, sync::Arc};

struct InlinePlan {
    callee: Arc<CallTarget>,
    cg: Graph,
    /// Argument index to the caller's var holding it.
    args: HashMap<u16, Var>,
}

/// Inline every eligible `sp_fastinvoke_o` in `g`, returning how many were inlined.
pub(crate) fn inline_calls(opt: &Opt, g: &mut Graph) -> usize {
    let mut n = 0;
    for call in g.insts_with_op(Opcode::SpFastInvokeO) {
        match plan_inline(opt, g, call) {
            Ok(p) => {
                splice(g, call, p);
                n += 1;
            }
            Err(reason) => opt.ctx.log.log(
                Verbosity::OptEvent,
                &format!("not inlining into '{}': {reason}", opt.target.name()),
            ),
        }
    }
    if n > 0 {
        g.recompute_dominance();
    }
    n
}

/// Is `b` inside any handler's protected region?
fn in_handler_region(g: &Graph, b: BlockIdx) -> bool {
    let mut open = 0usize;
    for x in &g.order {
        let anns = &g.blocks[*x].anns;
        open += anns
            .iter()
            .filter(|a| matches!(a, BlockAnn::HandlerStart(_)))
            .count();
        if *x == b {
            return open > 0;
        }
        let ends = anns
            .iter()
            .filter(|a| matches!(a, BlockAnn::HandlerEnd(_)))
            .count();
        open = open.saturating_sub(ends);
    }
    false
}

fn plan_inline(opt: &Opt, g: &Graph, call: InstIdx) -> Result<InlinePlan, String> {
    let inst = g.inst(call);
    let (cs, slot) = match inst.operands.as_slice() {
        [_, Operand::Callsite(cs), Operand::Slot(slot)] => (*cs, *slot),
        _ => return Err("malformed invocation".into()),
    };
    let callee = match g.spesh_slots.get(usize::from(slot)) {
        Some(SpeshSlot::CallTarget(w)) => w.upgrade().ok_or("the callee has gone")?,
        _ => return Err("invocation target is not a call target".into()),
    };
    let name = callee.name();
    let shape = g
        .callsites
        .get(usize::from(cs))
        .ok_or("unknown callsite")?;
    if !shape.named.is_empty() {
        return Err(format!("'{name}' is called with named arguments"));
    }
    let bc = callee.bytecode();
    if bc.len() > opt.ctx.config().max_inline_size {
        return Err(format!("'{name}' is too large ({} bytes)", bc.len()));
    }
    if !bc.handlers.is_empty() {
        return Err(format!("'{name}' has exception handlers"));
    }
    let decoded = bc.decode().map_err(|e| e.to_string())?;
    if decoded.iter().any(|x| x.op.invokes()) {
        return Err(format!("'{name}' is not a leaf"));
    }
    if decoded.iter().any(|x| {
        x.operands
            .iter()
            .any(|o| matches!(o, RawOperand::Lex { outers, .. } if *outers > 0))
    }) {
        return Err(format!("'{name}' reads outer lexicals"));
    }
    let returns = decoded
        .iter()
        .filter(|x| matches!(x.op, Opcode::ReturnO | Opcode::ReturnI))
        .collect::<Vec<_>>();
    if returns.len() != 1 || returns[0].op != Opcode::ReturnO {
        return Err(format!("'{name}' does not have exactly one object return"));
    }
    if in_handler_region(g, inst.block) {
        return Err("the invocation is inside a handler region".into());
    }

    let mut args = HashMap::new();
    for i in 0..shape.num_args() {
        let i = u16::try_from(i).map_err(|e| e.to_string())?;
        let v = g
            .call_arg(call, i)
            .ok_or_else(|| format!("argument {i} of '{name}' is not set up"))?;
        args.insert(i, v);
    }
    let mut arg_types = Vec::with_capacity(args.len());
    for i in 0..shape.num_args() {
        let f = u16::try_from(i).ok().and_then(|i| args.get(&i)).map(|v| g.facts(*v));
        arg_types.push(f.and_then(|f| match (f.ty, f.concrete) {
            (Some(ty), Some(concrete)) => Some(crate::callsite::ObservedType { ty, concrete }),
            _ => None,
        }));
    }
    if !callee
        .candidates()
        .any(|c| c.is_optimized() && c.accepts(shape, &arg_types))
    {
        return Err(format!("'{name}' has no optimized candidate for these arguments"));
    }
    if g.local_kinds.len() + bc.local_kinds.len() > usize::from(u16::MAX) {
        return Err(format!("inlining '{name}' would exceed the register limit"));
    }

    let cg = Graph::from_bytecode(callee.id(), bc).map_err(|e| e.to_string())?;
    for p in cg
        .insts_in_order()
        .into_iter()
        .filter(|x| matches!(cg.inst(*x).op, Opcode::ParamRpO | Opcode::ParamRpI))
    {
        match cg.inst(p).operands.get(1) {
            Some(Operand::I16(i)) if u16::try_from(*i).is_ok_and(|i| args.contains_key(&i)) => (),
            _ => return Err(format!("'{name}' reads a parameter that is not passed")),
        }
    }
    Ok(InlinePlan { callee, cg, args })
}

/// Splice the callee graph of `plan` into `g` in place of `call`.
fn splice(g: &mut Graph, call: InstIdx, plan: InlinePlan) {
    let InlinePlan { callee, cg, args } = plan;

    // Give the callee a window of fresh registers, with every version it uses.
    let locals_start = g.local_kinds.len() as u16;
    for (r, k) in cg.local_kinds.iter().enumerate() {
        let reg = g.add_local(*k);
        for _ in 1..cg.num_versions(r as u16) {
            g.new_version(reg);
        }
    }
    let lexicals_start = g.lexical_names.len() as u16;
    g.lexical_names.extend(cg.lexical_names.iter().cloned());
    let strings_start = g.strings.len() as u32;
    g.strings.extend(cg.strings.iter().cloned());
    let callsites_start = g.callsites.len() as u16;
    g.callsites.extend(cg.callsites.iter().cloned());

    let result = g.inst(call).operands[0];
    let caller_block = g.inst(call).block;
    let arg_insts = g.call_args(call);
    let cont = g.split_after(call);
    for a in arg_insts {
        g.delete_inst(a);
    }
    g.delete_inst(call);

    let callee_blocks = cg
        .order
        .iter()
        .copied()
        .filter(|b| *b != cg.entry)
        .collect::<Vec<_>>();
    let bmap = callee_blocks
        .iter()
        .map(|b| (*b, g.add_block()))
        .collect::<HashMap<_, _>>();
    let map_block = |b: BlockIdx| {
        if b == cg.entry {
            caller_block
        } else {
            bmap[&b]
        }
    };
    if let Some(pos) = g.order.iter().position(|x| *x == caller_block) {
        for (i, b) in callee_blocks.iter().enumerate() {
            g.order.insert(pos + 1 + i, bmap[b]);
        }
    }

    let remap = |x: Operand| match x {
        Operand::Var(v) => Operand::Var(Var::new(v.reg + locals_start, v.version)),
        Operand::Lex { idx, outers } => Operand::Lex {
            idx: idx + lexicals_start,
            outers,
        },
        Operand::Str(i) => Operand::Str(i + strings_start),
        Operand::Block(b) => Operand::Block(map_block(b)),
        Operand::Callsite(c) => Operand::Callsite(c + callsites_start),
        x => x,
    };

    let mut ret_block = None;
    for (i, cb) in callee_blocks.iter().enumerate() {
        let nb = bmap[cb];
        g.blocks[nb].preds = cg.blocks[*cb].preds.iter().map(|p| map_block(*p)).collect();
        g.blocks[nb].succs = cg.blocks[*cb].succs.iter().map(|s| map_block(*s)).collect();
        for ci in &cg.blocks[*cb].insts {
            let mut inst = cg.inst(*ci).clone();
            inst.generic_offset = None;
            inst.anns.clear();
            for x in inst.operands.iter_mut() {
                *x = remap(*x);
            }
            match inst.op {
                Opcode::CheckArity => continue,
                Opcode::ParamRpO | Opcode::ParamRpI => {
                    let arg = match inst.operands.get(1) {
                        Some(Operand::I16(i)) => u16::try_from(*i).ok().and_then(|i| args.get(&i)),
                        _ => None,
                    };
                    if let Some(arg) = arg {
                        inst.op = Opcode::Set;
                        inst.operands[1] = Operand::Var(*arg);
                    }
                }
                Opcode::ReturnO => {
                    inst.op = Opcode::Set;
                    let v = inst.operands[0];
                    inst.operands = [result, v].into_iter().collect();
                    g.push_inst(nb, inst);
                    if i + 1 != callee_blocks.len() {
                        g.append(nb, Opcode::Goto, &[Operand::Block(cont)]);
                    }
                    ret_block = Some(nb);
                    continue;
                }
                _ => (),
            }
            g.push_inst(nb, inst);
        }
    }

    if let (Some(first), Some(last)) = (callee_blocks.first(), callee_blocks.last()) {
        let (first, last) = (bmap[first], bmap[last]);
        g.blocks[caller_block].succs.push(first);
        if let Some(rb) = ret_block {
            g.blocks[rb].succs.push(cont);
            g.blocks[cont].preds = [rb].into_iter().collect();
        }
        let k = g.inlines.len();
        g.blocks[first].anns.push(BlockAnn::InlineStart(k));
        g.blocks[last].anns.push(BlockAnn::InlineEnd(k));
        g.inlines.push(GraphInline {
            call_target: Arc::downgrade(&callee),
            name: Arc::from(callee.name()),
            lexical_names: Arc::clone(&callee.bytecode().lexical_names),
            locals_start,
            lexicals_start,
        });
    }
}
