//! Partial escape analysis and scalar replacement.
//!
//! [analyse] walks the graph once, in dominator order, tracking every `sp_fastcreate` whose field
//! layout can be held in registers. It records the rewrites that would replace the allocation by
//! one register per field, and marks an allocation irreplaceable as soon as any use of it cannot
//! be expressed that way. [apply] then performs the rewrites of the allocations that survived.
//!
//! A replaced allocation that is still live at a deopt point is recorded as a
//! [Materialization]: if that deopt happens, the object is recreated from its field registers
//! before generic code resumes.
//!
//! Control flow with a loop is not analysed.

use super::Opt;
use crate::{
    bytecode::{Opcode, RegKind},
    callsite::TypeId,
    deopt::Materialization,
    ir::{Facts, Graph, InstAnn, InstIdx, Operand, Var},
    log::{stats::Counter, Verbosity},
    value::{FieldKind, FieldLayout, ObjectModel, FIELD_SLOT_SIZE},
};
use smallvec::SmallVec;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug)]
struct Allocation {
    inst: InstIdx,
    ty: TypeId,
    fields: Arc<[FieldLayout]>,
    irreplaceable: bool,
    /// Every var known to hold this allocation, starting with the allocation's own result.
    aliases: Vec<Var>,
    /// Per field, the binds seen so far.
    binds: Vec<Vec<InstIdx>>,
    /// Has a deopt point been crossed since the allocation?
    deopt_seen: bool,
    /// The deopt points at which this allocation must be materialized, each with the generic
    /// registers that hold it there.
    deopts: Vec<(InstIdx, Vec<u16>)>,
}

#[derive(Debug)]
enum Transform {
    /// Delete the allocation itself or a copy of it.
    Delete { alloc: usize, inst: InstIdx },
    /// A field write becomes a write of the field's register.
    BindToSet {
        alloc: usize,
        inst: InstIdx,
        field: usize,
        val: Var,
    },
    /// A field read becomes a read of the version of the field's register written by `bind`.
    GetToSet {
        alloc: usize,
        inst: InstIdx,
        bind: InstIdx,
    },
    /// A guard that the facts of a replaced field already prove becomes a copy.
    GuardToSet { inst: InstIdx },
}

#[derive(Debug)]
pub(crate) struct Analysis {
    allocs: Vec<Allocation>,
    transforms: Vec<Transform>,
}

/// Can a field of this kind be held in a register?
fn is_replaceable_field(k: FieldKind) -> bool {
    !matches!(k, FieldKind::Ref(None))
}

fn reg_kind(k: FieldKind) -> RegKind {
    match k {
        FieldKind::Int => RegKind::Int,
        FieldKind::Num => RegKind::Num,
        FieldKind::Str => RegKind::Str,
        FieldKind::Flattened(_) | FieldKind::Ref(_) => RegKind::Obj,
    }
}

/// The field index addressed by an `sp_get_*`/`sp_bind_*` byte offset.
fn field_index(off: i16, fields: &[FieldLayout]) -> Option<usize> {
    if off < 0 || off % FIELD_SLOT_SIZE != 0 {
        return None;
    }
    let i = usize::try_from(off / FIELD_SLOT_SIZE).ok()?;
    (i < fields.len()).then_some(i)
}

/// The generic registers whose current version is one of `aliases` when `at` deoptimizes.
fn live_targets(g: &Graph, aliases: &[Var], at: InstIdx) -> Vec<u16> {
    let mut regs = aliases
        .iter()
        .map(|v| v.reg)
        .filter(|r| usize::from(*r) < g.generic_locals)
        .collect::<Vec<_>>();
    regs.sort_unstable();
    regs.dedup();
    regs.retain(|r| aliases.contains(&g.reaching_version(*r, at)));
    regs
}

/// Work out which allocations in `g` can be replaced. Returns `None` if `g` has a loop.
pub(crate) fn analyse(g: &Graph, model: &dyn ObjectModel) -> Option<Analysis> {
    if g.dom.has_back_edge(&g.blocks) {
        return None;
    }
    let mut allocs: Vec<Allocation> = Vec::new();
    let mut transforms = Vec::new();
    let mut tracked: HashMap<Var, usize> = HashMap::new();
    // The facts of vars read from replaced fields.
    let mut shadow: HashMap<Var, Facts> = HashMap::new();

    for b in g.dom.rpo() {
        for iidx in &g.blocks[*b].insts {
            let iidx = *iidx;
            let inst = g.inst(iidx);
            // Operand positions accounted for by the cases below.
            let mut handled = SmallVec::<[usize; 2]>::new();
            match (inst.op, inst.operands.as_slice()) {
                (Opcode::SpFastCreate, [Operand::Var(w), _, Operand::Type(ty)]) => {
                    if let Some(fields) = model.field_layout(*ty) {
                        if fields.iter().all(|f| is_replaceable_field(f.kind)) {
                            let id = allocs.len();
                            allocs.push(Allocation {
                                inst: iidx,
                                ty: *ty,
                                binds: vec![Vec::new(); fields.len()],
                                fields,
                                irreplaceable: false,
                                aliases: vec![*w],
                                deopt_seen: false,
                                deopts: Vec::new(),
                            });
                            tracked.insert(*w, id);
                            transforms.push(Transform::Delete { alloc: id, inst: iidx });
                        }
                    }
                }
                (Opcode::Set, [Operand::Var(w), Operand::Var(src)]) => {
                    if let Some(a) = tracked.get(src).copied() {
                        tracked.insert(*w, a);
                        allocs[a].aliases.push(*w);
                        transforms.push(Transform::Delete { alloc: a, inst: iidx });
                        handled.push(1);
                    } else if let Some(f) = shadow.get(src).cloned() {
                        shadow.insert(*w, f);
                    }
                }
                (
                    Opcode::SpBindO | Opcode::SpBindI | Opcode::SpBindN,
                    [Operand::Var(obj), Operand::I16(off), Operand::Var(val)],
                ) => {
                    if let Some(a) = tracked.get(obj).copied() {
                        handled.push(0);
                        match field_index(*off, &allocs[a].fields) {
                            Some(field) if !allocs[a].deopt_seen => {
                                allocs[a].binds[field].push(iidx);
                                transforms.push(Transform::BindToSet {
                                    alloc: a,
                                    inst: iidx,
                                    field,
                                    val: *val,
                                });
                            }
                            _ => allocs[a].irreplaceable = true,
                        }
                    }
                }
                (
                    Opcode::SpGetO | Opcode::SpGetI | Opcode::SpGetN,
                    [Operand::Var(w), Operand::Var(obj), Operand::I16(off)],
                ) => {
                    if let Some(a) = tracked.get(obj).copied() {
                        handled.push(1);
                        let alloc = &allocs[a];
                        let reaching = field_index(*off, &alloc.fields).and_then(|field| {
                            let binds = &alloc.binds[field];
                            if binds.iter().all(|x| g.point_dominates(*x, iidx)) {
                                binds.last().copied()
                            } else {
                                None
                            }
                        });
                        match reaching {
                            Some(bind) => {
                                if !alloc.irreplaceable {
                                    if let Some(Operand::Var(val)) = g.inst(bind).operands.get(2) {
                                        shadow.insert(*w, g.facts(*val).clone());
                                    }
                                }
                                transforms.push(Transform::GetToSet {
                                    alloc: a,
                                    inst: iidx,
                                    bind,
                                });
                            }
                            None => allocs[a].irreplaceable = true,
                        }
                    }
                }
                (op, [Operand::Var(w), Operand::Var(src), ..]) if op.is_guard() => {
                    let (ty, lit) = match inst.operands.get(2) {
                        Some(Operand::Type(t)) => (Some(*t), None),
                        Some(Operand::I64(x)) => (None, Some(*x)),
                        _ => (None, None),
                    };
                    if let Some(a) = tracked.get(src).copied() {
                        if Facts::known_type(allocs[a].ty, true).proves_guard(op, ty, lit) {
                            tracked.insert(*w, a);
                            allocs[a].aliases.push(*w);
                            transforms.push(Transform::Delete { alloc: a, inst: iidx });
                            handled.push(1);
                        }
                    } else if let Some(f) = shadow.get(src).cloned() {
                        if f.proves_guard(op, ty, lit) {
                            transforms.push(Transform::GuardToSet { inst: iidx });
                            shadow.insert(*w, f);
                        } else {
                            shadow.insert(*w, f.refined_by_guard(op, ty, lit));
                        }
                    }
                }
                _ => (),
            }

            // Any other use of a tracked value lets it escape.
            for (i, x) in inst.operands.iter().enumerate() {
                if handled.contains(&i) || !inst.is_read(i) {
                    continue;
                }
                if let Some(a) = x.as_var().and_then(|v| tracked.get(&v)) {
                    allocs[*a].irreplaceable = true;
                }
            }

            if inst.deopt().is_some() {
                for a in allocs.iter_mut() {
                    a.deopt_seen = true;
                    if a.irreplaceable || !g.point_dominates(a.inst, iidx) {
                        continue;
                    }
                    let targets = live_targets(g, &a.aliases, iidx);
                    if !targets.is_empty() {
                        a.deopts.push((iidx, targets));
                    }
                }
            }
        }
    }
    Some(Analysis { allocs, transforms })
}

/// Perform the rewrites `a` recorded for every replaceable allocation. Returns the number of
/// allocations replaced and the number of guards eliminated.
pub(crate) fn apply(g: &mut Graph, a: Analysis) -> (usize, usize) {
    let Analysis { allocs, transforms } = a;
    let field_regs = allocs
        .iter()
        .map(|a| {
            (!a.irreplaceable).then(|| {
                a.fields
                    .iter()
                    .map(|f| g.add_local(reg_kind(f.kind)))
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();

    let mut bind_vars = HashMap::new();
    let mut deletes = Vec::new();
    let mut guards = 0;
    for t in transforms {
        match t {
            Transform::Delete { alloc, inst } => {
                if field_regs[alloc].is_some() {
                    deletes.push(inst);
                }
            }
            Transform::BindToSet {
                alloc,
                inst,
                field,
                val,
            } => {
                if let Some(regs) = &field_regs[alloc] {
                    let fv = g.new_version(regs[field]);
                    g.rewrite(inst, Opcode::Set, &[Operand::Var(fv), Operand::Var(val)]);
                    let mut f = g.facts(val).clone();
                    f.from_allocation = u32::try_from(alloc).ok();
                    *g.facts_mut(fv) = f;
                    bind_vars.insert(inst, fv);
                }
            }
            Transform::GetToSet { alloc, inst, bind } => {
                if field_regs[alloc].is_some() {
                    let fv = bind_vars.get(&bind).copied();
                    let (Some(fv), Some(w)) = (fv, g.inst(inst).write()) else {
                        continue;
                    };
                    g.rewrite(inst, Opcode::Set, &[Operand::Var(w), Operand::Var(fv)]);
                    let f = g.facts(fv).clone();
                    *g.facts_mut(w) = f;
                }
            }
            Transform::GuardToSet { inst } => {
                let (w, src) = {
                    let i = g.inst(inst);
                    (i.operands[0], i.operands[1])
                };
                g.rewrite(inst, Opcode::Set, &[w, src]);
                guards += 1;
            }
        }
    }

    let mut replaced = 0;
    for (alloc, regs) in allocs.iter().zip(&field_regs) {
        let Some(regs) = regs else {
            continue;
        };
        replaced += 1;
        let deopts = alloc
            .deopts
            .iter()
            .filter(|(d, _)| g.inst(*d).deopt().is_some())
            .collect::<Vec<_>>();
        if deopts.is_empty() {
            continue;
        }
        // Field values must survive until every deopt point that may recreate the object.
        for fv in bind_vars.values() {
            if regs.contains(&fv.reg) {
                g.var_mut(*fv).deopt_required = true;
            }
        }
        // Deopt points where the object is held by the same registers share a materialization.
        let mut shared: HashMap<&[u16], usize> = HashMap::new();
        for (d, targets) in deopts {
            let m = match shared.get(targets.as_slice()) {
                Some(m) => *m,
                None => {
                    g.materializations.push(Materialization {
                        ty: alloc.ty,
                        fields: regs.clone(),
                        targets: targets.clone(),
                    });
                    let m = g.materializations.len() - 1;
                    shared.insert(targets.as_slice(), m);
                    m
                }
            };
            g.insts[*d].anns.push(InstAnn::Materialize(m));
        }
    }

    for d in deletes {
        g.delete_inst(d);
    }
    (replaced, guards)
}

pub(crate) fn run(opt: &Opt, g: &mut Graph) {
    let Some(a) = analyse(g, opt.ctx.model()) else {
        opt.ctx.log.log(
            Verbosity::OptEvent,
            &format!(
                "not running escape analysis on '{}': its control flow has a loop",
                opt.target.name()
            ),
        );
        return;
    };
    let (replaced, guards) = apply(g, a);
    opt.ctx
        .stats
        .count_n(Counter::AllocationsReplaced, replaced as u64);
    opt.ctx
        .stats
        .count_n(Counter::GuardsEliminated, guards as u64);
}
