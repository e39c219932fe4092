//! Facts discovery.
//!
//! Walks the graph in dominator order, propagating what is known about each var and using it to
//! remove guards that are already proven, to replace container operations on values that are
//! known not to be containers, and to turn attribute access on objects of statically known
//! layout into direct field access. Where the logs show one type dominating at an observation
//! point whose result is otherwise unknown, a guard for that type is inserted so later passes can
//! rely on it.

use super::Opt;
use crate::{
    bytecode::Opcode,
    candidate::SpeshSlot,
    deopt::DeoptKind,
    ir::{Facts, Graph, InstIdx, KnownValue, Operand, Var},
    log::stats::Counter,
    value::{FieldKind, StorageKind, Value, FIELD_SLOT_SIZE},
};

pub(crate) fn discover(opt: &Opt, g: &mut Graph) {
    for b in g.dom.rpo().to_vec() {
        for iidx in g.blocks[b].insts.clone() {
            if g.insts[iidx].deleted {
                continue;
            }
            discover_inst(opt, g, iidx);
        }
    }
}

fn guard_lits(operands: &[Operand]) -> (Option<crate::callsite::TypeId>, Option<i64>) {
    match operands.get(2) {
        Some(Operand::Type(t)) => (Some(*t), None),
        Some(Operand::I64(x)) => (None, Some(*x)),
        _ => (None, None),
    }
}

fn discover_inst(opt: &Opt, g: &mut Graph, iidx: InstIdx) {
    let inst = g.inst(iidx).clone();
    let model = opt.ctx.model();
    let Some(w) = inst.write() else {
        match inst.op {
            Opcode::BindAttrO | Opcode::BindAttrI | Opcode::BindAttrN => {
                if let [Operand::Var(obj), Operand::Type(_), Operand::Str(name), Operand::Var(val)] =
                    inst.operands.as_slice()
                {
                    if let Some(off) = field_offset(opt, g, *obj, *name, inst.op) {
                        let op = match inst.op {
                            Opcode::BindAttrO => Opcode::SpBindO,
                            Opcode::BindAttrI => Opcode::SpBindI,
                            _ => Opcode::SpBindN,
                        };
                        g.rewrite(
                            iidx,
                            op,
                            &[Operand::Var(*obj), Operand::I16(off), Operand::Var(*val)],
                        );
                    }
                }
            }
            _ => (),
        }
        return;
    };

    let facts = match (inst.op, inst.operands.as_slice()) {
        (Opcode::ConstI64, [_, Operand::I64(x)]) => Facts::known_value(KnownValue::Int(*x)),
        (Opcode::ConstN64, [_, Operand::N64(x)]) => Facts::known_value(KnownValue::Num(*x)),
        (Opcode::ConstS, [_, Operand::Str(x)]) => Facts::known_value(KnownValue::Str(*x)),
        (Opcode::ConstType, [_, Operand::Type(t)]) => Facts::known_type(*t, false),
        (Opcode::Set, [_, Operand::Var(src)]) => g.facts(*src).clone(),
        (Opcode::Phi, [_, srcs @ ..]) => {
            let mut srcs = srcs.iter().filter_map(|x| x.as_var());
            match srcs.next() {
                Some(first) => {
                    let mut f = g.facts(first).clone();
                    for s in srcs {
                        f = f.meet(g.facts(s));
                    }
                    f
                }
                None => Facts::default(),
            }
        }
        (
            Opcode::SpGuard | Opcode::SpGuardType | Opcode::SpGuardConc | Opcode::SpGuardLitI,
            [_, Operand::Var(src), ..],
        ) => {
            let (ty, lit) = guard_lits(&inst.operands);
            let f = g.facts(*src).clone();
            if f.proves_guard(inst.op, ty, lit) {
                g.rewrite(iidx, Opcode::Set, &[Operand::Var(w), Operand::Var(*src)]);
                opt.ctx.stats.count(Counter::GuardsEliminated);
                f
            } else {
                f.refined_by_guard(inst.op, ty, lit)
            }
        }
        (Opcode::Decont, [_, Operand::Var(src)]) => {
            let f = g.facts(*src).clone();
            match f.ty {
                Some(t) if model.storage_kind(t) != StorageKind::Container => {
                    g.rewrite(iidx, Opcode::Set, &[Operand::Var(w), Operand::Var(*src)]);
                    f
                }
                _ => Facts::default(),
            }
        }
        (Opcode::Create, [_, Operand::Var(src)]) => {
            let f = g.facts(*src);
            match (f.ty, f.concrete) {
                (Some(t), Some(false)) if model.storage_kind(t) == StorageKind::Object => {
                    let size = model
                        .field_layout(t)
                        .and_then(|l| i16::try_from(l.len()).ok())
                        .and_then(|n| n.checked_mul(FIELD_SLOT_SIZE));
                    match size {
                        Some(size) => {
                            g.rewrite(
                                iidx,
                                Opcode::SpFastCreate,
                                &[Operand::Var(w), Operand::I16(size), Operand::Type(t)],
                            );
                            Facts::known_type(t, true)
                        }
                        None => Facts::default(),
                    }
                }
                _ => Facts::default(),
            }
        }
        (Opcode::SpFastCreate, [_, _, Operand::Type(t)]) => Facts::known_type(*t, true),
        (
            Opcode::GetAttrO | Opcode::GetAttrI | Opcode::GetAttrN,
            [_, Operand::Var(obj), Operand::Type(_), Operand::Str(name)],
        ) => {
            if let Some(off) = field_offset(opt, g, *obj, *name, inst.op) {
                let op = match inst.op {
                    Opcode::GetAttrO => Opcode::SpGetO,
                    Opcode::GetAttrI => Opcode::SpGetI,
                    _ => Opcode::SpGetN,
                };
                g.rewrite(
                    iidx,
                    op,
                    &[Operand::Var(w), Operand::Var(*obj), Operand::I16(off)],
                );
            }
            Facts::default()
        }
        (Opcode::SpGetSpeshSlot, [_, Operand::Slot(s)]) => {
            match g.spesh_slots.get(usize::from(*s)) {
                Some(SpeshSlot::Value(Value::Int(x))) => Facts::known_value(KnownValue::Int(*x)),
                Some(SpeshSlot::Value(Value::Num(x))) => Facts::known_value(KnownValue::Num(*x)),
                Some(SpeshSlot::Value(Value::Obj(o))) => Facts::known_type(o.ty, o.concrete),
                _ => Facts::default(),
            }
        }
        _ => Facts::default(),
    };
    if !facts.is_empty() {
        *g.facts_mut(w) = facts;
    }

    if matches!(inst.op, Opcode::Decont | Opcode::GetAttrO) {
        guard_observed(opt, g, iidx, w);
    }
}

/// The byte offset of field `name` of the object in `obj`, if `obj` is known to be an instance
/// of a type whose layout has such a field of the kind `op` accesses.
fn field_offset(opt: &Opt, g: &Graph, obj: Var, name: u32, op: Opcode) -> Option<i16> {
    let f = g.facts(obj);
    if f.concrete != Some(true) {
        return None;
    }
    let layout = opt.ctx.model().field_layout(f.ty?)?;
    let name = g.strings.get(usize::try_from(name).ok()?)?;
    let idx = layout.iter().position(|x| x.name == *name)?;
    let ok = match (op, layout[idx].kind) {
        (Opcode::GetAttrI | Opcode::BindAttrI, FieldKind::Int) => true,
        (Opcode::GetAttrN | Opcode::BindAttrN, FieldKind::Num) => true,
        (
            Opcode::GetAttrO | Opcode::BindAttrO,
            FieldKind::Str | FieldKind::Flattened(_) | FieldKind::Ref(_),
        ) => true,
        _ => false,
    };
    if !ok {
        return None;
    }
    i16::try_from(idx).ok()?.checked_mul(FIELD_SLOT_SIZE)
}

/// If the logs show a dominant type for the result `w` of the observation point `iidx`, and
/// nothing else is known about it, guard on that type.
fn guard_observed(opt: &Opt, g: &mut Graph, iidx: InstIdx, w: Var) {
    let inst = g.inst(iidx);
    let (Some(off), Some(resume)) = (inst.generic_offset, inst.generic_next_offset()) else {
        return;
    };
    if g.facts(w).ty.is_some()
        || g.var(w).users.iter().any(|u| g.inst(*u).op.is_guard())
    {
        return;
    }
    let Some(ot) = opt
        .stats
        .by_offset
        .get(&off)
        .and_then(|s| s.dominant_type(opt.ctx.config().mono_dispatch_percent))
    else {
        return;
    };
    let op = if ot.concrete {
        Opcode::SpGuard
    } else {
        Opcode::SpGuardType
    };
    let new = g.new_version(w.reg);
    let guard = g.insert_after(
        iidx,
        op,
        &[Operand::Var(new), Operand::Var(w), Operand::Type(ot.ty)],
    );
    g.add_deopt(guard, DeoptKind::One, resume);
    g.refine_uses(guard, w, new);
    *g.facts_mut(new) = Facts::from_observed(ot);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        callsite::{ObservedType, TypeId},
        config::SpeshConfig,
        ir::test::match_ptn,
        optimize::test::{graph_of, setup},
        stats::LogEntry,
        value::TypeRegistry,
    };

    fn model() -> TypeRegistry {
        TypeRegistry::new()
            .with_object(
                TypeId(5),
                &[("a", FieldKind::Int), ("o", FieldKind::Ref(None))],
            )
            .with_opaque(TypeId(6), StorageKind::BoxedInt)
    }

    #[test]
    fn constants_and_merges() {
        let (ctx, t) = setup(
            SpeshConfig::default(),
            model(),
            "
              const_i64 r0, 1
              if_i r0, @l
              const_i64 r1, 2
              goto @m
            l:
              const_i64 r1, 2
            m:
              set r2, r1
              return_i r2
            ",
        );
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        discover(&opt, &mut g);
        let set = g.insts_with_op(Opcode::Set)[0];
        let r2 = g.inst(set).write().unwrap();
        assert_eq!(g.facts(r2).value, Some(KnownValue::Int(2)));
    }

    #[test]
    fn create_and_attributes() {
        let (ctx, t) = setup(
            SpeshConfig::default(),
            model(),
            "
              const_type r0, T5
              create r1, r0
              const_i64 r2, 3
              bindattr_i r1, T5, \"a\", r2
              getattr_i r3, r1, T5, \"a\"
              getattr_o r4, r1, T5, \"o\"
              getattr_n r5, r1, T5, \"nope\"
              return_i r3
            ",
        );
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        discover(&opt, &mut g);
        match_ptn(
            &g.to_string(),
            "
            ...
              const_type r0(1), T5
              sp_fastcreate r1(1), 16, T5
              const_i64 r2(1), 3
              sp_bind_i r1(1), 0, r2(1)
              sp_get_i r3(1), r1(1), 0
              sp_get_o r4(1), r1(1), 8
              getattr_n r5(1), r1(1), T5, \"nope\"
              return_i r3(1)
            ",
        );
    }

    #[test]
    fn guards_and_deconts() {
        let (ctx, t) = setup(
            SpeshConfig::default(),
            model(),
            "
              param_rp_o r0, 0
              decont r1, r0
              return_o r1
            ",
        );
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        let types: crate::callsite::TypeTuple =
            std::sync::Arc::from(vec![Some(ObservedType::concrete(TypeId(6)))]);
        crate::builder::insert_arg_guards(&mut g, Some(&types));
        // A second, redundant guard.
        let guard = g.insts_with_op(Opcode::SpGuard)[0];
        let v = g.inst(guard).write().unwrap();
        let new = g.new_version(v.reg);
        let conc = g.insert_after(
            guard,
            Opcode::SpGuardConc,
            &[Operand::Var(new), Operand::Var(v)],
        );
        g.add_deopt(conc, DeoptKind::One, 6);
        g.refine_uses(conc, v, new);
        discover(&opt, &mut g);
        match_ptn(
            &g.to_string(),
            "
            ...
              param_rp_o r0(1), 0
              sp_guard r0(2), r0(1), T6 [deopt-one 6]
              set r0(3), r0(2)
              set r1(1), r0(3)
              return_o r1(1)
            ",
        );
        assert_eq!(ctx.stat(Counter::GuardsEliminated), 1);
    }

    #[test]
    fn log_guided_guard() {
        let (ctx, t) = setup(
            SpeshConfig::default(),
            model(),
            "
              param_rp_o r0, 0
              decont r1, r0
              return_o r1
            ",
        );
        for _ in 0..10 {
            t.record(LogEntry::Type {
                offset: 6,
                ty: ObservedType::concrete(TypeId(8)),
            });
        }
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        discover(&opt, &mut g);
        match_ptn(
            &g.to_string(),
            "
            ...
              decont r1(1), r0(1)
              sp_guard r1(2), r1(1), T8 [deopt-one 12]
              return_o r1(2)
            ",
        );

        // Below the threshold nothing is inserted.
        t.record(LogEntry::Type {
            offset: 6,
            ty: ObservedType::concrete(TypeId(9)),
        });
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        discover(&opt, &mut g);
        assert_eq!(g.count_op(Opcode::SpGuard), 0);
    }
}
