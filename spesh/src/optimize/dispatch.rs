//! Rewriting dynamic dispatches.
//!
//! A dispatch whose inline cache saw a single dominant outcome is replaced by guards on the
//! arguments that program checked, followed by the program's result: a constant, one of the
//! arguments, or a direct invocation of a known callee. Everything else becomes an unguarded
//! dispatch through the inline cache.

use super::Opt;
use crate::{
    bytecode::Opcode,
    candidate::{CallTarget, DispatchCheck, DispatchProgram, DispatchResult, SpeshSlot},
    deopt::DeoptKind,
    ir::{Graph, InstIdx, Operand, Var},
    log::{stats::Counter, Verbosity},
};
use std::{collections::HashMap, sync::Arc};

/// Rewrite the `dispatch_o` `d` to dispatch through its inline cache. Returns false if `d` did
/// not come from generic bytecode and so has no cache.
pub(crate) fn unguarded(g: &mut Graph, target: &Arc<CallTarget>, d: InstIdx) -> bool {
    let inst = g.inst(d);
    let (Some(off), [w, cs, name]) = (inst.generic_offset, inst.operands.as_slice()) else {
        return false;
    };
    let ops = [*w, *cs, *name];
    let slot = g.add_spesh_slot(SpeshSlot::InlineCache(Arc::downgrade(target), off));
    g.rewrite(
        d,
        Opcode::SpDispatchO,
        &[ops[0], ops[1], ops[2], Operand::Slot(slot)],
    );
    true
}

/// Rewrite every `dispatch_o` in `g` according to the dispatch outcomes logged for it.
pub(crate) fn rewrite_dispatches(opt: &Opt, g: &mut Graph) {
    let pct = opt.ctx.config().mono_dispatch_percent;
    for d in g.insts_with_op(Opcode::DispatchO) {
        let Some(off) = g.inst(d).generic_offset else {
            continue;
        };
        let seen = opt.stats.by_offset.get(&off).map(|s| {
            (
                !s.dispatch_outcomes.is_empty(),
                s.dominant_outcome(pct),
            )
        });
        let counter = match seen {
            None | Some((false, _)) => Counter::DispatchUnguarded,
            Some((true, Some(outcome))) => {
                match opt.target.dispatch_program(off, outcome) {
                    Some(p) if monomorphic(g, d, &p) => Counter::DispatchMonomorphic,
                    _ => Counter::DispatchUnguarded,
                }
            }
            Some((true, None)) => {
                opt.ctx.log.log(
                    Verbosity::OptEvent,
                    &format!(
                        "dispatch at {off} in '{}' is polymorphic",
                        opt.target.name()
                    ),
                );
                Counter::DispatchPolymorphic
            }
        };
        if counter != Counter::DispatchMonomorphic {
            unguarded(g, opt.target, d);
        }
        opt.ctx.stats.count(counter);
    }
}

fn check_operands(check: &DispatchCheck, new: Var, old: Var) -> (Opcode, Vec<Operand>) {
    let (n, o) = (Operand::Var(new), Operand::Var(old));
    match check {
        DispatchCheck::Type(t) => (Opcode::SpGuard, vec![n, o, Operand::Type(*t)]),
        DispatchCheck::Concrete => (Opcode::SpGuardConc, vec![n, o]),
        DispatchCheck::TypeObject(t) => (Opcode::SpGuardType, vec![n, o, Operand::Type(*t)]),
        DispatchCheck::LiteralInt(x) => (Opcode::SpGuardLitI, vec![n, o, Operand::I64(*x)]),
    }
}

/// Replace the dispatch `d` with `program`'s guards and result. Returns false, leaving `g`
/// untouched, if the program cannot be expressed here.
fn monomorphic(g: &mut Graph, d: InstIdx, program: &DispatchProgram) -> bool {
    let args = g.call_args(d);
    let mut vars = HashMap::new();
    let needed = program
        .guards
        .iter()
        .map(|x| x.arg)
        .chain(match program.result {
            DispatchResult::CaptureArg(i) => Some(i),
            _ => None,
        });
    for i in needed {
        match g.call_arg(d, i) {
            Some(v) => {
                vars.insert(i, v);
            }
            None => return false,
        }
    }
    if let DispatchResult::Invoke(callee) = &program.result {
        if callee.upgrade().is_none() {
            return false;
        }
    }
    // Guards must run before any argument is set up: on failure, generic code redoes the whole
    // dispatch sequence.
    let first = args.first().copied().unwrap_or(d);
    let Some(resume) = g.inst(first).generic_offset else {
        return false;
    };

    for pg in &program.guards {
        let Some(old) = vars.get(&pg.arg).copied() else {
            return false;
        };
        let new = g.new_version(old.reg);
        let (op, ops) = check_operands(&pg.check, new, old);
        let guard = g.insert_before(first, op, &ops);
        g.add_deopt(guard, DeoptKind::One, resume);
        g.refine_uses(guard, old, new);
        let (ty, lit) = match ops.get(2) {
            Some(Operand::Type(t)) => (Some(*t), None),
            Some(Operand::I64(x)) => (None, Some(*x)),
            _ => (None, None),
        };
        let f = g.facts(old).refined_by_guard(op, ty, lit);
        *g.facts_mut(new) = f;
        vars.insert(pg.arg, new);
    }

    let inst = g.inst(d);
    let (w, cs) = (inst.operands[0], inst.operands[1]);
    match &program.result {
        DispatchResult::Constant(v) => {
            let slot = g.add_spesh_slot(SpeshSlot::Value(v.clone()));
            for a in args {
                g.delete_inst(a);
            }
            g.rewrite(d, Opcode::SpGetSpeshSlot, &[w, Operand::Slot(slot)]);
        }
        DispatchResult::CaptureArg(i) => {
            let Some(v) = vars.get(i).copied() else {
                return false;
            };
            for a in args {
                g.delete_inst(a);
            }
            g.rewrite(d, Opcode::Set, &[w, Operand::Var(v)]);
        }
        DispatchResult::Invoke(callee) => {
            let slot = g.add_spesh_slot(SpeshSlot::CallTarget(callee.clone()));
            g.rewrite(d, Opcode::SpFastInvokeO, &[w, cs, Operand::Slot(slot)]);
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        callsite::TypeId,
        candidate::ProgramGuard,
        config::SpeshConfig,
        ir::test::match_ptn,
        optimize::test::{graph_of, setup},
        stats::LogEntry,
        value::{TypeRegistry, Value},
    };

    const SRC: &str = "
        .callsite obj, int
          param_rp_o r0, 0
          param_rp_i r1, 1
          arg_o 0, r0
          arg_i 1, r1
          dispatch_o r2, cs0, \"m\"
          return_o r2
        ";
    // param_rp_o (6) + param_rp_i (6); the first arg_o is at 12 and dispatch_o at 24.
    const DISPATCH: u32 = 24;

    fn record(t: &CallTarget, outcome: usize, n: usize) {
        for _ in 0..n {
            t.record(LogEntry::Dispatch {
                offset: DISPATCH,
                outcome,
            });
        }
    }

    #[test]
    fn no_outcomes_is_unguarded() {
        let (ctx, t) = setup(SpeshConfig::default(), TypeRegistry::new(), SRC);
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        rewrite_dispatches(&opt, &mut g);
        match_ptn(
            &g.to_string(),
            "
            ...
              arg_o 0, r0(1)
              arg_i 1, r1(1)
              sp_dispatch_o r2(1), cs0, \"m\", ss0 [deopt-all 34]
              return_o r2(1)
            ",
        );
        assert_eq!(ctx.stat(Counter::DispatchUnguarded), 1);
    }

    #[test]
    fn monomorphic_constant() {
        let (ctx, t) = setup(SpeshConfig::default(), TypeRegistry::new(), SRC);
        let program = DispatchProgram {
            guards: vec![
                ProgramGuard {
                    arg: 0,
                    check: DispatchCheck::Type(TypeId(7)),
                },
                ProgramGuard {
                    arg: 1,
                    check: DispatchCheck::LiteralInt(3),
                },
            ],
            result: DispatchResult::Constant(Value::Int(42)),
        };
        let outcome = t.record_dispatch(DISPATCH, program).unwrap();
        record(&t, outcome, 10);
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        rewrite_dispatches(&opt, &mut g);
        match_ptn(
            &g.to_string(),
            "
            ...
              param_rp_i r1(1), 1
              sp_guard r0(2), r0(1), T7 [deopt-one 12]
              sp_guardlit_i r1(2), r1(1), 3 [deopt-one 12]
              sp_getspeshslot r2(1), ss0
              return_o r2(1)
            ",
        );
        assert_eq!(g.spesh_slots.len(), 1);
        assert!(matches!(g.spesh_slots[0], SpeshSlot::Value(Value::Int(42))));
        assert_eq!(ctx.stat(Counter::DispatchMonomorphic), 1);
    }

    #[test]
    fn monomorphic_capture_and_invoke() {
        let (ctx, t) = setup(SpeshConfig::default(), TypeRegistry::new(), SRC);
        let outcome = t
            .record_dispatch(
                DISPATCH,
                DispatchProgram {
                    guards: vec![ProgramGuard {
                        arg: 0,
                        check: DispatchCheck::Concrete,
                    }],
                    result: DispatchResult::CaptureArg(0),
                },
            )
            .unwrap();
        record(&t, outcome, 10);
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        rewrite_dispatches(&opt, &mut g);
        match_ptn(
            &g.to_string(),
            "
            ...
              sp_guardconc r0(2), r0(1) [deopt-one 12]
              set r2(1), r0(2)
              return_o r2(1)
            ",
        );

        let callee = ctx
            .new_call_target("callee", crate::bytecode::text::assemble("return_o r0").unwrap())
            .unwrap();
        let (ctx, t) = setup(SpeshConfig::default(), TypeRegistry::new(), SRC);
        let outcome = t
            .record_dispatch(
                DISPATCH,
                DispatchProgram {
                    guards: vec![],
                    result: DispatchResult::Invoke(Arc::downgrade(&callee)),
                },
            )
            .unwrap();
        record(&t, outcome, 10);
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        rewrite_dispatches(&opt, &mut g);
        match_ptn(
            &g.to_string(),
            "
            ...
              arg_o 0, r0(1)
              arg_i 1, r1(1)
              sp_fastinvoke_o r2(1), cs0, ss0 [deopt-all 34]
              return_o r2(1)
            ",
        );

        // Once the callee is gone, the dispatch stays dynamic.
        drop(callee);
        let mut g = graph_of(&t);
        rewrite_dispatches(&opt, &mut g);
        assert_eq!(g.count_op(Opcode::SpDispatchO), 1);
        assert_eq!(ctx.stat(Counter::DispatchUnguarded), 1);
    }

    #[test]
    fn polymorphic() {
        let (ctx, t) = setup(SpeshConfig::default(), TypeRegistry::new(), SRC);
        for i in 0..3 {
            let o = t
                .record_dispatch(
                    DISPATCH,
                    DispatchProgram {
                        guards: vec![ProgramGuard {
                            arg: 1,
                            check: DispatchCheck::LiteralInt(i),
                        }],
                        result: DispatchResult::Constant(Value::Int(i)),
                    },
                )
                .unwrap();
            record(&t, o, 10);
        }
        let opt = Opt::new(&ctx, &t);
        let mut g = graph_of(&t);
        rewrite_dispatches(&opt, &mut g);
        assert_eq!(g.count_op(Opcode::SpDispatchO), 1);
        assert_eq!(g.count_op(Opcode::SpGuardLitI), 0);
        assert_eq!(ctx.stat(Counter::DispatchPolymorphic), 1);
    }
}
