//! Building the first generation of a candidate: generic bytecode plus argument guards and
//! logging instrumentation.

use crate::{
    bytecode::{LogKind, Opcode},
    callsite::TypeTuple,
    candidate::Candidate,
    codegen,
    context::RuntimeContext,
    deopt::DeoptKind,
    errors::SpeshError,
    ir::{Facts, Graph, Operand},
    log::{stats::Counter, IRPhase, Verbosity},
    optimize::dispatch,
    planner::PlannedSpecialization,
};
use std::sync::Arc;

/// Insert a guard after every parameter whose type `types` constrains. A failed guard resumes
/// generic code just after the parameter was read.
pub(crate) fn insert_arg_guards(g: &mut Graph, types: Option<&TypeTuple>) {
    let Some(types) = types else {
        return;
    };
    for param in g.insts_with_op(Opcode::ParamRpO) {
        let (v, idx, resume) = {
            let inst = g.inst(param);
            match (inst.operands.as_slice(), inst.generic_next_offset()) {
                ([Operand::Var(v), Operand::I16(idx)], Some(resume)) => (*v, *idx, resume),
                _ => continue,
            }
        };
        let Some(Some(ty)) = usize::try_from(idx).ok().and_then(|i| types.get(i)) else {
            continue;
        };
        let op = if ty.concrete {
            Opcode::SpGuard
        } else {
            Opcode::SpGuardType
        };
        let new = g.new_version(v.reg);
        let guard = g.insert_after(
            param,
            op,
            &[Operand::Var(new), Operand::Var(v), Operand::Type(ty.ty)],
        );
        g.add_deopt(guard, DeoptKind::One, resume);
        g.refine_uses(guard, v, new);
        *g.facts_mut(new) = Facts::from_observed(*ty);
    }
}

/// Record the value written (or, for returns, read) by every observation point.
fn insert_logging(g: &mut Graph) {
    for iidx in g.insts_in_order() {
        let inst = g.inst(iidx);
        let Some(off) = inst.generic_offset else {
            continue;
        };
        let (kind, var, before) = match inst.op {
            Opcode::ParamRpO => (LogKind::Param, inst.write(), false),
            Opcode::Decont => (LogKind::Decont, inst.write(), false),
            Opcode::GetAttrO => (LogKind::Attribute, inst.write(), false),
            Opcode::DispatchO => (LogKind::Invoke, inst.write(), false),
            Opcode::ReturnO => (LogKind::Return, inst.reads().first().copied(), true),
            _ => continue,
        };
        let Some(v) = var else {
            continue;
        };
        let ops = [
            Operand::Var(v),
            Operand::I16(kind as i16),
            Operand::U32(off),
        ];
        if before {
            g.insert_before(iidx, Opcode::SpLog, &ops);
        } else {
            g.insert_after(iidx, Opcode::SpLog, &ops);
        }
    }
}

/// Build the logging candidate for `plan` and install it on its call target.
pub(crate) fn build(
    ctx: &RuntimeContext,
    plan: &PlannedSpecialization,
) -> Result<Arc<Candidate>, SpeshError> {
    let target = &plan.call_target;
    let mut g = Graph::from_bytecode(target.id(), target.bytecode())?;
    insert_logging(&mut g);
    insert_arg_guards(&mut g, plan.types.as_ref());
    for d in g.insts_with_op(Opcode::DispatchO) {
        dispatch::unguarded(&mut g, target, d);
    }
    g.mark_deopt_usages();
    #[cfg(debug_assertions)]
    g.assert_well_formed();
    if ctx.log.should_log_ir(IRPhase::PreOpt) {
        ctx.log.log_ir(IRPhase::PreOpt, target.name(), &g.to_string());
    }

    let body = codegen::generate(&g)?;
    ctx.stats.count(Counter::CandidatesBuilt);
    let cand = Candidate::new(
        Arc::clone(&plan.shape),
        plan.types.clone(),
        plan.kind,
        body,
        ctx.config().log_runs,
    );
    let cand = {
        let _lk = ctx.install_lock();
        target.install(cand)?
    };
    ctx.stats.count(Counter::CandidatesInstalled);
    ctx.log.log(
        Verbosity::CandidateEvent,
        &format!("installed {cand:?} on '{}'", target.name()),
    );
    Ok(cand)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        callsite::{ObservedType, TypeId},
        ir::{
            test::{graph, match_ptn},
            Var,
        },
    };

    #[test]
    fn logging_instrumentation() {
        let mut g = graph(
            "
            .callsite obj
              param_rp_o r0, 0
              decont r1, r0
              getattr_o r2, r1, T3, \"x\"
              arg_o 0, r2
              dispatch_o r3, cs0, \"m\"
              return_o r3
            ",
        );
        insert_logging(&mut g);
        match_ptn(
            &g.to_string(),
            "
            ...
              param_rp_o r0(1), 0
              sp_log r0(1), 0, 0
              decont r1(1), r0(1)
              sp_log r1(1), 2, 6
              getattr_o r2(1), r1(1), T3, \"x\"
              sp_log r2(1), 3, 12
              arg_o 0, r2(1)
              dispatch_o r3(1), cs0, \"m\" [deopt-all 42]
              sp_log r3(1), 4, 32
              sp_log r3(1), 1, 42
              return_o r3(1)
            ",
        );
    }

    #[test]
    fn arg_guards() {
        let mut g = graph(
            "
              param_rp_o r0, 0
              param_rp_o r1, 1
              param_rp_o r2, 2
              decont r3, r0
              return_o r2
            ",
        );
        let types: TypeTuple = Arc::from(vec![
            Some(ObservedType::concrete(TypeId(4))),
            None,
            Some(ObservedType::type_object(TypeId(5))),
        ]);
        insert_arg_guards(&mut g, Some(&types));
        match_ptn(
            &g.to_string(),
            "
            ...
              param_rp_o r0(1), 0
              sp_guard r0(2), r0(1), T4 [deopt-one 6]
              param_rp_o r1(1), 1
              param_rp_o r2(1), 2
              sp_guardtype r2(2), r2(1), T5 [deopt-one 18]
              decont r3(1), r0(2)
              return_o r2(2)
            ",
        );
        let guarded = Var::new(0, 2);
        assert_eq!(
            *g.facts(guarded),
            Facts::known_type(TypeId(4), true)
        );
        // No tuple, no guards.
        let mut g2 = graph("param_rp_o r0, 0\nreturn_o r0\n");
        insert_arg_guards(&mut g2, None);
        assert_eq!(g2.count_op(Opcode::SpGuard), 0);
    }
}
