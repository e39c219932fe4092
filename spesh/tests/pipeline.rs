//! End-to-end runs of the engine through its public interface: record statistics, plan, build,
//! promote, and then deoptimize frames running the result.

use spesh::{
    bytecode::{text::assemble, Opcode},
    callsite::{ArgKind, CallsiteShape, ObservedType, TypeId, TypeTuple},
    deopt::DeoptKind,
    frame::{Frame, ThreadContext},
    stats::LogEntry,
    value::{FieldKind, TypeRegistry, Value},
    CallTarget, RuntimeContext, SpeshConfig,
};
use std::sync::Arc;

fn ctx(model: TypeRegistry) -> Arc<RuntimeContext> {
    RuntimeContext::new(SpeshConfig::default(), Arc::new(model)).unwrap()
}

fn hit(t: &CallTarget, shape: &Arc<CallsiteShape>, types: &TypeTuple, n: usize) {
    for _ in 0..n {
        t.record(LogEntry::Entry {
            shape: Arc::clone(shape),
            types: Arc::clone(types),
            depth: 0,
            osr: false,
        });
    }
}

fn offset_of(t: &CallTarget, op: Opcode) -> u32 {
    t.bytecode()
        .decode()
        .unwrap()
        .into_iter()
        .find(|x| x.op == op)
        .unwrap()
        .offset
}

#[test]
fn failed_argument_guard_resumes_generic_code() {
    let ctx = ctx(TypeRegistry::new());
    let t = ctx
        .new_call_target(
            "f",
            assemble(
                "
                  param_rp_o r0, 0
                  decont r1, r0
                  return_o r1
                ",
            )
            .unwrap(),
        )
        .unwrap();
    let shape = Arc::new(CallsiteShape::positional(vec![ArgKind::Obj]));
    let types: TypeTuple = Arc::from(vec![Some(ObservedType::concrete(TypeId(4)))]);
    hit(&t, &shape, &types, 200);

    let cand = ctx.plan_and_build(&[Arc::clone(&t)]).remove(0);
    assert_eq!(cand.types(), Some(&types));
    ctx.promote(&t, &cand).unwrap();
    let body = cand.body();
    assert_eq!(body.count_op(Opcode::SpLog), 0);
    let dp = body
        .deopts
        .iter()
        .find(|x| x.kind == DeoptKind::One)
        .unwrap()
        .clone();
    // The guard follows the parameter it checks.
    assert_eq!(dp.generic, offset_of(&t, Opcode::Decont));

    let mut thread = ThreadContext::new();
    let mut f = Frame::specialized(Arc::clone(&t), Arc::clone(&cand), None);
    f.pc = dp.specialized;
    thread.push(f);
    ctx.deopt_one(&mut thread).unwrap();
    let f = thread.current_frame().unwrap();
    assert!(!f.is_specialized());
    assert_eq!(f.pc, dp.generic);
    assert_eq!(f.registers.len(), t.bytecode().local_kinds.len());
}

#[test]
fn replaced_allocation_is_materialized_on_deopt() {
    let ctx = ctx(TypeRegistry::new().with_object(TypeId(5), &[("a", FieldKind::Int)]));
    let t = ctx
        .new_call_target(
            "g",
            assemble(
                "
                  param_rp_o r0, 0
                  const_type r1, T5
                  create r2, r1
                  const_i64 r3, 7
                  bindattr_i r2, T5, \"a\", r3
                  decont r4, r0
                  getattr_i r5, r2, T5, \"a\"
                  return_i r5
                ",
            )
            .unwrap(),
        )
        .unwrap();
    let shape = Arc::new(CallsiteShape::positional(vec![ArgKind::Obj]));
    hit(&t, &shape, &Arc::from(vec![None]), 200);
    // The decont always produced a T9.
    let decont = offset_of(&t, Opcode::Decont);
    for _ in 0..20 {
        t.record(LogEntry::Type {
            offset: decont,
            ty: ObservedType::concrete(TypeId(9)),
        });
    }

    let cand = ctx.plan_and_build(&[Arc::clone(&t)]).remove(0);
    assert!(cand.types().is_none());
    ctx.promote(&t, &cand).unwrap();
    let body = cand.body();
    assert_eq!(body.count_op(Opcode::Create), 0);
    assert_eq!(body.count_op(Opcode::SpFastCreate), 0);
    assert_eq!(body.count_op(Opcode::SpGuard), 1);
    let dp = body
        .deopts
        .iter()
        .find(|x| !x.materializations.is_empty())
        .unwrap()
        .clone();
    assert_eq!(dp.generic, offset_of(&t, Opcode::GetAttrI));
    let m = body.materializations[dp.materializations[0]].clone();
    assert_eq!(m.targets, vec![2]);

    let mut thread = ThreadContext::new();
    let mut f = Frame::specialized(Arc::clone(&t), Arc::clone(&cand), None);
    f.pc = dp.specialized;
    f.registers[usize::from(m.fields[0])] = Value::Int(7);
    thread.push(f);
    ctx.deopt_one(&mut thread).unwrap();
    let f = thread.current_frame().unwrap();
    match &f.registers[2] {
        Value::Obj(o) => {
            assert_eq!(o.ty, TypeId(5));
            assert!(o.concrete);
            assert_eq!(o.fields.lock().clone(), vec![Value::Int(7)]);
        }
        x => panic!("{x:?}"),
    }
}

#[test]
fn invalidation_rewinds_callers() {
    let ctx = ctx(TypeRegistry::new());
    let src = "
        .callsite obj
          param_rp_o r0, 0
          arg_o 0, r0
          dispatch_o r1, cs0, \"m\"
          return_o r1
        ";
    let t = ctx.new_call_target("h", assemble(src).unwrap()).unwrap();
    let shape = Arc::new(CallsiteShape::positional(vec![ArgKind::Obj]));
    hit(&t, &shape, &Arc::from(vec![None]), 200);
    let cand = ctx.plan_and_build(&[Arc::clone(&t)]).remove(0);
    let body = cand.body();
    assert_eq!(body.count_op(Opcode::SpDispatchO), 1);
    let dp = body
        .deopts
        .iter()
        .find(|x| x.kind == DeoptKind::All)
        .unwrap()
        .clone();
    assert_eq!(dp.generic, offset_of(&t, Opcode::ReturnO));

    let callee = ctx
        .new_call_target("callee", assemble("return_o r0").unwrap())
        .unwrap();
    let mut thread = ThreadContext::new();
    let mut caller = Frame::specialized(Arc::clone(&t), Arc::clone(&cand), None);
    caller.pc = dp.specialized;
    thread.push(caller);
    // A caller not at a deopt point is left alone.
    let mut other = Frame::specialized(Arc::clone(&t), Arc::clone(&cand), None);
    other.pc = 0;
    thread.push(other);
    thread.push(Frame::generic(callee, None));
    assert_eq!(ctx.deopt_all(&mut thread).unwrap(), 1);
    let frames = thread.frames();
    assert!(!frames[0].is_specialized());
    assert_eq!(frames[0].pc, dp.generic);
    assert!(frames[1].is_specialized());
}

#[test]
fn cold_code_is_not_planned() {
    let ctx = ctx(TypeRegistry::new());
    let t = ctx
        .new_call_target("cold", assemble("param_rp_o r0, 0\nreturn_o r0\n").unwrap())
        .unwrap();
    let shape = Arc::new(CallsiteShape::positional(vec![ArgKind::Obj]));
    hit(&t, &shape, &Arc::from(vec![None]), 3);
    assert!(ctx.plan(&[Arc::clone(&t)]).is_empty());
    assert!(ctx.plan_and_build(&[t]).is_empty());
}
