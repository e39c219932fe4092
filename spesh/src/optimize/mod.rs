//! Promotion: turning a candidate's logging body into an optimized one.
//!
//! The graph is rebuilt from generic bytecode, so the logging instrumentation of the first
//! generation never reaches optimized code. The passes then run in a fixed order:
//!
//!   1. argument guards, as for the logging body;
//!   2. facts discovery, including log-guided guards;
//!   3. dispatch rewriting;
//!   4. inlining;
//!   5. facts discovery again, over the inlined code;
//!   6. escape analysis and scalar replacement;
//!   7. dead code elimination.

use crate::{
    builder,
    candidate::{CallTarget, Candidate},
    codegen,
    context::RuntimeContext,
    errors::SpeshError,
    ir::Graph,
    log::{stats::Counter, IRPhase},
    stats::CallTargetStats,
};
use std::sync::Arc;

pub(crate) mod discover;
pub(crate) mod dispatch;
pub(crate) mod inline;
pub(crate) mod pea;

/// What every pass may consult.
pub(crate) struct Opt<'a> {
    pub(crate) ctx: &'a RuntimeContext,
    pub(crate) target: &'a Arc<CallTarget>,
    /// A snapshot of `target`'s statistics, taken when promotion started.
    pub(crate) stats: CallTargetStats,
}

impl<'a> Opt<'a> {
    pub(crate) fn new(ctx: &'a RuntimeContext, target: &'a Arc<CallTarget>) -> Self {
        Self {
            ctx,
            target,
            stats: target.stats(),
        }
    }
}

/// Dump `g` at `phase` if that was requested.
fn dump(opt: &Opt, phase: IRPhase, g: &Graph) {
    if opt.ctx.log.should_log_ir(phase) {
        opt.ctx.log.log_ir(phase, opt.target.name(), &g.to_string());
    }
}

/// Run every pass over `g`.
pub(crate) fn optimize(opt: &Opt, g: &mut Graph) {
    discover::discover(opt, g);
    dispatch::rewrite_dispatches(opt, g);
    if opt.ctx.config().inline {
        let n = inline::inline_calls(opt, g);
        opt.ctx.stats.count_n(Counter::Inlines, n as u64);
    }
    discover::discover(opt, g);
    if opt.ctx.config().pea {
        pea::run(opt, g);
    }
    g.mark_deopt_usages();
    g.eliminate_dead_code();
    #[cfg(debug_assertions)]
    g.assert_well_formed();
}

/// Build the optimized body for `cand` and publish it.
pub(crate) fn promote(
    ctx: &RuntimeContext,
    target: &Arc<CallTarget>,
    cand: &Arc<Candidate>,
) -> Result<(), SpeshError> {
    let opt = Opt::new(ctx, target);
    let mut g = Graph::from_bytecode(target.id(), target.bytecode())?;
    builder::insert_arg_guards(&mut g, cand.types());
    dump(&opt, IRPhase::PreOpt, &g);
    optimize(&opt, &mut g);
    dump(&opt, IRPhase::PostOpt, &g);
    let body = codegen::generate(&g)?;
    if ctx.log.should_log_ir(IRPhase::Bytecode) {
        let s = crate::bytecode::text::disassemble(&body.code, &body.strings)?;
        ctx.log.log_ir(IRPhase::Bytecode, target.name(), &s);
    }
    cand.optimized
        .set(Arc::new(body))
        .map_err(|_| SpeshError::Internal(format!("{cand:?} was promoted twice")))
}

#[cfg(test)]
pub(crate) mod test {
    use crate::{
        bytecode::text::assemble,
        candidate::CallTarget,
        config::SpeshConfig,
        context::RuntimeContext,
        ir::Graph,
        value::TypeRegistry,
    };
    use std::sync::Arc;

    /// A context using `model` and a call target for `src`.
    pub(crate) fn setup(
        config: SpeshConfig,
        model: TypeRegistry,
        src: &str,
    ) -> (Arc<RuntimeContext>, Arc<CallTarget>) {
        let ctx = RuntimeContext::new(config, Arc::new(model)).unwrap();
        let t = ctx.new_call_target("t", assemble(src).unwrap()).unwrap();
        (ctx, t)
    }

    pub(crate) fn graph_of(t: &CallTarget) -> Graph {
        Graph::from_bytecode(t.id(), t.bytecode()).unwrap()
    }
}
