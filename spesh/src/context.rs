//! The runtime context: the handle through which an embedding runtime drives the engine.

use crate::{
    builder,
    bytecode::Bytecode,
    candidate::{CallTarget, CallTargetId, Candidate},
    config::SpeshConfig,
    deopt,
    errors::SpeshError,
    frame::ThreadContext,
    job_queue::{Job, JobQueue},
    log::{
        stats::{Counter, Stage, Stats},
        Log, Verbosity,
    },
    optimize,
    planner::{self, PlannedSpecialization},
    value::ObjectModel,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    error::Error,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

/// Everything shared between the threads running code and the workers specializing it.
pub struct RuntimeContext {
    config: SpeshConfig,
    /// Serialises candidate installation.
    install_lock: Mutex<()>,
    pub(crate) log: Log,
    pub(crate) stats: Stats,
    model: Arc<dyn ObjectModel>,
    job_queue: JobQueue,
    next_id: AtomicU32,
}

impl RuntimeContext {
    pub fn new(config: SpeshConfig, model: Arc<dyn ObjectModel>) -> Result<Arc<Self>, Box<dyn Error>> {
        let job_queue = JobQueue::new(config.max_jobs);
        Ok(Arc::new(Self {
            config,
            install_lock: Mutex::new(()),
            log: Log::new()?,
            stats: Stats::new(),
            model,
            job_queue,
            next_id: AtomicU32::new(0),
        }))
    }

    /// A context configured from `SPESH_*` environment variables.
    pub fn from_env(model: Arc<dyn ObjectModel>) -> Result<Arc<Self>, Box<dyn Error>> {
        Self::new(SpeshConfig::from_env()?, model)
    }

    pub fn config(&self) -> &SpeshConfig {
        &self.config
    }

    pub(crate) fn model(&self) -> &dyn ObjectModel {
        &*self.model
    }

    pub(crate) fn install_lock(&self) -> MutexGuard<'_, ()> {
        self.install_lock.lock()
    }

    /// Register a new call target for `bytecode`.
    pub fn new_call_target(
        &self,
        name: &str,
        bytecode: Bytecode,
    ) -> Result<Arc<CallTarget>, SpeshError> {
        let id = CallTargetId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(CallTarget::new(
            id,
            name,
            bytecode,
            self.config.max_candidates,
        )?))
    }

    /// Plan specializations for `targets`, callees first.
    pub fn plan(&self, targets: &[Arc<CallTarget>]) -> Vec<PlannedSpecialization> {
        let _t = self.stats.time(Stage::Planning);
        let plans = planner::plan(&self.config, &self.log, targets);
        self.stats
            .count_n(Counter::CandidatesPlanned, plans.len() as u64);
        plans
    }

    /// Build and install the logging candidate for `plan`.
    pub fn build(&self, plan: &PlannedSpecialization) -> Result<Arc<Candidate>, SpeshError> {
        let _t = self.stats.time(Stage::Building);
        builder::build(self, plan)
    }

    /// Plan specializations for `targets` and build each of them, returning the candidates that
    /// were installed. Install conflicts are logged and dropped; any other failure is logged as
    /// an error and abandons only the plan that caused it.
    pub fn plan_and_build(&self, targets: &[Arc<CallTarget>]) -> Vec<Arc<Candidate>> {
        let mut built = Vec::new();
        for p in self.plan(targets) {
            match self.build(&p) {
                Ok(c) => built.push(c),
                Err(e) if e.is_recoverable() => {
                    self.stats.count(Counter::CandidatesDiscarded);
                    self.log
                        .log(Verbosity::CandidateEvent, &format!("discarding {p:?}: {e}"));
                }
                Err(e) => self.log.log(Verbosity::Error, &format!("building {p:?}: {e}")),
            }
        }
        built
    }

    /// Replace `cand`'s logging body with an optimized one.
    pub fn promote(&self, target: &Arc<CallTarget>, cand: &Arc<Candidate>) -> Result<(), SpeshError> {
        let r = {
            let _t = self.stats.time(Stage::Optimizing);
            optimize::promote(self, target, cand)
        };
        match &r {
            Ok(()) => {
                self.stats.count(Counter::CandidatesPromoted);
                self.log.log(
                    Verbosity::CandidateEvent,
                    &format!("promoted {cand:?} of '{}'", target.name()),
                );
            }
            Err(e) => self.log.log(
                Verbosity::Error,
                &format!("promoting {cand:?} of '{}': {e}", target.name()),
            ),
        }
        r
    }

    /// The interpreter finished a run of `cand`'s logging body. Once the run budget is exhausted
    /// a promotion is queued. Returns true if this call queued it.
    pub fn log_run(self: &Arc<Self>, target: &Arc<CallTarget>, cand: &Arc<Candidate>) -> bool {
        if cand.log_run() {
            self.queue_promotion(target, cand);
            true
        } else {
            false
        }
    }

    /// Queue [Self::plan_and_build] on a worker thread. Waiting requests are merged.
    pub fn queue_plan_and_build(self: &Arc<Self>, targets: Vec<Arc<CallTarget>>) {
        self.job_queue.push(self, Job::PlanAndBuild(targets));
    }

    /// Queue [Self::promote] on a worker thread, ahead of any planning.
    pub fn queue_promotion(self: &Arc<Self>, target: &Arc<CallTarget>, cand: &Arc<Candidate>) {
        self.job_queue
            .push(self, Job::Promote(Arc::clone(target), Arc::clone(cand)));
    }

    /// How many queued jobs have not yet started?
    pub fn pending_jobs(&self) -> usize {
        self.job_queue.pending()
    }

    /// The top frame of `thread` failed a guard: continue it in generic code.
    pub fn deopt_one(&self, thread: &mut ThreadContext) -> Result<(), SpeshError> {
        let r = {
            let _t = self.stats.time(Stage::Deopting);
            deopt::deopt_one(thread)
        };
        match &r {
            Ok(()) => self.stats.count(Counter::DeoptOne),
            Err(e) => self.log.log(Verbosity::Error, &format!("deopt-one: {e}")),
        }
        r
    }

    /// Code has been invalidated: rewind every caller frame on `thread` that can be rewound.
    pub fn deopt_all(&self, thread: &mut ThreadContext) -> Result<usize, SpeshError> {
        let r = {
            let _t = self.stats.time(Stage::Deopting);
            deopt::deopt_all(thread)
        };
        match &r {
            Ok(n) => self.stats.count_n(Counter::DeoptAll, *n as u64),
            Err(e) => self.log.log(Verbosity::Error, &format!("deopt-all: {e}")),
        }
        r
    }

    #[cfg(test)]
    pub(crate) fn stat(&self, counter: Counter) -> u64 {
        self.stats.get(counter).unwrap_or(0)
    }

    /// Write out statistics, if `SPESH_LOG_STATS` is set.
    pub fn output_stats(&self) {
        self.stats.output();
    }

    /// Stop taking on new work, re-raising the panic of any worker that died.
    pub fn shutdown(&self) {
        self.job_queue.shutdown();
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.stats.output();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        bytecode::text::assemble,
        callsite::{ArgKind, CallsiteShape, ObservedType, TypeId, TypeTuple},
        stats::LogEntry,
        value::TypeRegistry,
    };
    use std::{thread, time::Duration};

    pub(crate) fn ctx() -> Arc<RuntimeContext> {
        let config = SpeshConfig {
            log_runs: 2,
            ..SpeshConfig::default()
        };
        RuntimeContext::new(config, Arc::new(TypeRegistry::new())).unwrap()
    }

    pub(crate) fn hot_target(ctx: &RuntimeContext) -> Arc<CallTarget> {
        let t = ctx
            .new_call_target(
                "id",
                assemble(
                    "
                      param_rp_o r0, 0
                      return_o r0
                    ",
                )
                .unwrap(),
            )
            .unwrap();
        let shape = Arc::new(CallsiteShape::positional(vec![ArgKind::Obj]));
        let types: TypeTuple = Arc::from(vec![Some(ObservedType::concrete(TypeId(1)))]);
        for _ in 0..200 {
            t.record(LogEntry::Entry {
                shape: Arc::clone(&shape),
                types: Arc::clone(&types),
                depth: 0,
                osr: false,
            });
        }
        t
    }

    #[test]
    fn plan_build_promote() {
        let ctx = ctx();
        let t = hot_target(&ctx);
        let built = ctx.plan_and_build(&[Arc::clone(&t)]);
        assert_eq!(built.len(), 1);
        assert_eq!(t.num_candidates(), 1);
        assert_eq!(ctx.stat(Counter::CandidatesPlanned), 1);
        assert_eq!(ctx.stat(Counter::CandidatesInstalled), 1);
        // Nothing left to do.
        assert!(ctx.plan_and_build(&[Arc::clone(&t)]).is_empty());

        let c = &built[0];
        assert!(!c.is_optimized());
        ctx.promote(&t, c).unwrap();
        assert!(c.is_optimized());
        assert_eq!(ctx.stat(Counter::CandidatesPromoted), 1);
    }

    #[test]
    fn racing_builds_converge() {
        let ctx = ctx();
        let t = hot_target(&ctx);
        let plans = ctx.plan(&[Arc::clone(&t)]);
        assert_eq!(plans.len(), 1);
        let p = plans[0].clone();
        let hdls = (0..4)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                let p = p.clone();
                thread::spawn(move || ctx.build(&p).is_ok())
            })
            .collect::<Vec<_>>();
        let wins = hdls
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|x| *x)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(t.num_candidates(), 1);
    }

    #[test]
    fn promotion_is_queued_after_log_runs() {
        let ctx = ctx();
        let t = hot_target(&ctx);
        let c = ctx.plan_and_build(&[Arc::clone(&t)]).remove(0);
        assert!(!ctx.log_run(&t, &c));
        assert!(ctx.log_run(&t, &c));
        assert!(!ctx.log_run(&t, &c));
        for _ in 0..1000 {
            if c.is_optimized() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(c.is_optimized());
        ctx.shutdown();
    }
}
