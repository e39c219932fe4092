//! The worker threads that plan, build, and promote candidates off the interpreter's threads.
//!
//! Promotions are always taken before planning: a candidate whose logging runs are complete is
//! closer to paying off than a call target that is merely hot. Planning requests that are still
//! waiting when another arrives are merged, so that a worker plans callees and their callers
//! together.

use crate::{
    candidate::{CallTarget, Candidate},
    context::RuntimeContext,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::VecDeque,
    mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
};

pub(crate) enum Job {
    /// See [RuntimeContext::plan_and_build].
    PlanAndBuild(Vec<Arc<CallTarget>>),
    /// See [RuntimeContext::promote].
    Promote(Arc<CallTarget>, Arc<Candidate>),
}

impl Job {
    fn run(self, ctx: &RuntimeContext) {
        match self {
            Job::PlanAndBuild(targets) => {
                ctx.plan_and_build(&targets);
            }
            Job::Promote(target, cand) => {
                // Failures are logged by `promote` and the candidate keeps its logging body.
                ctx.promote(&target, &cand).ok();
            }
        }
    }
}

/// Jobs not yet taken by a worker.
#[derive(Default)]
struct Pending {
    promotions: VecDeque<(Arc<CallTarget>, Arc<Candidate>)>,
    /// The targets of every waiting planning request, each at most once.
    plan: Vec<Arc<CallTarget>>,
}

impl Pending {
    fn push(&mut self, job: Job) {
        match job {
            Job::PlanAndBuild(targets) => {
                for t in targets {
                    if !self.plan.iter().any(|x| Arc::ptr_eq(x, &t)) {
                        self.plan.push(t);
                    }
                }
            }
            Job::Promote(target, cand) => {
                if !self.promotions.iter().any(|(_, x)| Arc::ptr_eq(x, &cand)) {
                    self.promotions.push_back((target, cand));
                }
            }
        }
    }

    fn pop(&mut self) -> Option<Job> {
        if let Some((target, cand)) = self.promotions.pop_front() {
            Some(Job::Promote(target, cand))
        } else if self.plan.is_empty() {
            None
        } else {
            Some(Job::PlanAndBuild(mem::take(&mut self.plan)))
        }
    }

    fn len(&self) -> usize {
        self.promotions.len() + usize::from(!self.plan.is_empty())
    }
}

pub(crate) struct JobQueue {
    /// The hard cap on the number of worker threads.
    max_workers: usize,
    /// How many workers are waiting for work?
    idle_workers: Arc<AtomicUsize>,
    /// Kept so that [JobQueue::shutdown] can percolate a worker's panic upwards.
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<(Condvar, Mutex<Pending>)>,
}

impl JobQueue {
    pub(crate) fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            idle_workers: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
            pending: Arc::new((Condvar::new(), Mutex::new(Pending::default()))),
        }
    }

    /// Shut the queue down to the extent possible: running jobs cannot be cancelled and will
    /// continue running. Any worker that has already died has its panic resumed on this thread.
    pub(crate) fn shutdown(&self) {
        let mut lk = self.workers.lock();
        for hdl in lk.drain(..) {
            if hdl.is_finished() {
                if let Err(e) = hdl.join() {
                    // Despite the name, `resume_unwind` aborts if the unwind strategy is `abort`.
                    eprintln!("spesh worker thread error");
                    std::panic::resume_unwind(e);
                }
            }
        }
    }

    /// How many jobs are waiting to be picked up? Merged planning requests count once.
    pub(crate) fn pending(&self) -> usize {
        self.pending.1.lock().len()
    }

    /// Queue `job` to be run for `ctx` on a worker thread, spinning a new worker up if none is
    /// idle and the cap allows.
    pub(crate) fn push(&self, ctx: &Arc<RuntimeContext>, job: Job) {
        let (cv, mtx) = &*self.pending;
        mtx.lock().push(job);
        cv.notify_one();

        if self.idle_workers.load(Ordering::Relaxed) > 0 {
            return;
        }
        let mut lk = self.workers.lock();
        if lk.len() < self.max_workers {
            self.idle_workers.fetch_add(1, Ordering::Relaxed);
            let ctx = Arc::downgrade(ctx);
            let idle = Arc::clone(&self.idle_workers);
            let pending = Arc::clone(&self.pending);
            lk.push(thread::spawn(move || work(&ctx, &idle, &pending)));
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        // Wake idle workers so that they see their context has gone.
        let (cv, mtx) = &*self.pending;
        let _lk = mtx.lock();
        cv.notify_all();
    }
}

/// Run jobs until `ctx` is dropped. Workers only hold a strong reference to `ctx` while a job
/// runs, and never while `pending` is locked, so the context can be dropped on a worker.
fn work(ctx: &Weak<RuntimeContext>, idle: &AtomicUsize, pending: &(Condvar, Mutex<Pending>)) {
    let (cv, mtx) = pending;
    let mut lk = mtx.lock();
    while ctx.strong_count() > 0 {
        let Some(job) = lk.pop() else {
            cv.wait(&mut lk);
            continue;
        };
        idle.fetch_sub(1, Ordering::Relaxed);
        MutexGuard::unlocked(&mut lk, || {
            if let Some(ctx) = ctx.upgrade() {
                job.run(&ctx);
            }
        });
        idle.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::test::{ctx, hot_target};

    fn promote_target(job: &Option<Job>) -> Option<&Arc<CallTarget>> {
        match job {
            Some(Job::Promote(t, _)) => Some(t),
            _ => None,
        }
    }

    #[test]
    fn planning_requests_merge() {
        let ctx = ctx();
        let (t1, t2) = (hot_target(&ctx), hot_target(&ctx));
        let mut p = Pending::default();
        p.push(Job::PlanAndBuild(vec![Arc::clone(&t1)]));
        p.push(Job::PlanAndBuild(vec![Arc::clone(&t2), Arc::clone(&t1)]));
        assert_eq!(p.len(), 1);
        match p.pop() {
            Some(Job::PlanAndBuild(ts)) => {
                assert_eq!(ts.len(), 2);
                assert!(Arc::ptr_eq(&ts[0], &t1) && Arc::ptr_eq(&ts[1], &t2));
            }
            _ => panic!(),
        }
        assert!(p.pop().is_none());
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn promotions_first() {
        let ctx = ctx();
        let (t1, t2) = (hot_target(&ctx), hot_target(&ctx));
        let c1 = ctx.plan_and_build(&[Arc::clone(&t1)]).remove(0);
        let c2 = ctx.plan_and_build(&[Arc::clone(&t2)]).remove(0);
        let mut p = Pending::default();
        p.push(Job::PlanAndBuild(vec![Arc::clone(&t1)]));
        p.push(Job::Promote(Arc::clone(&t2), Arc::clone(&c2)));
        p.push(Job::Promote(Arc::clone(&t1), Arc::clone(&c1)));
        // Queued twice, promoted once.
        p.push(Job::Promote(Arc::clone(&t2), Arc::clone(&c2)));
        assert_eq!(p.len(), 3);
        assert!(Arc::ptr_eq(promote_target(&p.pop()).unwrap(), &t2));
        assert!(Arc::ptr_eq(promote_target(&p.pop()).unwrap(), &t1));
        assert!(matches!(p.pop(), Some(Job::PlanAndBuild(_))));
        assert!(p.pop().is_none());
    }

    #[test]
    fn queued_plans_are_built() {
        let ctx = ctx();
        let t = hot_target(&ctx);
        ctx.queue_plan_and_build(vec![Arc::clone(&t)]);
        for _ in 0..1000 {
            if t.num_candidates() > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(t.num_candidates(), 1);
        ctx.shutdown();
    }
}
