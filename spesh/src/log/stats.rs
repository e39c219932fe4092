//! Statistics about the specializer, grouped by the pipeline [Stage] they belong to.
//!
//! Collection is enabled by `SPESH_LOG_STATS=<path|->`, and always in tests. The statistics are
//! written as JSON when the owning context is dropped: one object per stage, holding its counters,
//! how many times the stage ran and the wall-clock time spent in it.

use parking_lot::Mutex;
#[cfg(not(test))]
use std::env;
use std::{
    fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// A part of the pipeline that is timed, and that counters are reported under.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
pub(crate) enum Stage {
    #[strum(to_string = "planning")]
    Planning,
    #[strum(to_string = "building")]
    Building,
    #[strum(to_string = "optimizing")]
    Optimizing,
    #[strum(to_string = "deopting")]
    Deopting,
}

/// The events that statistics count. Each variant's `to_string` is its JSON key.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
pub(crate) enum Counter {
    #[strum(to_string = "candidates_planned")]
    CandidatesPlanned,
    #[strum(to_string = "candidates_built")]
    CandidatesBuilt,
    #[strum(to_string = "candidates_installed")]
    CandidatesInstalled,
    #[strum(to_string = "candidates_discarded")]
    CandidatesDiscarded,
    #[strum(to_string = "candidates_promoted")]
    CandidatesPromoted,
    #[strum(to_string = "deopt_one")]
    DeoptOne,
    #[strum(to_string = "deopt_all_frames")]
    DeoptAll,
    #[strum(to_string = "allocations_replaced")]
    AllocationsReplaced,
    #[strum(to_string = "guards_eliminated")]
    GuardsEliminated,
    #[strum(to_string = "dispatch_unguarded")]
    DispatchUnguarded,
    #[strum(to_string = "dispatch_monomorphic")]
    DispatchMonomorphic,
    #[strum(to_string = "dispatch_polymorphic")]
    DispatchPolymorphic,
    #[strum(to_string = "inlines")]
    Inlines,
}

impl Counter {
    fn stage(self) -> Stage {
        match self {
            Counter::CandidatesPlanned => Stage::Planning,
            Counter::CandidatesBuilt
            | Counter::CandidatesInstalled
            | Counter::CandidatesDiscarded => Stage::Building,
            Counter::CandidatesPromoted
            | Counter::AllocationsReplaced
            | Counter::GuardsEliminated
            | Counter::DispatchUnguarded
            | Counter::DispatchMonomorphic
            | Counter::DispatchPolymorphic
            | Counter::Inlines => Stage::Optimizing,
            Counter::DeoptOne | Counter::DeoptAll => Stage::Deopting,
        }
    }
}

pub(crate) struct Stats {
    /// `None` if statistics are disabled, so the common case costs one check and no locking.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// Where to write output. `-` means stderr.
    output_path: String,
    counters: [u64; Counter::COUNT],
    runs: [u64; Stage::COUNT],
    durations: [Duration; Stage::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub(crate) fn new() -> Self {
        Self {
            inner: env::var("SPESH_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// Increment `counter` by one.
    pub(crate) fn count(&self, counter: Counter) {
        self.count_n(counter, 1);
    }

    pub(crate) fn count_n(&self, counter: Counter, n: u64) {
        if let (Some(mtx), true) = (&self.inner, n > 0) {
            mtx.lock().counters[counter as usize] += n;
        }
    }

    /// The current value of `counter`, or `None` if statistics are disabled.
    pub(crate) fn get(&self, counter: Counter) -> Option<u64> {
        self.inner
            .as_ref()
            .map(|mtx| mtx.lock().counters[counter as usize])
    }

    /// Time a run of `stage`, which lasts until the returned timer is dropped.
    pub(crate) fn time(&self, stage: Stage) -> StageTimer<'_> {
        StageTimer {
            stats: self,
            stage,
            start: self.inner.as_ref().map(|_| Instant::now()),
        }
    }

    /// Write these statistics to the output path, if statistics are enabled.
    pub(crate) fn output(&self) {
        if let Some(mtx) = &self.inner {
            let inner = mtx.lock();
            let json = inner.to_json();
            if inner.output_path == "-" {
                eprintln!("{json}");
            } else {
                fs::write(&inner.output_path, json).ok();
            }
        }
    }
}

/// A run of a [Stage] in progress. See [Stats::time].
pub(crate) struct StageTimer<'a> {
    stats: &'a Stats,
    stage: Stage,
    start: Option<Instant>,
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        if let (Some(mtx), Some(start)) = (&self.stats.inner, self.start) {
            let mut inner = mtx.lock();
            let i = self.stage as usize;
            inner.runs[i] += 1;
            inner.durations[i] = inner.durations[i].saturating_add(start.elapsed());
        }
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            counters: [0; Counter::COUNT],
            runs: [0; Stage::COUNT],
            durations: [Duration::ZERO; Stage::COUNT],
        }
    }

    /// One JSON object per stage, with stages and their fields sorted by name so that output can
    /// be matched textually.
    fn to_json(&self) -> String {
        let mut stages = Stage::iter()
            .map(|s| {
                let d = self.durations[s as usize];
                let mut fields = vec![
                    (
                        "duration".to_owned(),
                        format!("{}.{:03}", d.as_secs(), d.subsec_millis()),
                    ),
                    ("runs".to_owned(), self.runs[s as usize].to_string()),
                ];
                fields.extend(
                    Counter::iter()
                        .filter(|c| c.stage() == s)
                        .map(|c| (c.to_string(), self.counters[c as usize].to_string())),
                );
                fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
                let body = fields
                    .iter()
                    .map(|(k, v)| format!(r#"        "{k}": {v}"#))
                    .collect::<Vec<_>>()
                    .join(",\n");
                (s.to_string(), format!("    \"{s}\": {{\n{body}\n    }}"))
            })
            .collect::<Vec<_>>();
        stages.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            "{{\n{}\n}}",
            stages
                .into_iter()
                .map(|(_, x)| x)
                .collect::<Vec<_>>()
                .join(",\n")
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_and_runs_by_stage() {
        let s = Stats::new();
        s.count(Counter::DeoptOne);
        s.count_n(Counter::GuardsEliminated, 3);
        s.count_n(Counter::Inlines, 0);
        assert_eq!(s.get(Counter::DeoptOne), Some(1));
        assert_eq!(s.get(Counter::Inlines), Some(0));
        drop(s.time(Stage::Deopting));
        {
            let _t = s.time(Stage::Deopting);
            s.count(Counter::DeoptOne);
        }
        let json = s.inner.as_ref().unwrap().lock().to_json();
        assert_eq!(
            json.lines()
                .filter(|l| l.ends_with('{') && l.starts_with("    \""))
                .map(|l| l.trim())
                .collect::<Vec<_>>(),
            [
                r#""building": {"#,
                r#""deopting": {"#,
                r#""optimizing": {"#,
                r#""planning": {"#
            ]
        );
        let deopting = json
            .split(r#""deopting": {"#)
            .nth(1)
            .and_then(|x| x.split('}').next())
            .unwrap();
        assert!(deopting.contains(r#""deopt_one": 2"#));
        assert!(deopting.contains(r#""runs": 2"#));
        assert!(!deopting.contains("guards_eliminated"));
        assert!(json.contains(r#""guards_eliminated": 3"#));
    }

    #[test]
    fn every_counter_is_output() {
        let json = Stats::new().inner.unwrap().into_inner().to_json();
        for c in Counter::iter() {
            assert!(json.contains(&format!("\"{c}\": 0")), "{c}");
        }
    }
}
