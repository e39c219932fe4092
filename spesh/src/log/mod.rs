//! Diagnostic output: the `SPESH_LOG` message log and the `SPESH_LOG_IR` candidate dumps.
//!
//! `SPESH_LOG=[<path|->:]<level>` selects the most verbose [Verbosity] written. `SPESH_LOG_IR=
//! [<path|->:]<phase>[,...,<phase>]` requests a dump of every candidate at each named [IRPhase].
//! Without a path, or with `-`, output goes to stderr.

use parking_lot::Mutex;
use std::{collections::HashSet, env, error::Error, fs::File, io::Write, str::FromStr};
use strum::{EnumCount, EnumString, FromRepr};

pub(crate) mod stats;

/// How verbose should the engine's message log be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    Error,
    Warning,
    /// Candidates being planned, skipped, built, installed, discarded, and promoted.
    CandidateEvent,
    /// Optimization decisions, and the restrictions that prevented one.
    OptEvent,
}

impl Verbosity {
    fn prefix(self) -> &'static str {
        match self {
            Verbosity::Disabled => "",
            Verbosity::Error => "spesh-error",
            Verbosity::Warning => "spesh-warning",
            Verbosity::CandidateEvent => "spesh-candidate",
            Verbosity::OptEvent => "spesh-opt",
        }
    }
}

/// The forms of a candidate that can be dumped.
#[derive(Clone, Copy, Debug, EnumString, Eq, Hash, PartialEq, strum::Display)]
pub(crate) enum IRPhase {
    /// The graph after argument guards (and, for a logging body, instrumentation).
    #[strum(to_string = "graph-pre-opt")]
    PreOpt,
    /// The graph after every pass, immediately before code generation.
    #[strum(to_string = "graph-post-opt")]
    PostOpt,
    /// The disassembled optimized body.
    #[strum(to_string = "bytecode")]
    Bytecode,
}

/// Where output goes.
enum Sink {
    Stderr,
    File(Mutex<File>),
}

impl Sink {
    /// Open `path`, where `-` means stderr. A file is truncated so that nothing from a previous
    /// run is left in it.
    fn open(path: &str) -> Result<Self, Box<dyn Error>> {
        if path == "-" {
            return Ok(Sink::Stderr);
        }
        let f = File::create(path).map_err(|e| format!("Can't create log file '{path}': {e}"))?;
        Ok(Sink::File(Mutex::new(f)))
    }

    fn write(&self, s: &str) {
        match self {
            Sink::Stderr => eprint!("{s}"),
            Sink::File(f) => {
                f.lock().write_all(s.as_bytes()).ok();
            }
        }
    }
}

/// Split `[<path>:]<rest>`. A missing path is `-`.
fn split_path(s: &str) -> Option<(&str, &str)> {
    match s.split(':').collect::<Vec<_>>()[..] {
        [path, rest] => Some((path, rest)),
        [rest] => Some(("-", rest)),
        _ => None,
    }
}

pub(crate) struct Log {
    level: Verbosity,
    sink: Sink,
    /// Where candidate dumps go, and which phases were requested.
    ir: Option<(Sink, HashSet<IRPhase>)>,
}

impl Log {
    /// A log configured from `SPESH_LOG` and `SPESH_LOG_IR`.
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        Self::parse(
            env::var("SPESH_LOG").ok().as_deref(),
            env::var("SPESH_LOG_IR").ok().as_deref(),
        )
    }

    fn parse(log: Option<&str>, ir: Option<&str>) -> Result<Self, Box<dyn Error>> {
        let (sink, level) = match log {
            Some(s) => {
                let (path, level) = split_path(s)
                    .ok_or("SPESH_LOG must be of the format `[<path|->:]<level>`")?;
                let level = level
                    .parse::<u8>()
                    .map_err(|e| format!("Invalid SPESH_LOG level '{s}': {e}"))?;
                let level = Verbosity::from_repr(level).ok_or_else(|| {
                    format!(
                        "SPESH_LOG level {level} exceeds maximum {}",
                        Verbosity::COUNT - 1
                    )
                })?;
                (Sink::open(path)?, level)
            }
            None => (Sink::Stderr, Verbosity::Error),
        };
        let ir = match ir {
            Some(s) => {
                let (path, phases) = split_path(s)
                    .ok_or("SPESH_LOG_IR must be of the format `[<path|->:]<phase>[,...]`")?;
                let phases = phases
                    .split(',')
                    .map(|p| {
                        IRPhase::from_str(p)
                            .map_err(|_| format!("Invalid SPESH_LOG_IR phase '{p}'"))
                    })
                    .collect::<Result<HashSet<_>, _>>()?;
                Some((Sink::open(path)?, phases))
            }
            None => None,
        };
        Ok(Self { level, sink, ir })
    }

    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self {
            level: Verbosity::Disabled,
            sink: Sink::Stderr,
            ir: None,
        }
    }

    /// Would a message at `level` be written?
    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` at `level`. Messages at [Verbosity::Disabled] are never written.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if self.enabled(level) {
            self.sink.write(&format!("{}: {msg}\n", level.prefix()));
        }
    }

    /// Was a dump of `phase` requested? Lets callers skip building an expensive dump.
    pub(crate) fn should_log_ir(&self, phase: IRPhase) -> bool {
        self.ir
            .as_ref()
            .is_some_and(|(_, phases)| phases.contains(&phase))
    }

    /// Dump `s`, the `phase` form of a candidate of `target`, if that phase was requested.
    pub(crate) fn log_ir(&self, phase: IRPhase, target: &str, s: &str) {
        if let Some((sink, phases)) = &self.ir {
            if phases.contains(&phase) {
                sink.write(&format!(
                    "--- Begin {phase}: {target} ---\n{s}--- End {phase} ---\n"
                ));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn parse_levels() {
        let l = Log::parse(Some("3"), None).unwrap();
        assert!(l.enabled(Verbosity::CandidateEvent));
        assert!(!l.enabled(Verbosity::OptEvent));
        assert!(matches!(l.sink, Sink::Stderr));
        let l = Log::parse(Some("-:1"), None).unwrap();
        assert!(l.enabled(Verbosity::Error));
        assert!(!l.enabled(Verbosity::Warning));
        assert!(Log::parse(Some("5"), None).is_err());
        assert!(Log::parse(Some("a:b:c"), None).is_err());
        assert!(Log::parse(Some("x"), None).is_err());
        let l = Log::parse(None, None).unwrap();
        assert!(l.enabled(Verbosity::Error));
        assert!(!l.enabled(Verbosity::Warning));
    }

    #[test]
    fn disabled_messages_are_dropped() {
        let l = Log::parse(Some("4"), None).unwrap();
        assert!(!l.enabled(Verbosity::Disabled));
        l.log(Verbosity::Disabled, "never written");
        assert!(!Log::disabled().enabled(Verbosity::Error));
    }

    #[test]
    fn ir_phases() {
        let l = Log::parse(None, Some("graph-post-opt,bytecode")).unwrap();
        assert!(!l.should_log_ir(IRPhase::PreOpt));
        assert!(l.should_log_ir(IRPhase::PostOpt));
        assert!(l.should_log_ir(IRPhase::Bytecode));
        assert!(!Log::parse(None, None).unwrap().should_log_ir(IRPhase::Bytecode));
        assert!(Log::parse(None, Some("jit-asm")).is_err());
        assert_eq!(IRPhase::PreOpt.to_string(), "graph-pre-opt");
    }

    #[test]
    fn writes_to_files() {
        let dir = env::temp_dir();
        let msgs = dir.join(format!("spesh-log-test-{}", std::process::id()));
        let dumps = dir.join(format!("spesh-log-ir-test-{}", std::process::id()));
        let l = Log::parse(
            Some(&format!("{}:2", msgs.display())),
            Some(&format!("{}:bytecode", dumps.display())),
        )
        .unwrap();
        l.log(Verbosity::Warning, "w");
        l.log(Verbosity::CandidateEvent, "not written");
        l.log_ir(IRPhase::Bytecode, "f", "return_o r0\n");
        l.log_ir(IRPhase::PreOpt, "f", "not written\n");
        drop(l);
        let m = fs::read_to_string(&msgs).unwrap();
        let d = fs::read_to_string(&dumps).unwrap();
        fs::remove_file(&msgs).ok();
        fs::remove_file(&dumps).ok();
        assert_eq!(m, "spesh-warning: w\n");
        assert_eq!(
            d,
            "--- Begin bytecode: f ---\nreturn_o r0\n--- End bytecode ---\n"
        );
    }
}
