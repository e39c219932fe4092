//! Engine configuration, with environment variable overrides.

use std::{cmp, env, error::Error, str::FromStr};

/// Tunables for planning, building, and optimization.
#[derive(Clone, Debug)]
pub struct SpeshConfig {
    /// If true, the planner never produces plans.
    pub disabled: bool,
    /// The hard cap on the number of worker threads.
    pub max_jobs: usize,
    /// How many runs a candidate's logging body makes before it is promoted.
    pub log_runs: u32,
    /// How many candidates a single call target can hold.
    pub max_candidates: usize,
    /// Call targets whose bytecode is larger than this are never planned.
    pub max_bytecode_size: usize,
    /// The percentage of a callsite's hits a type must account for to be specialized on.
    pub arg_type_percent: u32,
    /// The percentage of a dispatch site's hits one outcome must account for to be treated as
    /// monomorphic. The same bar applies to log-guided guards at observation points.
    pub mono_dispatch_percent: u32,
    pub inline: bool,
    pub pea: bool,
    /// The largest callee bytecode, in bytes, that is considered for inlining.
    pub max_inline_size: usize,
    /// Plan everything that has been called at least once, ignoring size-based thresholds.
    pub nodelay: bool,
}

impl Default for SpeshConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            max_jobs: cmp::max(1, num_cpus::get().saturating_sub(1)),
            log_runs: 8,
            max_candidates: 8,
            max_bytecode_size: 65536,
            arg_type_percent: 40,
            mono_dispatch_percent: 99,
            inline: true,
            pea: true,
            max_inline_size: 384,
            nodelay: false,
        }
    }
}

impl SpeshConfig {
    /// The default configuration, overridden by any `SPESH_*` environment variables that are set.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut c = Self::default();
        if let Some(x) = var_bool("SPESH_DISABLE")? {
            c.disabled = x;
        }
        if let Some(x) = var::<usize>("SPESH_JOBS")? {
            c.max_jobs = cmp::max(1, x);
        }
        if let Some(x) = var("SPESH_LOG_RUNS")? {
            c.log_runs = x;
        }
        if let Some(x) = var::<usize>("SPESH_MAX_CANDIDATES")? {
            if x == 0 {
                return Err("SPESH_MAX_CANDIDATES must be at least 1".into());
            }
            c.max_candidates = x;
        }
        if let Some(x) = var("SPESH_MAX_BYTECODE_SIZE")? {
            c.max_bytecode_size = x;
        }
        if let Some(x) = var_percent("SPESH_ARG_TYPE_PERCENT")? {
            c.arg_type_percent = x;
        }
        if let Some(x) = var_percent("SPESH_MONO_DISPATCH_PERCENT")? {
            c.mono_dispatch_percent = x;
        }
        if let Some(x) = var_bool("SPESH_INLINE")? {
            c.inline = x;
        }
        if let Some(x) = var_bool("SPESH_PEA")? {
            c.pea = x;
        }
        if let Some(x) = var("SPESH_MAX_INLINE_SIZE")? {
            c.max_inline_size = x;
        }
        if let Some(x) = var_bool("SPESH_NODELAY")? {
            c.nodelay = x;
        }
        Ok(c)
    }
}

fn var<T: FromStr>(name: &str) -> Result<Option<T>, Box<dyn Error>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(s) => s
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name} '{s}': {e}").into()),
        Err(_) => Ok(None),
    }
}

fn var_bool(name: &str) -> Result<Option<bool>, Box<dyn Error>> {
    match env::var(name).as_deref() {
        Ok("1") | Ok("true") => Ok(Some(true)),
        Ok("0") | Ok("false") => Ok(Some(false)),
        Ok(s) => Err(format!("Invalid value for {name} '{s}': expected 0 or 1").into()),
        Err(_) => Ok(None),
    }
}

fn var_percent(name: &str) -> Result<Option<u32>, Box<dyn Error>> {
    match var::<u32>(name)? {
        Some(x) if x > 100 => Err(format!("{name} must be at most 100, not {x}").into()),
        x => Ok(x),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let c = SpeshConfig::default();
        assert_eq!(c.arg_type_percent, 40);
        assert_eq!(c.mono_dispatch_percent, 99);
        assert_eq!(c.max_inline_size, 384);
        assert!(c.max_jobs >= 1);
    }

    #[test]
    fn bad_values() {
        // Variables nobody else reads, so that tests running in parallel can't interfere.
        env::set_var("SPESH_TEST_PERCENT", "101");
        assert!(var_percent("SPESH_TEST_PERCENT").is_err());
        env::set_var("SPESH_TEST_PERCENT", "40");
        assert_eq!(var_percent("SPESH_TEST_PERCENT").unwrap(), Some(40));
        env::set_var("SPESH_TEST_BOOL", "yes");
        assert!(var_bool("SPESH_TEST_BOOL").is_err());
        assert_eq!(var_bool("SPESH_TEST_UNSET").unwrap(), None);
    }
}
