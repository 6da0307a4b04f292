//! Tracer configuration, either built in code or read from `ALLOC_TRACE_*`
//! environment variables by the preload shim.

use log::warn;

use crate::error::{Result, TraceError};

/// Hard upper bound on captured return addresses per event.
pub const MAX_BACKTRACE_DEPTH: usize = 8;

pub const ENV_OUTPUT: &str = "ALLOC_TRACE_OUTPUT";
pub const ENV_BUFFER: &str = "ALLOC_TRACE_BUFFER";
pub const ENV_DEPTH: &str = "ALLOC_TRACE_DEPTH";
pub const ENV_RESOLVE: &str = "ALLOC_TRACE_RESOLVE";
pub const ENV_CRASH_HANDLER: &str = "ALLOC_TRACE_CRASH_HANDLER";
pub const ENV_LOG: &str = "ALLOC_TRACE_LOG";

/// Placeholder in [`ENV_OUTPUT`] that is replaced with the process id.
pub const PID_PLACEHOLDER: &str = "{pid}";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceConfig {
    /// How many events are buffered before a flush is forced
    pub buffer_capacity: usize,
    /// How many return addresses each log line carries
    pub backtrace_depth: usize,
    /// Symbolize return addresses with `dladdr()` when flushing
    pub resolve_symbols: bool,
}

impl TraceConfig {
    pub const DEFAULT: Self = Self {
        buffer_capacity: 100_000,
        backtrace_depth: 2,
        resolve_symbols: false,
    };

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(TraceError::InvalidConfig("buffer capacity must be non-zero"));
        }
        if self.backtrace_depth > MAX_BACKTRACE_DEPTH {
            return Err(TraceError::InvalidConfig("backtrace depth must be at most 8"));
        }
        Ok(())
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Settings for the `LD_PRELOAD` entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvSettings {
    /// Where to trace to, with [`PID_PLACEHOLDER`] already expanded. Tracing
    /// only starts automatically when this is set.
    pub output: Option<String>,
    pub config: TraceConfig,
    pub crash_handler: bool,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), std::process::id())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, pid: u32) -> Self {
        let mut config = TraceConfig::DEFAULT;
        if let Some(capacity) = parse_var(&lookup, ENV_BUFFER) {
            config.buffer_capacity = capacity;
        }
        if let Some(depth) = parse_var(&lookup, ENV_DEPTH) {
            config.backtrace_depth = depth;
        }
        if let Some(resolve) = flag_var(&lookup, ENV_RESOLVE) {
            config.resolve_symbols = resolve;
        }
        Self {
            output: lookup(ENV_OUTPUT)
                .filter(|s| !s.is_empty())
                .map(|template| expand_output(&template, pid)),
            config,
            crash_handler: flag_var(&lookup, ENV_CRASH_HANDLER).unwrap_or(true),
        }
    }
}

pub fn expand_output(template: &str, pid: u32) -> String {
    template.replace(PID_PLACEHOLDER, &pid.to_string())
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!("ignoring {key}={raw:?}: not a number");
            None
        }
    }
}

fn flag_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring {key}={raw:?}: expected a boolean");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> EnvSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvSettings::from_lookup(|k| vars.get(k).cloned(), 4242)
    }

    #[test]
    fn defaults_match_the_classic_tracer() {
        let s = settings(&[]);
        assert_eq!(s.output, None);
        assert_eq!(s.config.buffer_capacity, 100_000);
        assert_eq!(s.config.backtrace_depth, 2);
        assert!(!s.config.resolve_symbols);
        assert!(s.crash_handler);
    }

    #[test]
    fn pid_placeholder_is_expanded() {
        let s = settings(&[(ENV_OUTPUT, "/tmp/malloc_trace.{pid}.log")]);
        assert_eq!(s.output.as_deref(), Some("/tmp/malloc_trace.4242.log"));
    }

    #[test]
    fn overrides_are_parsed_and_garbage_ignored() {
        let s = settings(&[
            (ENV_BUFFER, "64"),
            (ENV_DEPTH, "lots"),
            (ENV_RESOLVE, "on"),
            (ENV_CRASH_HANDLER, "0"),
        ]);
        assert_eq!(s.config.buffer_capacity, 64);
        assert_eq!(s.config.backtrace_depth, 2);
        assert!(s.config.resolve_symbols);
        assert!(!s.crash_handler);
    }

    #[test]
    fn validation_rejects_degenerate_configs() {
        let mut c = TraceConfig::DEFAULT;
        assert!(c.validate().is_ok());
        c.backtrace_depth = MAX_BACKTRACE_DEPTH + 1;
        assert!(c.validate().is_err());
        c.backtrace_depth = 0;
        c.buffer_capacity = 0;
        assert!(c.validate().is_err());
    }
}
