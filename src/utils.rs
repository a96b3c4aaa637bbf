//! Deterministic canonicalization of task names and parameter sets.
//!
//! Parameterized tasks can be spelled in any key order at the declaration
//! site; everything that feeds the identity hash or a display name goes
//! through these functions first so that structurally identical inputs
//! produce byte-identical output.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use camino::Utf8Path;

/// Parameter mapping bound to a task. A `None` value denotes a bare flag.
pub type Params = BTreeMap<String, Option<String>>;

/// Canonical sorted list of `key` or `key=value` strings.
pub fn stable_params(params: &Params) -> Vec<String> {
    params
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{key}={value}"),
            None => key.clone(),
        })
        .collect()
}

/// Canonical display name: `name` or `name:key1=val1,key2` with keys sorted.
pub fn format_task_name(name: &str, params: &Params) -> String {
    if params.is_empty() {
        return name.to_string();
    }

    format!("{}:{}", name, stable_params(params).join(","))
}

/// Parse a free-form task name with an optional `:params` suffix.
///
/// A parameter token without `=` denotes a flag with no value. Tokens with
/// an empty key are dropped.
pub fn parse_task_name(input: &str) -> (String, Params) {
    let Some((name, params)) = input.split_once(':') else {
        return (input.to_string(), Params::new());
    };

    let params = params
        .split(',')
        .filter_map(|token| match token.split_once('=') {
            Some(("", _)) => None,
            Some((key, value)) => Some((key.to_string(), Some(value.to_string()))),
            None if token.is_empty() => None,
            None => Some((token.to_string(), None)),
        })
        .collect();

    (name.to_string(), params)
}

/// Scoped working directory change, restored on drop even on the error path.
pub(crate) struct ScopedCwd {
    previous: PathBuf,
}

impl ScopedCwd {
    pub(crate) fn enter(dir: &Utf8Path) -> io::Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for ScopedCwd {
    fn drop(&mut self) {
        // Nothing sensible to do if the original directory vanished.
        let _ = std::env::set_current_dir(&self.previous);
    }
}
