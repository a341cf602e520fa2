// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Startup configuration (§10.3): CLI flags (via `clap`) plus the three
//! environment-variable paths from §6, assembled once into an explicit
//! `Config` record — the "explicit configuration record built at
//! startup" called for in §9, replacing any ad-hoc environment reads
//! scattered through collaborators.
//!
//! Also hosts the routine-file DSL parser (§6): a small, bespoke,
//! line-oriented `key: value` grammar that the ambient crate ecosystem
//! doesn't already provide, returning a typed `RoutineParams` rather than
//! a stringly-typed map.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Routine name or path, resolved against DATA_DIRECTORY/routines.
    #[arg(long)]
    pub routine: String,

    /// Session name; a new session is created if it does not yet exist.
    #[arg(long)]
    pub session: String,

    /// A priori no-op marker, accepted for compatibility.
    #[arg(long, default_value_t = false)]
    pub complete: bool,
}

/// Assembled once at startup from CLI args and environment variables;
/// passed down to every collaborator that needs a path. Nothing reads
/// the environment after this point.
#[derive(Clone, Debug)]
pub struct Config {
    pub routine: String,
    pub session: String,
    pub data_directory: PathBuf,
    pub pipe_in_file: PathBuf,
    pub pipe_out_file: PathBuf,
    /// Opaque sensor-vendor transport library path, passed through to the
    /// sensor driver constructor without interpretation.
    pub producer_path: Option<String>,
}

impl Config {
    pub fn from_args_and_env(args: Args) -> Result<Self, canonical_error::CanonicalError> {
        let data_directory = env_path("DATA_DIRECTORY")?;
        let pipe_in_file = env_path("PIPE_IN_FILE")?;
        let pipe_out_file = env_path("PIPE_OUT_FILE")?;
        let producer_path = std::env::var("PRODUCER_PATH").ok();

        Ok(Config {
            routine: args.routine,
            session: args.session,
            data_directory,
            pipe_in_file,
            pipe_out_file,
            producer_path,
        })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_directory.join("sessions")
    }

    pub fn routines_dir(&self) -> PathBuf {
        self.data_directory.join("routines")
    }

    /// Resolves `--routine` to a file path: a literal path if it exists,
    /// otherwise a case-insensitive, space/underscore-folded match on
    /// filename or declared `name:` within the routines directory, over
    /// files with extension txt/yaml/yml (§4.5 step 1).
    pub fn resolve_routine_path(&self) -> Result<PathBuf, canonical_error::CanonicalError> {
        let literal = PathBuf::from(&self.routine);
        if literal.is_file() {
            return Ok(literal);
        }

        let wanted = fold_name(&self.routine);
        let dir = self.routines_dir();
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            canonical_error::not_found_error(&format!("cannot read routines directory {dir:?}: {e}"))
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let ext_ok = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("txt") | Some("yaml") | Some("yml")
            );
            if !ext_ok {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if fold_name(stem) == wanted {
                    return Ok(path);
                }
            }
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Some(params) = parse_routine_file(&contents).ok().and_then(|p| p.name) {
                    if fold_name(&params) == wanted {
                        return Ok(path);
                    }
                }
            }
        }

        Err(canonical_error::not_found_error(&format!(
            "routine '{}' not found in {dir:?}",
            self.routine
        )))
    }
}

fn fold_name(s: &str) -> String {
    s.trim().to_lowercase().replace(' ', "_")
}

fn env_path(key: &str) -> Result<PathBuf, canonical_error::CanonicalError> {
    std::env::var(key)
        .map(PathBuf::from)
        .map_err(|_| canonical_error::invalid_argument_error(&format!("missing required environment variable {key}")))
}

/// A parsed, typed, validated routine file (§6): the `RoutineParams`
/// struct `Routine::from_params` consumes to build a schedule.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutineParams {
    pub name: Option<String>,
    pub initial_delay_time_secs: Option<f64>,
    pub number_limit: Option<f64>,
    pub time_limit_secs: Option<f64>,
    pub repeat: Option<f64>,
    pub repeat_interval_time_secs: Option<f64>,
    pub interval_mode: Option<String>,
    pub interval_time_secs: Option<f64>,
    pub integration_time_secs: Option<Vec<f64>>,
    pub loop_integration_time: Option<bool>,
    pub gain: Option<Vec<f64>>,
    pub loop_gain: Option<bool>,
    pub all_combinations: Option<bool>,
    pub min_tick_length_secs: Option<f64>,
}

/// One value parsed from the routine-file DSL: float, bool, a
/// single-typed list, or a fallback string.
#[derive(Clone, Debug, PartialEq)]
enum RawValue {
    Number(f64),
    Bool(bool),
    NumberList(Vec<f64>),
    Text(String),
}

fn convert_scalar(token: &str) -> RawValue {
    let token = token.trim();
    if let Ok(n) = token.parse::<f64>() {
        return RawValue::Number(n);
    }
    match token.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" => return RawValue::Bool(true),
        "false" | "f" | "no" | "n" => return RawValue::Bool(false),
        _ => {}
    }
    RawValue::Text(token.to_string())
}

/// Parses a value, rejecting heterogeneous-typed lists at parse time
/// (§9: "enforce a single value type per list").
fn parse_value(value: &str) -> Option<RawValue> {
    let value = value.trim();
    if let Some(inner) = value.strip_prefix('[') {
        let inner = inner.strip_suffix(']')?;
        let mut numbers = Vec::new();
        for item in inner.split(',') {
            match convert_scalar(item) {
                RawValue::Number(n) => numbers.push(n),
                _ => return None, // non-numeric list elements are not supported downstream
            }
        }
        return Some(RawValue::NumberList(numbers));
    }
    Some(convert_scalar(value))
}

fn parse_line(line: &str) -> Option<(String, RawValue)> {
    let line = line.trim();
    if line.starts_with('#') || line.is_empty() || !line.contains(':') {
        return None;
    }
    let line = line.split(" #").next().unwrap_or(line);
    let (key, value) = line.split_once(':')?;
    let key = key.trim().to_lowercase().replace(' ', "_");
    let value = parse_value(value)?;
    Some((key, value))
}

fn seconds_multiplier(unit: &str) -> f64 {
    match unit.to_lowercase().as_str() {
        "hours" | "hour" | "hrs" | "hr" | "hs" | "h" => 3600.0,
        "minutes" | "minute" | "mins" | "min" | "m" => 60.0,
        "seconds" | "second" | "sec" | "secs" | "s" => 1.0,
        "milliseconds" | "millisecond" | "ms" => 1.0 / 1000.0,
        "microseconds" | "microsecond" | "us" => 1.0 / 1_000_000.0,
        _ => 1.0,
    }
}

/// Parses the full routine-file DSL (§6) into a typed `RoutineParams`.
pub fn parse_routine_file(contents: &str) -> Result<RoutineParams, canonical_error::CanonicalError> {
    let mut raw: HashMap<String, RawValue> = HashMap::new();
    for line in contents.lines() {
        if let Some((key, value)) = parse_line(line) {
            raw.insert(key, value);
        }
    }

    let default_unit = match raw.get("default_time_unit") {
        Some(RawValue::Text(s)) => s.clone(),
        _ => "s".to_string(),
    };

    let time_field = |base: &str| -> Option<f64> {
        let unit_key = format!("{base}_unit");
        let unit = match raw.get(&unit_key) {
            Some(RawValue::Text(s)) => s.clone(),
            _ => default_unit.clone(),
        };
        let multiplier = seconds_multiplier(&unit);
        match raw.get(&format!("{base}_secs")).or_else(|| raw.get(base)) {
            Some(RawValue::Number(n)) => Some(n * multiplier),
            _ => None,
        }
    };

    let time_list_field = |base: &str| -> Option<Vec<f64>> {
        let unit_key = format!("{base}_unit");
        let unit = match raw.get(&unit_key) {
            Some(RawValue::Text(s)) => s.clone(),
            _ => default_unit.clone(),
        };
        let multiplier = seconds_multiplier(&unit);
        match raw.get(base) {
            Some(RawValue::Number(n)) => Some(vec![n * multiplier]),
            Some(RawValue::NumberList(list)) => Some(list.iter().map(|v| v * multiplier).collect()),
            _ => None,
        }
    };

    let bool_field = |key: &str| -> Option<bool> {
        match raw.get(key) {
            Some(RawValue::Bool(b)) => Some(*b),
            _ => None,
        }
    };

    let number_field = |key: &str| -> Option<f64> {
        match raw.get(key) {
            Some(RawValue::Number(n)) => Some(*n),
            _ => None,
        }
    };

    let number_list_field = |key: &str| -> Option<Vec<f64>> {
        match raw.get(key) {
            Some(RawValue::Number(n)) => Some(vec![*n]),
            Some(RawValue::NumberList(list)) => Some(list.clone()),
            _ => None,
        }
    };

    let name = match raw.get("name") {
        Some(RawValue::Text(s)) => Some(s.clone()),
        _ => None,
    };

    let interval_mode = match raw.get("interval_mode") {
        Some(RawValue::Text(s)) => Some(s.clone()),
        _ => None,
    };

    Ok(RoutineParams {
        name,
        initial_delay_time_secs: time_field("initial_delay_time"),
        number_limit: number_field("number_limit"),
        time_limit_secs: time_field("time_limit"),
        repeat: number_field("repeat"),
        repeat_interval_time_secs: time_field("repeat_interval_time"),
        interval_mode,
        interval_time_secs: time_field("interval_time"),
        integration_time_secs: time_list_field("integration_time"),
        loop_integration_time: bool_field("loop_integration_time"),
        gain: number_list_field("gain"),
        loop_gain: bool_field("loop_gain"),
        all_combinations: bool_field("all_combinations"),
        min_tick_length_secs: time_field("min_tick_length"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_scalar_fields() {
        let params = parse_routine_file("name: test routine\nnumber_limit: 10\n").unwrap();
        assert_eq!(params.name.as_deref(), Some("test routine"));
        assert_eq!(params.number_limit, Some(10.0));
    }

    #[test]
    fn test_parse_list_field() {
        let params = parse_routine_file("integration_time: [0.1, 0.2, 0.3]\n").unwrap();
        assert_eq!(params.integration_time_secs, Some(vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn test_parse_bool_field() {
        let params = parse_routine_file("all_combinations: true\n").unwrap();
        assert_eq!(params.all_combinations, Some(true));
    }

    #[test]
    fn test_comment_and_blank_lines_ignored() {
        let params = parse_routine_file("# a comment\n\nname: foo\n").unwrap();
        assert_eq!(params.name.as_deref(), Some("foo"));
    }

    #[test]
    fn test_inline_comment_stripped() {
        let params = parse_routine_file("number_limit: 5 # max images\n").unwrap();
        assert_eq!(params.number_limit, Some(5.0));
    }

    #[test]
    fn test_time_unit_conversion() {
        let params = parse_routine_file("time_limit: 2\ntime_limit_unit: min\n").unwrap();
        assert_eq!(params.time_limit_secs, Some(120.0));
    }

    #[test]
    fn test_default_time_unit_applies_to_all_time_fields() {
        let params = parse_routine_file("default_time_unit: min\ninterval_time: 1\n").unwrap();
        assert_eq!(params.interval_time_secs, Some(60.0));
    }

    #[test]
    fn test_heterogeneous_list_rejected() {
        assert_eq!(parse_value("[1, true]"), None);
    }

    #[test]
    fn test_fold_name_matches_case_and_spaces() {
        assert_eq!(fold_name("My Routine"), fold_name("my_routine"));
    }
}
