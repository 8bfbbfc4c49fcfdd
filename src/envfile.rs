//! `.env` loading. Values already present in the process environment win.
//!
//! Supported syntax: `KEY=value`, optional `export ` prefix, `#` comments, and
//! single- or double-quoted values (double quotes understand `\n`, `\t`, `\r`,
//! `\\` and `\"`).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    /// Given with `--env-file` rather than picked up from the working directory.
    pub explicit: bool,
}

/// Loads `explicit` if given (it must exist), else `./.env` when present.
pub fn load(explicit: Option<&Path>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        apply(path)?;
        return Ok(Some(LoadedEnvFile {
            path: path.to_path_buf(),
            explicit: true,
        }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    apply(&default_path)?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
    }))
}

fn apply(path: &Path) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    for (key, value) in parse(BufReader::new(file)).map_err(|e| format!("{}:{}", path.display(), e))? {
        if std::env::var_os(&key).is_none() {
            // SAFETY: called from main before any other thread is started.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parses all assignments; errors are prefixed with the 1-based line number.
pub fn parse(reader: impl BufRead) -> Result<Vec<(String, String)>, String> {
    let mut vars = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("{}: read failed: {}", index + 1, e))?;
        if let Some(assignment) = parse_line(&line).map_err(|e| format!("{}: {}", index + 1, e))? {
            vars.push(assignment);
        }
    }
    Ok(vars)
}

fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let body = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);

    let (key, raw_value) = body.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_value(raw_value)?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let value = raw.trim();
    if let Some(rest) = value.strip_prefix('"') {
        double_quoted(rest)
    } else if let Some(rest) = value.strip_prefix('\'') {
        single_quoted(rest)
    } else {
        let unquoted = value.split_once('#').map(|(v, _)| v).unwrap_or(value);
        Ok(unquoted.trim_end().to_string())
    }
}

fn only_comment_follows(rest: &str, quote: &str) -> Result<(), String> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        Err(format!("unexpected characters after closing {} quote", quote))
    }
}

fn double_quoted(input: &str) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
                out.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            '"' => {
                only_comment_follows(chars.as_str(), "double")?;
                return Ok(out);
            }
            other => out.push(other),
        }
    }
    Err("unterminated double-quoted value".to_string())
}

fn single_quoted(input: &str) -> Result<String, String> {
    let (value, rest) = input
        .split_once('\'')
        .ok_or_else(|| "unterminated single-quoted value".to_string())?;
    only_comment_follows(rest, "single")?;
    Ok(value.to_string())
}
