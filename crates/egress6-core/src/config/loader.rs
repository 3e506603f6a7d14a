//! Environment loading helpers
//!
//! Keeps the fallback chain in one place instead of repeating `or_else` at
//! every call site.

use std::env;
use std::path::Path;

/// Load `./.env` into the environment once. Variables already set win.
pub fn load_dotenv() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let dir = env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
        load_dotenv_from_dir(&dir);
    });
}

/// Load `<dir>/.env`, skipping comments, blank lines and keys that are
/// already present in the environment. Returns the number of keys set.
pub fn load_dotenv_from_dir(dir: &Path) -> usize {
    let Ok(content) = std::fs::read_to_string(dir.join(".env")) else {
        return 0;
    };
    let mut loaded = 0;
    for line in content.lines() {
        let Some((key, value)) = parse_dotenv_line(line) else {
            continue;
        };
        if env::var(key).is_err() {
            set_env_var(key, value);
            loaded += 1;
        }
    }
    loaded
}

fn parse_dotenv_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let mut value = value.trim();
    // Strip inline comment (# not inside quotes)
    if let Some(hash_pos) = value.find('#') {
        let before_hash = value[..hash_pos].trim_end();
        if !before_hash.contains('"') && !before_hash.contains('\'') {
            value = before_hash;
        }
    }
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        value = &value[1..value.len() - 1];
    }
    if key.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

/// First non-blank value among `primary` and its aliases, trimmed.
fn lookup(primary: &str, aliases: &[&str]) -> Option<String> {
    std::iter::once(primary)
        .chain(aliases.iter().copied())
        .filter_map(|key| env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Read `primary`, then each alias; blank values count as unset.
pub fn env_or<F>(primary: &str, aliases: &[&str], default: F) -> String
where
    F: FnOnce() -> String,
{
    lookup(primary, aliases).unwrap_or_else(default)
}

/// Boolean env var: 0/false/no/off are false, anything else set is true.
pub fn env_bool(primary: &str, aliases: &[&str], default: bool) -> bool {
    match lookup(primary, aliases) {
        Some(s) => !matches!(s.to_lowercase().as_str(), "0" | "false" | "no" | "off"),
        None => default,
    }
}

// SAFETY convention: only called before the tokio runtime starts.
#[allow(unsafe_code)]
fn set_env_var(key: &str, value: &str) {
    unsafe { env::set_var(key, value) };
}
