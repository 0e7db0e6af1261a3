//! Glob-style key patterns for cursor scans.
//!
//! Syntax: `*` matches any run of characters, `?` matches one character and
//! `\` escapes the next character. There are no character classes.

use crate::core::{Result, StoreError};
use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const REGEX_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(200) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

lazy_static::lazy_static! {
    static ref REGEX_LRU_CACHE: Arc<Mutex<LruCache<String, Arc<Regex>>>> =
        Arc::new(Mutex::new(LruCache::new(REGEX_CACHE_CAPACITY)));
}

/// Convert a glob pattern to an anchored regex
#[inline]
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                regex.push_str(&regex::escape(&chars[i].to_string()));
            }
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    regex.push('$');
    regex
}

fn has_wildcards(pattern: &str) -> bool {
    pattern.contains(['*', '?', '\\'])
}

/// Fast path for simple patterns (no regex)
#[inline]
fn fast_path_glob(text: &str, pattern: &str) -> Option<bool> {
    // 1. Exact match
    if !has_wildcards(pattern) {
        return Some(text == pattern);
    }

    // 2. "prefix*"
    if let Some(prefix) = pattern.strip_suffix('*') {
        if !has_wildcards(prefix) {
            return Some(text.starts_with(prefix));
        }
    }

    None
}

fn get_or_compile_regex(pattern: &str) -> Result<Arc<Regex>> {
    {
        let mut cache = REGEX_LRU_CACHE.lock()?;
        if let Some(regex) = cache.get(pattern) {
            return Ok(Arc::clone(regex));
        }
    }

    let compiled = Regex::new(&glob_to_regex(pattern))
        .map_err(|e| StoreError::InvalidKey(format!("Invalid key pattern '{}': {}", pattern, e)))?;
    let compiled_arc = Arc::new(compiled);

    {
        let mut cache = REGEX_LRU_CACHE.lock()?;
        cache.put(pattern.to_string(), Arc::clone(&compiled_arc));
    }

    Ok(compiled_arc)
}

/// Test `text` against a glob `pattern`
#[inline]
pub fn glob_match(text: &str, pattern: &str) -> Result<bool> {
    if let Some(result) = fast_path_glob(text, pattern) {
        return Ok(result);
    }

    let regex = get_or_compile_regex(pattern)?;
    Ok(regex.is_match(text))
}

/// Escape glob metacharacters so `literal` only matches itself
pub fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
