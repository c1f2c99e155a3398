//! Job name templating
//!
//! Renders `{tag}` templates, sanitizes the result to the characters the
//! scheduler accepts, and truncates long names with a short content hash so
//! that names sharing a long prefix stay distinct.

use crate::error::{ParacoreError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name used when sanitizing leaves nothing
pub const FALLBACK_JOB_NAME: &str = "paracore-job";

/// Length of the hex hash appended to truncated names
const HASH_SUFFIX_LEN: usize = 6;

/// Renders and bounds job names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameTemplater {
    max_len: usize,
}

impl NameTemplater {
    /// Create a templater; `max_len` must leave room for `-` plus the hash
    pub fn new(max_len: usize) -> Result<Self> {
        if max_len < HASH_SUFFIX_LEN + 2 {
            return Err(ParacoreError::config(format!(
                "max_len must be at least {}",
                HASH_SUFFIX_LEN + 2
            )));
        }
        Ok(Self { max_len })
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Render `template` with `tags` into a scheduler-safe name
    pub fn render(&self, template: &str, tags: &BTreeMap<String, String>) -> Result<String> {
        let rendered = substitute(template, tags)?;
        Ok(self.bound(&rendered))
    }

    /// Sanitize and truncate an already rendered name
    pub fn bound(&self, rendered: &str) -> String {
        let name = sanitize(rendered);
        if name.len() <= self.max_len {
            return name;
        }

        let keep = self.max_len - HASH_SUFFIX_LEN - 1;
        let prefix = name[..keep].trim_end_matches('-');
        format!("{}-{}", prefix, short_hash(rendered))
    }
}

/// Fill `{tag}` placeholders; `{{` and `}}` produce literal braces
pub fn substitute(template: &str, tags: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut tag = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    tag.push(c);
                }
                if !closed {
                    return Err(ParacoreError::config(format!(
                        "unterminated placeholder in job name template '{}'",
                        template
                    )));
                }
                let value = tags.get(tag.trim()).ok_or_else(|| {
                    ParacoreError::config(format!(
                        "job name template references unknown tag '{}'",
                        tag
                    ))
                })?;
                out.push_str(value);
            }
            '}' => {
                return Err(ParacoreError::config(format!(
                    "unmatched '}}' in job name template '{}'",
                    template
                )));
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

/// Replace disallowed characters with `-`, collapse dash runs, trim dashes
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        FALLBACK_JOB_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

fn short_hash(input: &str) -> String {
    let digest = xxhash_rust::xxh3::xxh3_64(input.as_bytes());
    let mut encoded = hex::encode(digest.to_be_bytes());
    encoded.truncate(HASH_SUFFIX_LEN);
    encoded
}

/// Local hostname for the `{host}` tag
pub fn host_tag() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| h.split('.').next().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Stdout/stderr path patterns for a job; arrays encode `%A` and `%a`
pub fn output_paths(log_dir: &Path, job_name: &str, array: bool) -> (PathBuf, PathBuf) {
    let stem = if array {
        format!("{}_%A_%a", job_name)
    } else {
        format!("{}_%j", job_name)
    };
    (
        log_dir.join(format!("{}.out", stem)),
        log_dir.join(format!("{}.err", stem)),
    )
}

/// Expand `%j`, `%A`, `%a` and `%%` the way the scheduler does
pub fn expand_pattern(pattern: &Path, job_id: &str, array_job_id: Option<&str>, index: Option<usize>) -> PathBuf {
    let text = pattern.to_string_lossy();
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('j') => out.push_str(job_id),
            Some('A') => out.push_str(array_job_id.unwrap_or(job_id)),
            Some('a') => match index {
                Some(i) => out.push_str(&i.to_string()),
                None => out.push_str("4294967294"),
            },
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    PathBuf::from(out)
}
