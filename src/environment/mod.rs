//! Task environment composition
//!
//! The composer never touches the process environment. The parent environment
//! is captured once into a [`ParentEnvironment`] snapshot and passed in.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the overlay combines with the parent environment
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Parent snapshot plus overlay, overlay wins
    #[default]
    Inherit,
    /// Overlay only
    Replace,
}

/// Snapshot of the submitting process environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentEnvironment {
    vars: BTreeMap<String, String>,
}

impl ParentEnvironment {
    /// Capture the current process environment; non-UTF-8 entries are skipped
    pub fn capture() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// The environment a task starts in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentSpec {
    pub mode: MergeMode,
    /// Full effective variable set
    pub variables: BTreeMap<String, String>,
    /// Caller-supplied variables only
    pub overlay: BTreeMap<String, String>,
    /// Command run once at task start, before the payload
    pub env_setup: Option<String>,
}

impl EnvironmentSpec {
    /// Whether the task should see the scheduler's inherited environment
    pub fn inherits(&self) -> bool {
        self.mode == MergeMode::Inherit
    }
}

/// Computes effective task environments
pub struct EnvironmentComposer;

impl EnvironmentComposer {
    /// Compose the task environment from a parent snapshot and an overlay
    pub fn compose(
        parent: &ParentEnvironment,
        mode: MergeMode,
        overlay: &BTreeMap<String, String>,
        env_setup: Option<&str>,
    ) -> EnvironmentSpec {
        let mut variables = match mode {
            MergeMode::Inherit => parent.vars.clone(),
            MergeMode::Replace => BTreeMap::new(),
        };
        variables.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));

        tracing::debug!(
            "Composed {:?} environment with {} variable(s), {} from overlay",
            mode,
            variables.len(),
            overlay.len()
        );

        EnvironmentSpec {
            mode,
            variables,
            overlay: overlay.clone(),
            env_setup: env_setup
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}
