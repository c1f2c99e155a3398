//! YAML profile documents and layer discovery
//!
//! A profile document mirrors the on-disk configuration file. Every field is
//! optional so that documents can be stacked: built-in defaults, the user
//! profile (`~/.paracore.yaml`) and the project profile (`./paracore.yaml`).

use crate::error::{IoResultExt, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the user-level profile inside the home directory
pub const USER_PROFILE_FILE: &str = ".paracore.yaml";

/// File name of the project-level profile in the working directory
pub const PROJECT_PROFILE_FILE: &str = "paracore.yaml";

/// Environment variable that overrides the project profile location
pub const CONFIG_PATH_ENV: &str = "PARACORE_CONFIG";

/// Name of the cluster defined by the built-in layer
pub const DEFAULT_CLUSTER: &str = "default";

/// Default job name template
pub const DEFAULT_JOB_NAME_TEMPLATE: &str = "{project}-{cluster}-{partition}";

/// Default maximum job name length
pub const DEFAULT_MAX_NAME_LEN: usize = 80;

/// One configuration layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileDocument {
    /// Cluster used when the caller names none
    pub active_cluster: Option<String>,
    /// Job naming settings
    pub naming: NamingProfile,
    /// Orchestration defaults (retries, polling, concurrency)
    pub defaults: DefaultsProfile,
    /// Cluster profiles by name
    pub clusters: BTreeMap<String, ClusterProfile>,
}

/// `naming:` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingProfile {
    /// Template used when the caller supplies no job name
    pub default_job_name: Option<String>,
    /// Maximum rendered name length
    pub max_len: Option<usize>,
    /// Value of the `{project}` tag
    pub project: Option<String>,
}

/// `defaults:` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsProfile {
    /// Retry budget per logical task
    pub retries: Option<u32>,
    /// Base backoff in seconds
    pub retry_backoff_s: Option<f64>,
    /// Treat result timeouts as retryable
    pub retry_on_timeout: Option<bool>,
    /// Seconds between provider polls
    pub poll_interval_s: Option<f64>,
    /// Maximum logical tasks supervised at once by the driver
    pub concurrency: Option<usize>,
    /// Directory for scripts and job logs
    pub log_dir: Option<PathBuf>,
    /// Check the partition exists before submitting
    pub validate_partition: Option<bool>,
}

/// `clusters.<name>:` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterProfile {
    /// Environment setup command run before every task
    pub default_env: Option<String>,
    /// Scratch location advertised to tasks
    pub io_scratch: Option<String>,
    /// Scheduler settings
    pub slurm: SlurmProfile,
}

/// `clusters.<name>.slurm:` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmProfile {
    pub partition: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub cpus_per_task: Option<u32>,
    pub mem_gb: Option<u32>,
    pub time_min: Option<u32>,
    pub max_array_parallelism: Option<u32>,
    pub start_jitter_s: Option<f64>,
    /// Raw scheduler options passed through verbatim
    pub extra: BTreeMap<String, Value>,
}

impl ProfileDocument {
    /// Built-in safe defaults
    pub fn builtin() -> Self {
        let mut clusters = BTreeMap::new();
        clusters.insert(
            DEFAULT_CLUSTER.to_string(),
            ClusterProfile {
                default_env: None,
                io_scratch: Some("$TMPDIR".to_string()),
                slurm: SlurmProfile {
                    partition: Some("compute".to_string()),
                    account: None,
                    qos: None,
                    cpus_per_task: Some(4),
                    mem_gb: Some(16),
                    time_min: Some(60),
                    max_array_parallelism: Some(100),
                    start_jitter_s: Some(0.0),
                    extra: BTreeMap::new(),
                },
            },
        );

        Self {
            active_cluster: Some(DEFAULT_CLUSTER.to_string()),
            naming: NamingProfile {
                default_job_name: Some(DEFAULT_JOB_NAME_TEMPLATE.to_string()),
                max_len: Some(DEFAULT_MAX_NAME_LEN),
                project: Some("paracore".to_string()),
            },
            defaults: DefaultsProfile {
                retries: Some(0),
                retry_backoff_s: Some(30.0),
                retry_on_timeout: Some(false),
                poll_interval_s: Some(5.0),
                concurrency: None,
                log_dir: Some(PathBuf::from("paracore_logs")),
                validate_partition: Some(false),
            },
            clusters,
        }
    }

    /// Parse a profile from YAML text; an empty document is an empty layer
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let doc: Option<Self> = serde_yaml::from_str(text)?;
        Ok(doc.unwrap_or_default())
    }

    /// Load a profile from disk, `None` when the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).with_path(path)?;
        let doc = Self::from_yaml(&text)
            .map_err(|e| e.with_context(format!("parsing profile {}", path.display())))?;
        tracing::debug!("Loaded profile {}", path.display());
        Ok(Some(doc))
    }

    /// Field-by-field merge; values present in `overlay` win
    pub fn merge(self, overlay: ProfileDocument) -> ProfileDocument {
        let mut clusters = self.clusters;
        for (name, cluster) in overlay.clusters {
            let merged = match clusters.remove(&name) {
                Some(base) => base.merge(cluster),
                None => cluster,
            };
            clusters.insert(name, merged);
        }

        ProfileDocument {
            active_cluster: overlay.active_cluster.or(self.active_cluster),
            naming: NamingProfile {
                default_job_name: overlay.naming.default_job_name.or(self.naming.default_job_name),
                max_len: overlay.naming.max_len.or(self.naming.max_len),
                project: overlay.naming.project.or(self.naming.project),
            },
            defaults: DefaultsProfile {
                retries: overlay.defaults.retries.or(self.defaults.retries),
                retry_backoff_s: overlay.defaults.retry_backoff_s.or(self.defaults.retry_backoff_s),
                retry_on_timeout: overlay.defaults.retry_on_timeout.or(self.defaults.retry_on_timeout),
                poll_interval_s: overlay.defaults.poll_interval_s.or(self.defaults.poll_interval_s),
                concurrency: overlay.defaults.concurrency.or(self.defaults.concurrency),
                log_dir: overlay.defaults.log_dir.or(self.defaults.log_dir),
                validate_partition: overlay
                    .defaults
                    .validate_partition
                    .or(self.defaults.validate_partition),
            },
            clusters,
        }
    }
}

impl ClusterProfile {
    fn merge(self, overlay: ClusterProfile) -> ClusterProfile {
        let mut extra = self.slurm.extra;
        extra.extend(overlay.slurm.extra);

        ClusterProfile {
            default_env: overlay.default_env.or(self.default_env),
            io_scratch: overlay.io_scratch.or(self.io_scratch),
            slurm: SlurmProfile {
                partition: overlay.slurm.partition.or(self.slurm.partition),
                account: overlay.slurm.account.or(self.slurm.account),
                qos: overlay.slurm.qos.or(self.slurm.qos),
                cpus_per_task: overlay.slurm.cpus_per_task.or(self.slurm.cpus_per_task),
                mem_gb: overlay.slurm.mem_gb.or(self.slurm.mem_gb),
                time_min: overlay.slurm.time_min.or(self.slurm.time_min),
                max_array_parallelism: overlay
                    .slurm
                    .max_array_parallelism
                    .or(self.slurm.max_array_parallelism),
                start_jitter_s: overlay.slurm.start_jitter_s.or(self.slurm.start_jitter_s),
                extra,
            },
        }
    }
}

/// The ordered profile layers below call-site overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    /// Built-in defaults
    pub builtin: ProfileDocument,
    /// `~/.paracore.yaml`
    pub user: Option<ProfileDocument>,
    /// `./paracore.yaml` or an explicit path
    pub project: Option<ProfileDocument>,
}

impl ConfigLayers {
    /// Only the built-in layer
    pub fn builtin_only() -> Self {
        Self {
            builtin: ProfileDocument::builtin(),
            user: None,
            project: None,
        }
    }

    /// Discover the user and project layers on disk.
    ///
    /// An explicit `project_path` (or `PARACORE_CONFIG`) must exist; the
    /// implicit locations are skipped when absent.
    pub fn discover(project_path: Option<&Path>) -> Result<Self> {
        let user = match std::env::var_os("HOME") {
            Some(home) => ProfileDocument::load(&PathBuf::from(home).join(USER_PROFILE_FILE))?,
            None => None,
        };

        let explicit = project_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let project = match explicit {
            Some(path) => Some(ProfileDocument::load(&path)?.ok_or_else(|| {
                crate::error::ParacoreError::config(format!(
                    "config file {} does not exist",
                    path.display()
                ))
            })?),
            None => ProfileDocument::load(Path::new(PROJECT_PROFILE_FILE))?,
        };

        Ok(Self {
            builtin: ProfileDocument::builtin(),
            user,
            project,
        })
    }

    /// Merge the layers in precedence order
    pub fn merged(&self) -> ProfileDocument {
        let mut doc = self.builtin.clone();
        if let Some(user) = &self.user {
            doc = doc.merge(user.clone());
        }
        if let Some(project) = &self.project {
            doc = doc.merge(project.clone());
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT_YAML: &str = r#"
active_cluster: hpc
naming:
  max_len: 40
clusters:
  hpc:
    default_env: "module load python/3.11"
    slurm:
      partition: gpu
      account: lab42
      cpus_per_task: 8
      max_array_parallelism: 20
      extra:
        gres: "gpu:1"
        constraint: a100
"#;

    #[test]
    fn test_parse_profile_with_extra_passthrough() {
        let doc = ProfileDocument::from_yaml(PROJECT_YAML).unwrap();
        assert_eq!(doc.active_cluster.as_deref(), Some("hpc"));
        let hpc = &doc.clusters["hpc"];
        assert_eq!(hpc.slurm.partition.as_deref(), Some("gpu"));
        assert_eq!(hpc.slurm.extra["gres"], Value::String("gpu:1".into()));
        assert_eq!(hpc.slurm.mem_gb, None);
    }

    #[test]
    fn test_empty_yaml_is_empty_layer() {
        assert_eq!(ProfileDocument::from_yaml("").unwrap(), ProfileDocument::default());
        assert_eq!(ProfileDocument::from_yaml("~\n").unwrap(), ProfileDocument::default());
    }

    #[test]
    fn test_merge_is_field_by_field() {
        let user = ProfileDocument::from_yaml(
            "clusters:\n  default:\n    slurm:\n      mem_gb: 32\n      extra:\n        mail-type: END\n",
        )
        .unwrap();
        let merged = ProfileDocument::builtin().merge(user);
        let slurm = &merged.clusters[DEFAULT_CLUSTER].slurm;
        assert_eq!(slurm.mem_gb, Some(32));
        assert_eq!(slurm.partition.as_deref(), Some("compute"));
        assert_eq!(slurm.cpus_per_task, Some(4));
        assert_eq!(slurm.extra.len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProfileDocument::load(&dir.path().join("absent.yaml")).unwrap().is_none());
    }

    #[test]
    fn test_load_reports_parse_errors_as_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "clusters: [unclosed").unwrap();
        let err = ProfileDocument::load(&path).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_layers_merge_in_order() {
        let layers = ConfigLayers {
            builtin: ProfileDocument::builtin(),
            user: Some(ProfileDocument::from_yaml("naming:\n  max_len: 60\n  project: mine\n").unwrap()),
            project: Some(ProfileDocument::from_yaml(PROJECT_YAML).unwrap()),
        };
        let merged = layers.merged();
        assert_eq!(merged.naming.max_len, Some(40));
        assert_eq!(merged.naming.project.as_deref(), Some("mine"));
        assert_eq!(merged.active_cluster.as_deref(), Some("hpc"));
        assert!(merged.clusters.contains_key(DEFAULT_CLUSTER));
    }
}
