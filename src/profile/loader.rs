//! Profile loading: local YAML directories and an HTTP configuration store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::types::{AgentProfile, ProfileResolution, ProfileSource};

/// Repository of profiles loaded from a directory of YAML documents.
///
/// Each `<profile_id>.yaml` file is one profile; an optional `tenants.yaml`
/// maps tenant ids to profile ids. Unknown tenants fall back to the base
/// profile.
#[derive(Debug, Default)]
pub struct ProfileRepository {
    profiles: BTreeMap<String, AgentProfile>,
    tenant_map: BTreeMap<String, String>,
}

impl ProfileRepository {
    /// Load every profile document under `root`.
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let pattern = root.join("*.yaml");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| Error::Profile(format!("non-utf8 profile path: {}", root.display())))?;

        let mut profiles = BTreeMap::new();
        let mut tenant_map = BTreeMap::new();
        let paths =
            glob::glob(pattern).map_err(|e| Error::Profile(format!("bad glob pattern: {e}")))?;
        for entry in paths {
            let path: PathBuf = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "profile_glob_entry_unreadable");
                    continue;
                }
            };
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Profile(format!("read {}: {e}", path.display())))?;
            if stem == "tenants" {
                tenant_map = serde_yaml::from_str(&raw)?;
                continue;
            }
            let mut profile: AgentProfile = serde_yaml::from_str(&raw)?;
            if profile.profile_id.trim().is_empty() {
                profile.profile_id = stem.clone();
            }
            debug!(profile_id = %profile.profile_id, path = %path.display(), "profile_loaded");
            profiles.insert(profile.profile_id.clone(), profile);
        }
        Ok(Self {
            profiles,
            tenant_map,
        })
    }

    /// Register a profile directly (used for built-ins and tests).
    pub fn insert(&mut self, profile: AgentProfile) {
        self.profiles.insert(profile.profile_id.clone(), profile);
    }

    pub fn get(&self, profile_id: &str) -> Option<&AgentProfile> {
        self.profiles.get(profile_id)
    }

    /// Resolve the profile for a tenant, recording how the decision fell.
    pub fn resolve(&self, tenant_id: &str) -> (AgentProfile, ProfileResolution) {
        if let Some(profile_id) = self.tenant_map.get(tenant_id) {
            if let Some(profile) = self.profiles.get(profile_id) {
                return (
                    profile.clone(),
                    ProfileResolution {
                        source: ProfileSource::TenantMap,
                        requested_profile_id: Some(profile_id.clone()),
                        applied_profile_id: profile.profile_id.clone(),
                        decision_reason: format!("tenant_map:{tenant_id}"),
                    },
                );
            }
            warn!(tenant_id, profile_id = %profile_id, "tenant_mapped_profile_missing");
        }
        if let Some(profile) = self.profiles.get(tenant_id) {
            return (
                profile.clone(),
                ProfileResolution {
                    source: ProfileSource::TenantFile,
                    requested_profile_id: Some(tenant_id.to_string()),
                    applied_profile_id: profile.profile_id.clone(),
                    decision_reason: "tenant_named_profile".to_string(),
                },
            );
        }
        let base = self
            .profiles
            .get("base")
            .cloned()
            .unwrap_or_default();
        let applied = base.profile_id.clone();
        (
            base,
            ProfileResolution {
                source: ProfileSource::Base,
                requested_profile_id: None,
                applied_profile_id: applied,
                decision_reason: "fallback_base_profile".to_string(),
            },
        )
    }
}

/// Profile loader backed by an HTTP configuration store.
///
/// GETs `{base_url}/profiles/{profile_id}` and expects the profile document
/// as JSON.
#[derive(Debug)]
pub struct HttpProfileStore {
    base_url: String,
    http: reqwest::Client,
}

impl HttpProfileStore {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    pub async fn fetch(&self, profile_id: &str) -> Result<(AgentProfile, ProfileResolution)> {
        let url = format!("{}/profiles/{}", self.base_url.trim_end_matches('/'), profile_id);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Profile(format!(
                "profile store returned {} for {profile_id}",
                response.status()
            )));
        }
        let profile: AgentProfile = response.json().await?;
        let applied = profile.profile_id.clone();
        Ok((
            profile,
            ProfileResolution {
                source: ProfileSource::Store,
                requested_profile_id: Some(profile_id.to_string()),
                applied_profile_id: applied,
                decision_reason: "configuration_store".to_string(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn test_repository_loads_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "base.yaml", "profile_id: base\n");
        write_file(dir.path(), "iso_auditor.yaml", "profile_id: iso_auditor\n");
        write_file(dir.path(), "tenants.yaml", "acme: iso_auditor\n");

        let repo = ProfileRepository::from_dir(dir.path()).unwrap();
        let (profile, resolution) = repo.resolve("acme");
        assert_eq!(profile.profile_id, "iso_auditor");
        assert_eq!(resolution.source, ProfileSource::TenantMap);

        let (profile, resolution) = repo.resolve("unknown-tenant");
        assert_eq!(profile.profile_id, "base");
        assert_eq!(resolution.source, ProfileSource::Base);
    }

    #[test]
    fn test_profile_id_defaults_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "acme.yaml", "version: '2.0.0'\n");
        let repo = ProfileRepository::from_dir(dir.path()).unwrap();
        let (profile, resolution) = repo.resolve("acme");
        assert_eq!(profile.profile_id, "acme");
        assert_eq!(resolution.source, ProfileSource::TenantFile);
        assert_eq!(profile.version, "2.0.0");
    }

    #[test]
    fn test_invalid_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "bad.yaml", "no_such_key: true\n");
        assert!(ProfileRepository::from_dir(dir.path()).is_err());
    }
}
