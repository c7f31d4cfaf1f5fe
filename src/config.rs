use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Environment {
    Development,
    Production,
}

/// Immutable runtime configuration, validated once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub repo_roots: Vec<PathBuf>,
    pub allowlist_emails: Vec<String>,
    pub admin_emails: Vec<String>,
    pub cf_access_team_domain: Option<String>,
    pub cf_access_aud: Option<String>,
    pub dev_auth: bool,
    pub max_sessions_per_user: usize,
    pub max_total_sessions: usize,
    pub disconnected_ttl_minutes: u64,
    pub max_file_size_bytes: u64,
    pub tasks_enabled: bool,
    pub claude_path: String,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Startup-fatal checks. The process must exit non-zero when these fail.
    pub fn validate(&self) -> Result<()> {
        if self.is_production()
            && (self.cf_access_team_domain.is_none() || self.cf_access_aud.is_none())
        {
            bail!(
                "CF_ACCESS_TEAM_DOMAIN and CF_ACCESS_AUD are required in production"
            );
        }
        if self.repo_roots.is_empty() {
            bail!("REPO_ROOTS must name at least one directory");
        }
        let mut seen = std::collections::HashSet::new();
        for root in &self.repo_roots {
            if !root.is_absolute() {
                bail!("repo root {} is not an absolute path", root.display());
            }
            if !root.is_dir() {
                bail!("repo root {} is not a directory", root.display());
            }
            let name = root
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("repo root {} has no basename", root.display()))?;
            if !seen.insert(name.to_string()) {
                bail!("duplicate repo root basename '{name}'; repoId resolution requires unique basenames");
            }
        }
        Ok(())
    }

    pub fn disconnected_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.disconnected_ttl_minutes * 60)
    }
}

pub fn parse_email_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn parse_root_list(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}
