//! Bus access policy.
//!
//! A TOML table of allow/deny rules over OS uids and group names, evaluated
//! against the socket peer's credentials before any request work happens.
//! Deny always wins over allow. Without a policy file every caller is
//! allowed; the sockets' own permissions remain the outer gate.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// What to do with callers no explicit rule covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    #[default]
    Allow,
    Deny,
}

/// Parsed policy file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    pub default: DefaultAction,
    pub allow_uids: Vec<u32>,
    pub deny_uids: Vec<u32>,
    pub allow_groups: Vec<String>,
    pub deny_groups: Vec<String>,
}

impl AccessPolicy {
    /// Policy used when no file is configured: everyone is allowed.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path.display()))?;
        let policy: AccessPolicy = toml::from_str(&contents)
            .with_context(|| format!("parsing policy file {}", path.display()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reject tables that allow and deny the same principal. Such a file is
    /// almost certainly an editing mistake, and deny-wins would make the
    /// allow entry dead weight.
    fn validate(&self) -> Result<()> {
        for uid in &self.allow_uids {
            if self.deny_uids.contains(uid) {
                bail!("uid {uid} appears in both allow_uids and deny_uids");
            }
        }
        for group in &self.allow_groups {
            if self.deny_groups.contains(group) {
                bail!("group '{group}' appears in both allow_groups and deny_groups");
            }
        }
        Ok(())
    }

    /// Evaluate one caller. `groups` are the names of the groups the uid
    /// belongs to.
    pub fn allows(&self, uid: u32, groups: &[String]) -> bool {
        if self.deny_uids.contains(&uid) {
            return false;
        }
        if groups.iter().any(|g| self.deny_groups.contains(g)) {
            return false;
        }
        if self.allow_uids.contains(&uid) {
            return true;
        }
        if groups.iter().any(|g| self.allow_groups.contains(g)) {
            return true;
        }
        self.default == DefaultAction::Allow
    }
}

/// Resolves the group names a uid belongs to from an `/etc/group`-format
/// file. Lookups go by the numeric uid's primary-name entry in member lists;
/// a malformed line is skipped rather than failing the whole check.
#[derive(Debug, Clone)]
pub struct GroupResolver {
    group_file: std::path::PathBuf,
    passwd_file: std::path::PathBuf,
}

impl GroupResolver {
    pub fn new() -> Self {
        Self {
            group_file: "/etc/group".into(),
            passwd_file: "/etc/passwd".into(),
        }
    }

    pub fn with_files(group_file: &Path, passwd_file: &Path) -> Self {
        Self {
            group_file: group_file.to_path_buf(),
            passwd_file: passwd_file.to_path_buf(),
        }
    }

    /// Group names for a uid: the primary group from passwd plus every group
    /// listing the login name as a member. Unknown uids get an empty list.
    pub fn groups_for(&self, uid: u32) -> Vec<String> {
        let Ok(passwd) = std::fs::read_to_string(&self.passwd_file) else {
            return Vec::new();
        };

        let mut login = None;
        let mut primary_gid = None;
        for line in passwd.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                continue;
            }
            if fields[2].parse::<u32>() == Ok(uid) {
                login = Some(fields[0].to_string());
                primary_gid = fields[3].parse::<u32>().ok();
                break;
            }
        }
        let Some(login) = login else {
            debug!(uid, "uid not present in passwd, no groups resolved");
            return Vec::new();
        };

        let Ok(group) = std::fs::read_to_string(&self.group_file) else {
            return Vec::new();
        };

        let mut groups = Vec::new();
        for line in group.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                continue;
            }
            let name = fields[0];
            let gid = fields[2].parse::<u32>().ok();
            let members: Vec<&str> = fields[3].split(',').filter(|m| !m.is_empty()).collect();
            if gid == primary_gid || members.contains(&login.as_str()) {
                groups.push(name.to_string());
            }
        }
        groups
    }
}

impl Default for GroupResolver {
    fn default() -> Self {
        Self::new()
    }
}
