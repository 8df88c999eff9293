//! Service file loader.
//!
//! Service files hold one `KEY=value` pair per line:
//!
//! ```text
//! NAME=sshd
//! CMD=/usr/sbin/sshd -D
//! RESTART=on-failure
//! DEPENDS=network syslog
//! ```
//!
//! Unrecognised lines are ignored and missing keys keep their defaults, so
//! a partial file still yields a service.

use crate::error::{Error, Result};
use crate::service::{RestartPolicy, ServiceDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Default maximum number of dependencies kept per service.
pub const DEFAULT_DEPENDENCY_LIMIT: usize = 10;

/// Handling of `DEPENDS=` lists longer than the dependency limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyOverflow {
    /// Keep the first `limit` names and drop the rest
    #[default]
    Truncate,
    /// Refuse the whole service file
    Reject,
}

/// Options applied to every service file read for a runlevel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub dependency_limit: usize,
    pub overflow: DependencyOverflow,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            dependency_limit: DEFAULT_DEPENDENCY_LIMIT,
            overflow: DependencyOverflow::Truncate,
        }
    }
}

/// Trait for service definition loaders.
pub trait ServiceLoader: Send + Sync {
    /// Load a service definition from a file for the given runlevel.
    fn load(&self, path: &Path, runlevel: u8) -> Result<ServiceDefinition>;

    /// Loader name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Loader for `KEY=value` service files.
#[derive(Debug, Clone, Default)]
pub struct KeyValueLoader {
    options: ParseOptions,
}

impl KeyValueLoader {
    /// Create a new key=value loader.
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Parse service file contents.
    ///
    /// `fallback_name` names the service when the file has no `NAME=` line.
    pub fn parse(
        &self,
        content: &str,
        fallback_name: &str,
        runlevel: u8,
    ) -> Result<ServiceDefinition> {
        let mut def = ServiceDefinition::new(fallback_name, "", runlevel);
        let mut declared = 0usize;

        for line in content.lines() {
            let line = line.trim_end_matches('\r');

            if let Some(value) = line.strip_prefix("NAME=") {
                def.name = value.to_string();
            } else if let Some(value) = line.strip_prefix("CMD=") {
                def.command = value.to_string();
            } else if let Some(value) = line.strip_prefix("RESTART=") {
                def.restart = RestartPolicy::from_config_value(value);
            } else if let Some(value) = line.strip_prefix("DEPENDS=") {
                for dep in value.split_whitespace() {
                    if def.dependencies.iter().any(|d| d == dep) {
                        continue;
                    }
                    declared += 1;
                    if def.dependencies.len() < self.options.dependency_limit {
                        def.dependencies.push(dep.to_string());
                    }
                }
            } else if !line.trim().is_empty() {
                debug!(line = line, "Ignoring unrecognised service file line");
            }
        }

        if declared > self.options.dependency_limit {
            match self.options.overflow {
                DependencyOverflow::Truncate => {
                    warn!(
                        service = %def.name,
                        declared = declared,
                        limit = self.options.dependency_limit,
                        "Dropping dependencies beyond the limit"
                    );
                }
                DependencyOverflow::Reject => {
                    return Err(Error::TooManyDependencies {
                        name: def.name,
                        count: declared,
                        limit: self.options.dependency_limit,
                    });
                }
            }
        }

        Ok(def)
    }
}

impl ServiceLoader for KeyValueLoader {
    fn load(&self, path: &Path, runlevel: u8) -> Result<ServiceDefinition> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidServiceFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let fallback = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        self.parse(&content, fallback, runlevel)
    }

    fn name(&self) -> &'static str {
        "key=value"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_definition() {
        let loader = KeyValueLoader::default();
        let def = loader
            .parse(
                "NAME=sshd\nCMD=/usr/sbin/sshd -D -p 22\nRESTART=on-failure\nDEPENDS=network syslog\n",
                "sshd.conf",
                2,
            )
            .unwrap();

        assert_eq!(
            def,
            ServiceDefinition::new("sshd", "/usr/sbin/sshd -D -p 22", 2)
                .with_restart(RestartPolicy::OnFailure)
                .with_dependencies(["network", "syslog"])
        );
    }

    #[test]
    fn test_unrecognised_lines_are_ignored() {
        let loader = KeyValueLoader::default();
        let def = loader
            .parse("# comment\nNAME=cron\nFOO=bar\nname=lower\nCMD=crond -f\n", "x", 3)
            .unwrap();

        assert_eq!(def.name, "cron");
        assert_eq!(def.command, "crond -f");
        assert_eq!(def.runlevel, 3);
    }

    #[test]
    fn test_missing_fields_keep_defaults() {
        let loader = KeyValueLoader::default();
        let def = loader.parse("NAME=partial\n", "partial.conf", 2).unwrap();

        assert_eq!(def.command, "");
        assert_eq!(def.restart, RestartPolicy::Never);
        assert!(def.dependencies.is_empty());
    }

    #[test]
    fn test_missing_name_uses_file_name() {
        let loader = KeyValueLoader::default();
        let def = loader.parse("CMD=true\n", "oneshot", 2).unwrap();
        assert_eq!(def.name, "oneshot");
    }

    #[test]
    fn test_depends_keeps_first_ten() {
        let loader = KeyValueLoader::default();
        let names: Vec<String> = (1..=11).map(|i| format!("dep{}", i)).collect();
        let content = format!("NAME=big\nDEPENDS={}\n", names.join(" "));

        let def = loader.parse(&content, "big", 2).unwrap();
        assert_eq!(def.dependencies.len(), 10);
        assert_eq!(def.dependencies, names[..10].to_vec());
    }

    #[test]
    fn test_depends_across_lines_share_capacity() {
        let loader = KeyValueLoader::new(ParseOptions {
            dependency_limit: 3,
            ..ParseOptions::default()
        });
        let def = loader
            .parse("DEPENDS=a  b\nDEPENDS=c d\n", "svc", 2)
            .unwrap();
        assert_eq!(def.dependencies, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_depends_overflow_reject() {
        let loader = KeyValueLoader::new(ParseOptions {
            dependency_limit: 2,
            overflow: DependencyOverflow::Reject,
        });

        let err = loader.parse("NAME=svc\nDEPENDS=a b c\n", "svc", 2).unwrap_err();
        match err {
            Error::TooManyDependencies { name, count, limit } => {
                assert_eq!(name, "svc");
                assert_eq!(count, 3);
                assert_eq!(limit, 2);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(loader.parse("NAME=svc\nDEPENDS=a b\n", "svc", 2).is_ok());
    }

    #[test]
    fn test_unknown_restart_value_is_never() {
        let loader = KeyValueLoader::default();
        let def = loader.parse("RESTART=sometimes\n", "svc", 2).unwrap();
        assert_eq!(def.restart, RestartPolicy::Never);
    }

    #[test]
    fn test_crlf_line_endings() {
        let loader = KeyValueLoader::default();
        let def = loader
            .parse("NAME=web\r\nRESTART=always\r\n", "web", 2)
            .unwrap();
        assert_eq!(def.name, "web");
        assert_eq!(def.restart, RestartPolicy::Always);
    }
}
