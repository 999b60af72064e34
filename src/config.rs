// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that patchsync uses to find
//! its deployment targets. File I/O is left to the caller to figure out.

use crate::path::{default_registry_dir, registry_path};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};

/// Default command used to run WP-CLI on the remote host.
pub const DEFAULT_WP_COMMAND: &str = "wp";

/// Configuration layout.
///
/// # General Layout
///
/// A configuration file is composed of two basic parts: settings and sites.
/// The settings section applies to every invocation. Each site entry
/// describes one deployment target: where the local working copy of the
/// WordPress installation lives, and how to reach the remote copy.
///
/// ```toml
/// [settings]
/// default_site = "production"
/// operator = "jane"
///
/// [[site]]
/// name = "production"
/// host = "deploy@example.com"
/// remote_path = "/var/www/html"
/// local_path = "$HOME/sites/acme/public"
/// production_safety = true
/// ```
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub settings: Settings,

    /// Deployment targets.
    #[serde(default, rename = "site")]
    pub sites: Vec<SiteConfig>,
}

impl Config {
    /// Select site by name, or the default site if no name is given.
    ///
    /// Without a name and without a configured default, the first site is
    /// selected.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownSite`] if no site has given name.
    /// - Return [`ConfigError::NoSites`] if no site is configured at all.
    pub fn site(&self, name: Option<&str>) -> Result<&SiteConfig> {
        let name = name.or(self.settings.default_site.as_deref());
        match name {
            Some(name) => self
                .sites
                .iter()
                .find(|site| site.name == name)
                .ok_or_else(|| ConfigError::UnknownSite { name: name.into() }),
            None => self.sites.first().ok_or(ConfigError::NoSites),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on all path fields.
        for site in &mut config.sites {
            site.local_path = expand(&site.local_path)?;
            if let Some(dir) = &site.registry_dir {
                site.registry_dir = Some(expand(dir)?);
            }
        }

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: &std::path::Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// General settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Site to use when none is given on the command line.
    pub default_site: Option<String>,

    /// Name recorded as the operator of applies. Falls back to `$USER`.
    pub operator: Option<String>,
}

/// One deployment target.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    /// Name of the site, also names its registry file.
    pub name: String,

    /// SSH destination of the remote host, e.g., `deploy@example.com`.
    pub host: String,

    /// SSH port, if not the default.
    pub port: Option<u16>,

    /// WordPress root on the remote host.
    pub remote_path: String,

    /// WordPress root of the local working copy.
    pub local_path: PathBuf,

    /// Ask before every remote write.
    #[serde(default)]
    pub production_safety: bool,

    /// Directory holding the registry instead of the default data directory.
    pub registry_dir: Option<PathBuf>,

    /// Command that runs WP-CLI on the remote host.
    pub wp_command: Option<String>,
}

impl SiteConfig {
    /// Determine path to registry file of this site.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if no registry directory was
    ///   configured, and the default data directory cannot be determined.
    pub fn registry_path(&self) -> Result<PathBuf> {
        let dir = match &self.registry_dir {
            Some(dir) => dir.clone(),
            None => default_registry_dir()?,
        };

        Ok(registry_path(dir, &self.name))
    }

    /// Command that runs WP-CLI on the remote host.
    pub fn wp_command(&self) -> &str {
        self.wp_command.as_deref().unwrap_or(DEFAULT_WP_COMMAND)
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// No site with given name is configured.
    #[error("site {name:?} is not configured")]
    UnknownSite { name: String },

    /// Configuration lists no sites.
    #[error("no sites are configured")]
    NoSites,

    /// Default registry directory cannot be determined.
    #[error(transparent)]
    NoWayHome(#[from] crate::path::NoWayHome),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    fn production() -> SiteConfig {
        SiteConfig {
            name: "production".into(),
            host: "deploy@example.com".into(),
            port: Some(2222),
            remote_path: "/var/www/html".into(),
            local_path: PathBuf::from("/home/blah/sites/acme"),
            production_safety: true,
            registry_dir: None,
            wp_command: None,
        }
    }

    #[sealed_test(env = [("BLAH", "/home/blah")])]
    fn deserialize_config() -> anyhow::Result<()> {
        let result: Config = r#"
            [settings]
            default_site = "production"
            operator = "jane"

            [[site]]
            name = "production"
            host = "deploy@example.com"
            port = 2222
            remote_path = "/var/www/html"
            local_path = "$BLAH/sites/acme"
            production_safety = true

            [[site]]
            name = "staging"
            host = "staging.example.com"
            remote_path = "/srv/www"
            local_path = "/tmp/acme"
            registry_dir = "$BLAH/registries"
            wp_command = "php wp-cli.phar"
        "#
        .parse()?;

        let expect = Config {
            settings: Settings {
                default_site: Some("production".into()),
                operator: Some("jane".into()),
            },
            sites: vec![
                production(),
                SiteConfig {
                    name: "staging".into(),
                    host: "staging.example.com".into(),
                    port: None,
                    remote_path: "/srv/www".into(),
                    local_path: PathBuf::from("/tmp/acme"),
                    production_safety: false,
                    registry_dir: Some(PathBuf::from("/home/blah/registries")),
                    wp_command: Some("php wp-cli.phar".into()),
                },
            ],
        };

        assert_eq!(result, expect);
        assert_eq!(
            result.site(Some("staging"))?.registry_path()?,
            PathBuf::from("/home/blah/registries/staging.lock.toml")
        );
        assert_eq!(result.site(Some("staging"))?.wp_command(), "php wp-cli.phar");
        assert_eq!(result.sites[0].wp_command(), "wp");

        Ok(())
    }

    #[test]
    fn serialize_config() {
        let result = Config {
            settings: Settings {
                default_site: Some("production".into()),
                operator: None,
            },
            sites: vec![production()],
        }
        .to_string();

        let expect = indoc! {r#"
            [settings]
            default_site = "production"

            [[site]]
            name = "production"
            host = "deploy@example.com"
            port = 2222
            remote_path = "/var/www/html"
            local_path = "/home/blah/sites/acme"
            production_safety = true
        "#};

        assert_eq!(result, expect);
    }

    #[test]
    fn select_site() -> anyhow::Result<()> {
        let mut config = Config {
            settings: Settings::default(),
            sites: vec![production()],
        };
        assert_eq!(config.site(None)?.name, "production");
        assert!(matches!(
            config.site(Some("staging")),
            Err(ConfigError::UnknownSite { .. })
        ));

        config.settings.default_site = Some("gone".into());
        assert!(matches!(
            config.site(None),
            Err(ConfigError::UnknownSite { .. })
        ));

        config.sites.clear();
        config.settings.default_site = None;
        assert!(matches!(config.site(None), Err(ConfigError::NoSites)));

        Ok(())
    }
}
