//! Proxy configuration: per-server entries, validation, and the on-disk
//! TOML store with atomic persistence.

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose;
use image::GenericImageView;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Java,
    Bedrock,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Proto {
    Tcp,
    Udp,
}

fn default_max_players() -> u32 {
    20
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Stable identifier, also the key for the process-lifetime runtime state.
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub edition: Edition,
    pub container_name: String,
    /// Public port: TCP for Java, UDP for Bedrock.
    pub external_port: u16,
    pub internal_host: String,
    pub internal_port: u16,
    /// Java servers only: also run a Bedrock (RakNet) listener for crossplay.
    #[serde(default)]
    pub crossplay: bool,
    #[serde(default)]
    pub bedrock_port: Option<u16>,
    #[serde(default)]
    pub bedrock_internal_port: Option<u16>,
    pub motd: String,
    pub fake_version: String,
    pub fake_protocol: i32,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default)]
    pub favicon_b64: Option<String>,
    /// PNG on disk; resized to 64x64 and folded into `favicon_b64` at load.
    #[serde(default)]
    pub favicon_path: Option<PathBuf>,
    pub idle_timeout_s: u64,
    pub max_startup_wait_s: u64,
}

impl ServerConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn internal_addr(&self) -> String {
        format!("{}:{}", self.internal_host, self.internal_port)
    }

    /// Backend UDP target for the Bedrock path: the native address for a
    /// Bedrock server, the crossplay port for a Java one.
    pub fn bedrock_internal_addr(&self) -> Option<String> {
        match self.edition {
            Edition::Bedrock => Some(self.internal_addr()),
            Edition::Java => self
                .bedrock_internal_port
                .map(|port| format!("{}:{}", self.internal_host, port)),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_s)
    }

    pub fn max_startup_wait(&self) -> Duration {
        Duration::from_secs(self.max_startup_wait_s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Opaque to the proxy core; handed to notifier subscribers as-is.
    #[serde(default)]
    pub notifications: Option<toml::Value>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        fn claim_port(seen: &mut Vec<(u16, String)>, port: u16, id: &str) -> Result<()> {
            if let Some((_, other)) = seen.iter().find(|(p, _)| *p == port) {
                bail!("port {} used by both '{}' and '{}'", port, other, id);
            }
            seen.push((port, id.to_owned()));
            Ok(())
        }

        let mut seen_ids: Vec<&str> = Vec::new();
        let mut seen_ports: Vec<(u16, String)> = Vec::new();
        for server in &self.servers {
            if server.id.is_empty() {
                bail!("server entry with empty id");
            }
            if seen_ids.contains(&server.id.as_str()) {
                bail!("duplicate server id '{}'", server.id);
            }
            seen_ids.push(&server.id);
            claim_port(&mut seen_ports, server.external_port, &server.id)?;
            match server.edition {
                Edition::Bedrock => {
                    if server.crossplay
                        || server.bedrock_port.is_some()
                        || server.bedrock_internal_port.is_some()
                    {
                        bail!(
                            "server '{}': crossplay fields are only valid on java servers",
                            server.id
                        );
                    }
                }
                Edition::Java => {
                    if server.crossplay {
                        let port = server.bedrock_port.with_context(|| {
                            format!("server '{}': crossplay requires bedrock_port", server.id)
                        })?;
                        server.bedrock_internal_port.with_context(|| {
                            format!(
                                "server '{}': crossplay requires bedrock_internal_port",
                                server.id
                            )
                        })?;
                        claim_port(&mut seen_ports, port, &server.id)?;
                    } else if server.bedrock_port.is_some()
                        || server.bedrock_internal_port.is_some()
                    {
                        bail!(
                            "server '{}': bedrock ports set without crossplay = true",
                            server.id
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn lookup_by_external_port(&self, port: u16, proto: Proto) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| match proto {
            Proto::Tcp => server.edition == Edition::Java && server.external_port == port,
            Proto::Udp => match server.edition {
                Edition::Bedrock => server.external_port == port,
                Edition::Java => server.crossplay && server.bedrock_port == Some(port),
            },
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# containap configuration
#
# [[servers]]
# id = "survival"
# edition = "java"                # or "bedrock"
# container_name = "mc-survival"
# external_port = 25565           # public port (TCP for java, UDP for bedrock)
# internal_host = "127.0.0.1"
# internal_port = 25566           # backend port reachable from the proxy
# motd = "Survival world"
# fake_version = "1.20.5"
# fake_protocol = 766
# idle_timeout_s = 600
# max_startup_wait_s = 120
# # crossplay = true
# # bedrock_port = 19132
# # bedrock_internal_port = 19133
# # favicon_path = "config/server-icon.png"
"#;

/// Loads the TOML file and serves consistent snapshots to the listeners.
/// A failed reload keeps the last good snapshot in place.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            log::info!(
                "No configuration file found, writing template to {}",
                path.display()
            );
            if let Some(dir) = path.parent()
                && !dir.as_os_str().is_empty()
            {
                fs::create_dir_all(dir)
                    .with_context(|| format!("cannot create {}", dir.display()))?;
            }
            fs::write(&path, DEFAULT_CONFIG_TEMPLATE)
                .with_context(|| format!("cannot write {}", path.display()))?;
        }
        let config = read_config(&path)?;
        Ok(ConfigStore {
            path,
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().unwrap().clone()
    }

    /// Re-read the file; returns true when the snapshot changed. Errors leave
    /// the previous snapshot in place.
    pub fn reload(&self) -> Result<bool> {
        let fresh = read_config(&self.path)?;
        let mut current = self.current.write().unwrap();
        if **current == fresh {
            return Ok(false);
        }
        *current = Arc::new(fresh);
        Ok(true)
    }

    /// Write-then-rename so a crash mid-write never clobbers the file.
    pub fn persist(&self, config: &Config) -> Result<()> {
        config.validate()?;
        let rendered = toml::to_string_pretty(config).context("cannot serialize config")?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, rendered).with_context(|| format!("cannot write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("cannot replace {}", self.path.display()))?;
        *self.current.write().unwrap() = Arc::new(config.clone());
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("cannot parse {}", path.display()))?;
    config.validate()?;
    for server in &mut config.servers {
        if server.favicon_b64.is_none()
            && let Some(icon_path) = server.favicon_path.clone()
        {
            match load_favicon(&icon_path) {
                Ok(b64) => server.favicon_b64 = Some(b64),
                Err(err) => log::warn!(
                    "Server '{}': cannot load favicon {}: {:#}",
                    server.id,
                    icon_path.display(),
                    err
                ),
            }
        }
    }
    Ok(config)
}

/// Status favicons must be 64x64 PNGs; resize anything else on the way in.
fn load_favicon(path: &Path) -> Result<String> {
    let img = image::open(path)?;
    let img = if img.dimensions() == (64, 64) {
        img
    } else {
        img.resize_exact(64, 64, FilterType::CatmullRom)
    };
    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(general_purpose::STANDARD.encode(&png))
}
