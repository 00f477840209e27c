use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "umuw", about = "A small posting site with local-first storage")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the hosted document store
    #[arg(long, global = true)]
    pub remote: Option<Url>,

    /// Ignore the remote store and work from local storage only
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Host the document store and uploads area
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Ask for an account; the admin has to approve it
    Register {
        username: String,
        #[arg(long)]
        password: String,
    },
    Login {
        username: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    /// Show the cached session
    Whoami,
    /// Print a page's feed
    Feed {
        page: Option<String>,

        /// Keep following the feed until interrupted
        #[arg(long)]
        watch: bool,
    },
    Post {
        text: Option<String>,

        #[arg(long)]
        page: Option<String>,

        /// File to attach
        #[arg(long)]
        media: Option<PathBuf>,
    },
    Comment {
        post_id: String,
        text: Option<String>,

        #[arg(long)]
        page: Option<String>,

        #[arg(long)]
        media: Option<PathBuf>,
    },
    /// Delete a post (admin only)
    Delete {
        post_id: String,

        #[arg(long)]
        page: Option<String>,
    },
    /// Account moderation (admin only)
    Admin {
        #[command(subcommand)]
        action: AdminCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum AdminCommand {
    /// Registrations waiting for a decision
    Pending,
    /// Approved accounts
    Approved,
    Approve { username: String },
    Reject { username: String },
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub remote: RemoteConfig,
    pub auth: AuthConfig,
    pub site: SiteConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Device-local store; `umuw serve` keeps its documents in the same file.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: Option<Url>,
    pub enabled: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Password of the seeded `admin` account.
    pub admin_password: String,
    pub bcrypt_cost: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SiteConfig {
    pub default_page: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            enabled: true,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_password: "admin".to_string(),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            default_page: "daily".to_string(),
        }
    }
}

impl RemoteConfig {
    /// The store to talk to, if one is configured and enabled.
    pub fn endpoint(&self) -> Option<&Url> {
        if self.enabled {
            self.url.as_ref()
        } else {
            None
        }
    }
}

/// Relative endpoint paths are joined onto the base, so it must end in `/`.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let data_dir = Self::data_dir(cli)?;
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        // CLI overrides
        if let Command::Serve { host, port } = &cli.command {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
        }
        if let Some(url) = &cli.remote {
            config.remote.url = Some(url.clone());
            config.remote.enabled = true;
        }
        if cli.offline {
            config.remote.enabled = false;
        }
        config.remote.url = config.remote.url.take().map(with_trailing_slash);

        // Resolve paths relative to data dir
        if config.database.path.is_none() {
            config.database.path = Some(data_dir.join("umuw.db"));
        }
        if config.storage.path.is_none() {
            config.storage.path = Some(data_dir.join("uploads"));
        }

        Ok(config)
    }

    pub fn data_dir(cli: &Cli) -> anyhow::Result<PathBuf> {
        match &cli.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".umuw"))
                .ok_or_else(|| anyhow::anyhow!("Could not determine home directory")),
        }
    }

    /// Local database file. Always set after [`Config::load`].
    pub fn db_path(&self) -> Option<&PathBuf> {
        self.database.path.as_ref()
    }

    pub fn uploads_path(&self) -> Option<&PathBuf> {
        self.storage.path.as_ref()
    }
}
