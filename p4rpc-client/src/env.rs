//! Client identity and environment.
//!
//! Settings are resolved in the following order (earlier wins):
//! 1. Explicit overrides (command-line flags)
//! 2. `P4CONFIG` files, searched from the working directory upward
//! 3. Process environment variables
//! 4. The `P4ENVIRO` file (default `~/.p4enviro`)
//!
//! Values read from files and the environment have `$home` replaced with
//! the user's home directory. Values read from a `P4CONFIG` file also have
//! `$configdir` replaced with the directory holding that file.

use p4rpc_protocol::{ServerAddress, DEFAULT_SERVER_ADDRESS};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Read-only source of the identity parameters a connection sends.
pub trait IdentityProvider: Send + Sync {
    /// Server address string (`P4PORT`).
    fn server_address(&self) -> String;
    /// Client host name (`P4HOST`).
    fn host(&self) -> String;
    /// User name (`P4USER`).
    fn user(&self) -> String;
    /// Client workspace name (`P4CLIENT`).
    fn client(&self) -> String;
    /// Working directory reported to the server.
    fn cwd(&self) -> String;
    /// Stored login ticket for a server address and user.
    fn ticket(&self, server_address: &str, user: &str) -> Option<String>;
    /// Clear-text password (`P4PASSWD`).
    fn password(&self) -> Option<String>;
}

/// Fixed identity values.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    pub server_address: String,
    pub host: String,
    pub user: String,
    pub client: String,
    pub cwd: String,
    pub ticket: Option<String>,
    pub password: Option<String>,
}

impl IdentityProvider for StaticIdentity {
    fn server_address(&self) -> String {
        self.server_address.clone()
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn user(&self) -> String {
        self.user.clone()
    }

    fn client(&self) -> String {
        self.client.clone()
    }

    fn cwd(&self) -> String {
        self.cwd.clone()
    }

    fn ticket(&self, _server_address: &str, _user: &str) -> Option<String> {
        self.ticket.clone()
    }

    fn password(&self) -> Option<String> {
        self.password.clone()
    }
}

/// Login tickets keyed by server address and user.
///
/// The file format is one `serverAddress=user:ticket` entry per line.
#[derive(Debug, Clone, Default)]
pub struct TicketStore {
    tickets: HashMap<(String, String), String>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a ticket file. A missing or unreadable file yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> Self {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::debug!("No tickets loaded from {}: {}", path.as_ref().display(), e);
                Self::default()
            }
        }
    }

    /// Parses ticket file content, skipping malformed lines.
    pub fn parse(content: &str) -> Self {
        let mut store = Self::default();
        for line in content.lines() {
            let line = line.trim();
            let Some((address, rest)) = line.split_once('=') else {
                continue;
            };
            let Some((user, ticket)) = rest.split_once(':') else {
                continue;
            };
            store.insert(address, user, ticket);
        }
        store
    }

    pub fn insert(&mut self, address: &str, user: &str, ticket: &str) {
        self.tickets
            .insert((address.to_string(), user.to_string()), ticket.to_string());
    }

    /// Looks up a ticket by exact address, then by the address without its
    /// protocol prefix.
    pub fn get(&self, address: &str, user: &str) -> Option<&str> {
        let key = (address.to_string(), user.to_string());
        if let Some(ticket) = self.tickets.get(&key) {
            return Some(ticket.as_str());
        }
        let bare = ServerAddress::parse(address).ok()?.host_port();
        self.tickets
            .get(&(bare, user.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

/// Identity provider backed by the environment and config file cascade.
#[derive(Debug, Clone)]
pub struct Environment {
    cwd: PathBuf,
    home: PathBuf,
    overrides: HashMap<String, String>,
    config: HashMap<String, String>,
    vars: HashMap<String, String>,
    enviro: HashMap<String, String>,
    tickets: TicketStore,
}

impl Environment {
    /// Loads the environment for a working directory from the process
    /// environment and the user's home directory.
    pub fn load(cwd: impl Into<PathBuf>) -> Self {
        let home = home::home_dir().unwrap_or_default();
        Self::with_vars(cwd, home, std::env::vars())
    }

    /// Loads the environment from explicit variables instead of the process
    /// environment.
    pub fn with_vars(
        cwd: impl Into<PathBuf>,
        home: impl Into<PathBuf>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let cwd = cwd.into();
        let home = home.into();
        let home_str = home.to_string_lossy().into_owned();

        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| {
                let v = v.replace("$home", &home_str);
                (k, v)
            })
            .collect();

        let enviro_path = vars
            .get("P4ENVIRO")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".p4enviro"));
        let enviro = load_settings(&enviro_path, &[("$home", home_str.as_str())]);

        let mut config = HashMap::new();
        let config_name = vars.get("P4CONFIG").or_else(|| enviro.get("P4CONFIG"));
        if let Some(name) = config_name {
            for dir in cwd.ancestors() {
                let dir_str = dir.to_string_lossy();
                let settings = load_settings(
                    &dir.join(name),
                    &[("$home", home_str.as_str()), ("$configdir", dir_str.as_ref())],
                );
                for (k, v) in settings {
                    config.entry(k).or_insert(v);
                }
            }
        }

        let mut env = Self {
            cwd,
            home,
            overrides: HashMap::new(),
            config,
            vars,
            enviro,
            tickets: TicketStore::new(),
        };
        env.tickets = TicketStore::load(env.tickets_path());
        env
    }

    /// Sets an explicit override that takes precedence over every other source.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.overrides.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_tickets(mut self, tickets: TicketStore) -> Self {
        self.tickets = tickets;
        self
    }

    /// Resolves a setting. Empty values count as unset.
    pub fn get(&self, name: &str) -> Option<&str> {
        [&self.overrides, &self.config, &self.vars, &self.enviro]
            .into_iter()
            .filter_map(|source| source.get(name))
            .map(String::as_str)
            .find(|v| !v.is_empty())
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn cwd_path(&self) -> &Path {
        &self.cwd
    }

    /// Returns the ticket file location.
    pub fn tickets_path(&self) -> PathBuf {
        self.get("P4TICKETS")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.home.join(".p4tickets"))
    }

    pub fn tickets(&self) -> &TicketStore {
        &self.tickets
    }
}

impl IdentityProvider for Environment {
    fn server_address(&self) -> String {
        self.get("P4PORT")
            .unwrap_or(DEFAULT_SERVER_ADDRESS)
            .to_string()
    }

    fn host(&self) -> String {
        if let Some(host) = self.get("P4HOST").or_else(|| self.get("HOSTNAME")) {
            return host.to_string();
        }
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn user(&self) -> String {
        self.get("P4USER")
            .or_else(|| self.get("USER"))
            .or_else(|| self.get("USERNAME"))
            .unwrap_or("unknown")
            .to_string()
    }

    fn client(&self) -> String {
        match self.get("P4CLIENT") {
            Some(client) => client.to_string(),
            None => self.host(),
        }
    }

    fn cwd(&self) -> String {
        self.cwd.to_string_lossy().into_owned()
    }

    fn ticket(&self, server_address: &str, user: &str) -> Option<String> {
        self.tickets.get(server_address, user).map(str::to_string)
    }

    fn password(&self) -> Option<String> {
        self.get("P4PASSWD").map(str::to_string)
    }
}

/// Reads `NAME=value` lines from a settings file. A missing file yields no
/// settings.
fn load_settings(path: &Path, replacements: &[(&str, &str)]) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        return values;
    };
    tracing::debug!("Loading settings from {}", path.display());
    for line in content.lines() {
        if let Some((name, value)) = line.split_once('=') {
            let mut value = value.trim_end_matches([' ', '\r']).to_string();
            for (from, to) in replacements {
                value = value.replace(from, to);
            }
            values.insert(name.to_string(), value);
        }
    }
    values
}
