/// Server configuration, read once from the environment at startup.
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 6060;

fn default_bind() -> String {
    format!("{DEFAULT_HOST}:{DEFAULT_PORT}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Listen address, `host:port`.
    pub bind: String,
    /// Directory for the rolling audit log; audit events only go to the
    /// regular log output when unset.
    pub audit_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            audit_dir: None,
        }
    }
}

impl Config {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind = lookup("BRANCHCHAT_BIND")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_bind);
        let audit_dir = lookup("BRANCHCHAT_AUDIT_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        Self { bind, audit_dir }
    }

    /// Replace the port of `bind` when `arg` parses as one. Anything else is
    /// ignored.
    pub fn with_port_arg(mut self, arg: Option<&str>) -> Self {
        let Some(port) = arg.and_then(|a| a.trim().parse::<u16>().ok()) else {
            return self;
        };
        let host = match self.bind.rsplit_once(':') {
            Some((host, _)) => host.to_owned(),
            None => self.bind.clone(),
        };
        self.bind = format!("{host}:{port}");
        self
    }
}
