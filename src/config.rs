use crate::core::{OdmError, Result};
use std::time::Duration;

/// URL scheme served by the bundled in-memory store.
pub const MEMORY_SCHEME: &str = "memory";

const DEFAULT_PORT: u16 = 27017;

/// Store connection parameters
///
/// Similar to a MongoDB connection string: scheme, host, port, default
/// database and a handful of client options.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// URL scheme selecting the driver
    pub scheme: String,

    /// Store host
    pub host: String,

    /// Store port
    pub port: u16,

    /// Database used when the registry is not given an explicit name
    pub database: Option<String>,

    /// Application name reported to the store
    pub app_name: Option<String>,

    /// Connection timeout. Networked drivers passed to
    /// `Database::with_client` honour it; the in-memory store only logs it.
    pub connect_timeout: Duration,

    /// How long to wait for a usable server before failing an operation.
    /// Same caveat as `connect_timeout`.
    pub server_selection_timeout: Duration,
}

impl ClientConfig {
    /// Configuration for the in-memory store
    pub fn memory() -> Self {
        Self {
            scheme: MEMORY_SCHEME.to_string(),
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: None,
            app_name: None,
            connect_timeout: Duration::from_secs(10),
            server_selection_timeout: Duration::from_secs(30),
        }
    }

    /// Set the default database name
    pub fn database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    /// Set the host
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn app_name(mut self, name: &str) -> Self {
        self.app_name = Some(name.to_string());
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = timeout;
        self
    }

    /// Parse from connection string
    ///
    /// Format: `scheme://host[:port][/database][?appName=name]`
    ///
    /// # Examples
    ///
    /// ```
    /// use docmapper::ClientConfig;
    ///
    /// let config = ClientConfig::from_url("memory://localhost:27017/shop?appName=api").unwrap();
    /// assert_eq!(config.database.as_deref(), Some("shop"));
    /// assert_eq!(config.app_name.as_deref(), Some("api"));
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| OdmError::Config(format!("'{}' is missing a scheme", url)))?;
        if scheme.is_empty() {
            return Err(OdmError::Config("URL scheme cannot be empty".into()));
        }

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (host_port, database) = match location.split_once('/') {
            Some((host_port, db)) if !db.is_empty() => (host_port, Some(db)),
            Some((host_port, _)) => (host_port, None),
            None => (location, None),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| OdmError::Config(format!("invalid port '{}'", port)))?;
                (host, port)
            }
            None => (host_port, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(OdmError::Config("host cannot be empty".into()));
        }

        let mut config = Self::memory().host(host).port(port);
        config.scheme = scheme.to_string();
        if let Some(db) = database {
            config = config.database(db);
        }

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| OdmError::Config(format!("malformed option '{}'", pair)))?;
            config = match key {
                "appName" => config.app_name(value),
                "connectTimeoutMS" => config.connect_timeout(parse_millis(key, value)?),
                "serverSelectionTimeoutMS" => {
                    config.server_selection_timeout(parse_millis(key, value)?)
                }
                other => {
                    return Err(OdmError::Config(format!("unknown option '{}'", other)));
                }
            };
        }

        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        let mut url = format!("{}://{}:{}", self.scheme, self.host, self.port);
        if let Some(db) = &self.database {
            url.push('/');
            url.push_str(db);
        }
        if let Some(app) = &self.app_name {
            url.push_str("?appName=");
            url.push_str(app);
        }
        url
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(OdmError::Config("host cannot be empty".into()));
        }

        if self.connect_timeout.is_zero() {
            return Err(OdmError::Config("connect_timeout must be > 0".into()));
        }

        if self.server_selection_timeout.is_zero() {
            return Err(OdmError::Config(
                "server_selection_timeout must be > 0".into(),
            ));
        }

        if let Some(db) = &self.database {
            validate_database_name(db)?;
        }

        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| OdmError::Config(format!("{} must be an integer, got '{}'", key, value)))
}

/// Database names must be non-empty and free of path and separator characters.
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(OdmError::Config("database name cannot be empty".into()));
    }
    if let Some(c) = name.chars().find(|c| "/\\. \"$".contains(*c)) {
        return Err(OdmError::Config(format!(
            "database name '{}' contains invalid character '{}'",
            name, c
        )));
    }
    if name.len() > 64 {
        return Err(OdmError::Config(format!(
            "database name '{}' is too long (max 64 characters)",
            name
        )));
    }
    Ok(())
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::memory()
    }
}
