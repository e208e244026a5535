use std::{net::SocketAddr, str::FromStr};

use sqlx::sqlite::SqliteConnectOptions;

use crate::{app_err, app_error, error::AppError};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_DATABASE_URL: &str = "sqlite://k8s-versions.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_NAMESPACE: &str = "default";

/// Namespace value that selects workloads from every namespace.
pub const ALL_NAMESPACES: &str = "*";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub database: DatabaseConfig,
    pub namespace: NamespaceScope,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<SqliteConnectOptions, AppError> {
        let options = SqliteConnectOptions::from_str(&self.url)?;
        Ok(options.create_if_missing(true))
    }
}

/// Which namespaces the workload source looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    Namespace(String),
    All,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let listen_addr = lookup("LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| app_error!("LISTEN_ADDR is not a valid socket address: {e}"))?;

        let url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(v) => parse_max_connections(&v)?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let namespace = match lookup("KUBE_NAMESPACE").as_deref().map(str::trim) {
            None => NamespaceScope::Namespace(DEFAULT_NAMESPACE.to_string()),
            Some("") => return app_err!("KUBE_NAMESPACE must not be empty"),
            Some(ALL_NAMESPACES) => NamespaceScope::All,
            Some(ns) => NamespaceScope::Namespace(ns.to_string()),
        };

        Ok(Config {
            listen_addr,
            database: DatabaseConfig {
                url,
                max_connections,
            },
            namespace,
        })
    }
}

fn parse_max_connections(value: &str) -> Result<u32, AppError> {
    match value.trim().parse::<u32>() {
        Ok(0) => app_err!("DATABASE_MAX_CONNECTIONS must be greater than zero"),
        Ok(n) => Ok(n),
        Err(e) => Err(AppError::new(format!(
            "DATABASE_MAX_CONNECTIONS is not a number ({value}): {e}"
        ))),
    }
}
