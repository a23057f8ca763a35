//! Service and database configuration types.

use serde::Deserialize;

/// HTTP service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, used in logs and as the default consumer tag.
    pub name: String,
    /// Host to bind to.
    pub host: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "usermesh".to_string(),
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl ServiceConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL (postgres://...). Required.
    pub url: Option<String>,
    pub max_connections: u32,
    /// Create tables at start-up if they do not exist.
    pub init_schema: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
            init_schema: true,
        }
    }
}
