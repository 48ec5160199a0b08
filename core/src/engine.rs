//! Supported database engines and the connection strings they expect.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// Host every generated connection string points at. The forward listens on
/// both `127.0.0.1` and `::1`, so either resolution of the name reaches it.
const LOCAL_HOST: &str = "localhost";

/// A database engine reachable through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    MySql,
    MsSql,
    Oracle,
    PostgreSql,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] = [
        EngineKind::MySql,
        EngineKind::MsSql,
        EngineKind::Oracle,
        EngineKind::PostgreSql,
    ];

    /// Human-readable engine name.
    pub fn display_name(self) -> &'static str {
        match self {
            EngineKind::MySql => "MySql",
            EngineKind::MsSql => "MsSql",
            EngineKind::Oracle => "Oracle",
            EngineKind::PostgreSql => "PostgreSql",
        }
    }

    /// Build the driver connection string for a forward listening on
    /// `localhost:<local_port>`.
    ///
    /// A missing database name produces an empty trailing segment.
    ///
    /// The MSSQL form carries no port and relies on the driver's default
    /// instance resolution; it is emitted exactly as the other tooling built
    /// against this format expects it.
    pub fn connection_string(self, local_port: u16, database: Option<&str>) -> String {
        let database = database.unwrap_or("");
        match self {
            EngineKind::MySql => format!("mysql://{LOCAL_HOST}:{local_port}/{database}"),
            EngineKind::MsSql => format!("sqlserver://{LOCAL_HOST}/{database}"),
            EngineKind::Oracle => format!("oracle:{local_port}:{database}"),
            EngineKind::PostgreSql => {
                format!("postgresql://{LOCAL_HOST}:{local_port}/{database}")
            }
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for EngineKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(EngineKind::MySql),
            "mssql" | "sqlserver" => Ok(EngineKind::MsSql),
            "oracle" => Ok(EngineKind::Oracle),
            "postgresql" | "postgres" => Ok(EngineKind::PostgreSql),
            _ => Err(CoreError::UnknownEngine(s.to_string())),
        }
    }
}
