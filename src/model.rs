use chrono::{DateTime, Utc};
use serde::Serialize;

/// An application whose recorded version changed during a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatedApplication {
    pub application: String,
    pub version: String,
}

/// The current version of one application in a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct LatestVersion {
    pub application: String,
    pub version: String,
}

/// One entry of the version history of an (application, context) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct VersionRecord {
    pub version: String,
    pub created: DateTime<Utc>,
}
