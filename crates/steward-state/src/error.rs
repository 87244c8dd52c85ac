use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid state name `{0}`")]
    InvalidName(String),
    #[error("payload for `{name}` failed schema validation: {detail}")]
    Schema { name: String, detail: String },
    #[error("state `{name}` is corrupted: {detail}")]
    Corruption { name: String, detail: String },
    #[error("sensitive state file {0} is not owner-only")]
    Permission(PathBuf),
    #[error("no migration registered from version {from} toward {target} for `{name}`")]
    MissingMigration { name: String, from: u32, target: u32 },
    #[error("migration {from}->{to} failed for `{name}`: {detail}")]
    Migration {
        name: String,
        from: u32,
        to: u32,
        detail: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl StateError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StateError::Corruption { .. })
    }
}
