use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("schema error in source '{source_id}': missing columns {missing:?}")]
    Schema {
        source_id: String,
        missing: Vec<String>,
    },

    #[error("unknown values in column '{column}' of source '{source_id}': {values:?}")]
    UnknownValue {
        source_id: String,
        column: String,
        values: Vec<String>,
    },

    #[error("invalid value '{value}' in column '{column}' of source '{source_id}': {reason}")]
    InvalidValue {
        source_id: String,
        column: String,
        value: String,
        reason: String,
    },

    #[error("duplicate key ({entity}, {date}) in table '{table}'")]
    Cardinality {
        table: String,
        entity: String,
        date: NaiveDate,
    },

    #[error(
        "monotonicity budget exceeded for '{entity}' at {date} on '{metric}': more than {max_removed} points would be removed"
    )]
    MonotonicityBudgetExceeded {
        entity: String,
        date: NaiveDate,
        metric: String,
        max_removed: usize,
    },

    #[error("row ({entity}, {date}) in table '{table}' has no source_url")]
    MissingSourceUrl {
        table: String,
        entity: String,
        date: NaiveDate,
    },

    #[error("snapshot '{key}' is corrupt: {reason}")]
    SnapshotCorrupt { key: String, reason: String },

    #[error("entity '{entity}' failed: {source}")]
    Entity {
        entity: String,
        #[source]
        source: Box<ReconcileError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("worker task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ReconcileError {
    /// Stable name of the violated rule, used for log fields and metric labels.
    pub fn rule(&self) -> &'static str {
        match self {
            ReconcileError::Schema { .. } => "schema",
            ReconcileError::UnknownValue { .. } => "unknown_value",
            ReconcileError::InvalidValue { .. } => "invalid_value",
            ReconcileError::Cardinality { .. } => "cardinality",
            ReconcileError::MonotonicityBudgetExceeded { .. } => "monotonicity_budget",
            ReconcileError::MissingSourceUrl { .. } => "missing_source_url",
            ReconcileError::SnapshotCorrupt { .. } => "snapshot_corrupt",
            ReconcileError::Entity { source, .. } => source.rule(),
            ReconcileError::Config(_) => "config",
            ReconcileError::Task(_) => "task",
            ReconcileError::Io(_) => "io",
            ReconcileError::Json(_) => "json",
            ReconcileError::Toml(_) => "toml",
        }
    }

    /// Attach the failing entity unless the error already carries it.
    pub fn for_entity(self, entity: &str) -> Self {
        match self {
            err @ ReconcileError::Entity { .. } => err,
            other => ReconcileError::Entity {
                entity: entity.to_string(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_wrapper_keeps_inner_rule() {
        let err = ReconcileError::Cardinality {
            table: "vaccinations".to_string(),
            entity: "Chile".to_string(),
            date: NaiveDate::from_ymd_opt(2021, 5, 1).unwrap(),
        }
        .for_entity("Chile");

        assert_eq!(err.rule(), "cardinality");
        let message = err.to_string();
        assert!(message.contains("Chile"));
        assert!(message.contains("2021-05-01"));
    }

    #[test]
    fn for_entity_does_not_double_wrap() {
        let err = ReconcileError::Config("bad".to_string())
            .for_entity("Peru")
            .for_entity("Peru");
        match err {
            ReconcileError::Entity { source, .. } => {
                assert!(matches!(*source, ReconcileError::Config(_)))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
