//! Transaction isolation levels.
//!
//! The four SQL levels are accepted everywhere a level can be configured.
//! How a level is honoured is up to the backend; the document store maps
//! them as follows:
//! - READ UNCOMMITTED / READ COMMITTED: reads see the latest committed state
//! - REPEATABLE READ: reads see the snapshot taken at transaction start,
//!   concurrent writes to the same rows fail the commit
//! - SERIALIZABLE: as REPEATABLE READ, and rows or tables read by the
//!   transaction must also be unchanged at commit

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transaction::error::TransactionError;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IsolationLevel {
    /// Dirty reads allowed by the SQL standard. Backends may treat this as
    /// READ COMMITTED.
    ReadUncommitted,

    /// Each read sees the most recently committed data at the time of the read.
    #[default]
    ReadCommitted,

    /// Snapshot isolation: all reads see the state as of transaction start,
    /// write-write conflicts abort the later committer.
    RepeatableRead,

    /// Snapshot isolation with read validation at commit.
    Serializable,
}

impl IsolationLevel {
    /// Check if this isolation level uses snapshot reads.
    pub fn uses_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead | IsolationLevel::Serializable)
    }

    /// Check if commits validate the rows that were written.
    pub fn validates_writes(&self) -> bool {
        self.uses_snapshot()
    }

    /// Check if commits validate the rows and tables that were read.
    pub fn validates_reads(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }

    /// SQL spelling of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "READ UNCOMMITTED" | "READUNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" | "READCOMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" | "REPEATABLEREAD" | "SNAPSHOT" => {
                Ok(IsolationLevel::RepeatableRead)
            }
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(TransactionError::InvalidConfig(format!(
                "unknown isolation level: {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for IsolationLevel {
    type Error = TransactionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IsolationLevel> for String {
    fn from(value: IsolationLevel) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_isolation() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_uses_snapshot() {
        assert!(!IsolationLevel::ReadUncommitted.uses_snapshot());
        assert!(!IsolationLevel::ReadCommitted.uses_snapshot());
        assert!(IsolationLevel::RepeatableRead.uses_snapshot());
        assert!(IsolationLevel::Serializable.uses_snapshot());
        assert!(!IsolationLevel::RepeatableRead.validates_reads());
        assert!(IsolationLevel::Serializable.validates_reads());
    }

    #[test]
    fn test_parse_isolation() {
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "Serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!(matches!(
            "CHAOS".parse::<IsolationLevel>(),
            Err(TransactionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_serde_uses_sql_spelling() {
        let json = serde_json::to_string(&IsolationLevel::ReadUncommitted).unwrap();
        assert_eq!(json, "\"READ UNCOMMITTED\"");
        let level: IsolationLevel = serde_json::from_str("\"SERIALIZABLE\"").unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }
}
