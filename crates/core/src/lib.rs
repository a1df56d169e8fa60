#![forbid(unsafe_code)]

pub mod context;
pub mod events;
pub mod failure;
pub mod packet;
pub mod rollup;
pub mod status;
pub mod time;

pub use failure::FailureKind;

pub mod ids {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct WorkspaceId(String);

    impl WorkspaceId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
            let value = value.into();
            validate_workspace_id(&value)?;
            Ok(Self(value))
        }
    }

    impl std::fmt::Display for WorkspaceId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum IdError {
        Empty,
        TooLong,
        InvalidFirstChar,
        InvalidChar { ch: char, index: usize },
        InvalidNode,
        InvalidJob,
    }

    impl std::fmt::Display for IdError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Empty => write!(f, "id must not be empty"),
                Self::TooLong => write!(f, "id is too long"),
                Self::InvalidFirstChar => write!(f, "id must start with [A-Za-z0-9]"),
                Self::InvalidChar { ch, index } => {
                    write!(f, "id has invalid char {ch:?} at {index}")
                }
                Self::InvalidNode => write!(f, "node id must look like node<index>"),
                Self::InvalidJob => write!(f, "job id must look like job<number>"),
            }
        }
    }

    impl std::error::Error for IdError {}

    fn validate_workspace_id(value: &str) -> Result<(), IdError> {
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > 128 {
            return Err(IdError::TooLong);
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(IdError::Empty);
        };
        if !first.is_ascii_alphanumeric() {
            return Err(IdError::InvalidFirstChar);
        }
        for (index, ch) in value.chars().enumerate() {
            if index == 0 {
                continue;
            }
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                continue;
            }
            return Err(IdError::InvalidChar { ch, index });
        }
        Ok(())
    }

    /// `node<index>` within a job.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct NodeId(usize);

    impl NodeId {
        pub fn from_index(index: usize) -> Self {
            Self(index)
        }

        pub fn index(&self) -> usize {
            self.0
        }

        pub fn parse(raw: &str) -> Result<Self, IdError> {
            let digits = raw
                .trim()
                .strip_prefix("node")
                .ok_or(IdError::InvalidNode)?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(IdError::InvalidNode);
            }
            digits
                .parse::<usize>()
                .map(Self)
                .map_err(|_| IdError::InvalidNode)
        }
    }

    impl std::fmt::Display for NodeId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "node{}", self.0)
        }
    }

    impl TryFrom<String> for NodeId {
        type Error = IdError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::parse(&value)
        }
    }

    impl From<NodeId> for String {
        fn from(value: NodeId) -> Self {
            value.to_string()
        }
    }

    pub fn job_id_from_seq(seq: i64) -> String {
        format!("job{seq}")
    }

    pub fn parse_job_seq(raw: &str) -> Result<i64, IdError> {
        let digits = raw.trim().strip_prefix("job").ok_or(IdError::InvalidJob)?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(IdError::InvalidJob);
        }
        digits.parse::<i64>().map_err(|_| IdError::InvalidJob)
    }

    pub fn run_name_from_seq(seq: i64) -> String {
        format!("run{seq}")
    }

    pub fn child_run_name(parent: &str, child_seq: i64) -> String {
        format!("{parent}.{child_seq}")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn node_ids_round_trip_through_strings() {
            let node = NodeId::parse("node12").expect("node id");
            assert_eq!(node.index(), 12);
            assert_eq!(node.to_string(), "node12");
            assert!(NodeId::parse("node").is_err());
            assert!(NodeId::parse("n1").is_err());
            assert!(NodeId::parse("node-1").is_err());
        }

        #[test]
        fn workspace_ids_reject_bad_chars() {
            assert!(WorkspaceId::try_new("ws-1_a.b").is_ok());
            assert_eq!(WorkspaceId::try_new(""), Err(IdError::Empty));
            assert_eq!(
                WorkspaceId::try_new("_ws"),
                Err(IdError::InvalidFirstChar)
            );
            assert!(matches!(
                WorkspaceId::try_new("ws x"),
                Err(IdError::InvalidChar { ch: ' ', index: 2 })
            ));
        }

        #[test]
        fn job_and_run_names_are_sequence_based() {
            assert_eq!(job_id_from_seq(7), "job7");
            assert_eq!(parse_job_seq("job42"), Ok(42));
            assert!(parse_job_seq("JOB-1").is_err());
            assert_eq!(child_run_name(&run_name_from_seq(3), 2), "run3.2");
        }
    }
}
