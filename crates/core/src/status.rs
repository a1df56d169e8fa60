#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownValue {
    pub what: &'static str,
    pub value: String,
}

impl std::fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {}: {}", self.what, self.value)
    }
}

impl std::error::Error for UnknownValue {}

macro_rules! string_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownValue;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownValue { what: $what, value: other.to_string() }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// How a job's planned runs are distributed across nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Entries pre-partitioned round-robin; a node only runs its own entries.
    Static,
    /// Entries unassigned until claimed; preempted entries can move nodes.
    Dynamic,
}

string_enum!(Schedule, "schedule", { Static => "static", Dynamic => "dynamic" });

/// Assignment state of one active-run entry.
///
/// Legal transitions:
/// `unstarted -> started -> completed` and
/// `started -> waiting_for_restart -> restarted -> completed`.
/// `restarted` may itself be preempted again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveRunStatus {
    Unstarted,
    Started,
    Restarted,
    WaitingForRestart,
    Completed,
}

string_enum!(ActiveRunStatus, "active-run status", {
    Unstarted => "unstarted",
    Started => "started",
    Restarted => "restarted",
    WaitingForRestart => "waiting_for_restart",
    Completed => "completed",
});

impl ActiveRunStatus {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Started | Self::Restarted)
    }

    pub fn can_transition_to(&self, next: ActiveRunStatus) -> bool {
        use ActiveRunStatus::*;
        matches!(
            (self, next),
            (Unstarted, Started)
                | (Started, Completed)
                | (Started, WaitingForRestart)
                | (WaitingForRestart, Restarted)
                | (Restarted, Completed)
                | (Restarted, WaitingForRestart)
        )
    }
}

/// Lifecycle status of a run record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Queued,
    Spawning,
    Running,
    Dying,
    Completed,
    Error,
    Cancelled,
}

string_enum!(RunStatus, "run status", {
    Created => "created",
    Queued => "queued",
    Spawning => "spawning",
    Running => "running",
    Dying => "dying",
    Completed => "completed",
    Error => "error",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Created | Self::Queued => Stage::Queued,
            Self::Spawning | Self::Running | Self::Dying => Stage::Active,
            Self::Completed | Self::Error | Self::Cancelled => Stage::Completed,
        }
    }
}

/// Coarse grouping of run statuses used by `get_runs` filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Active,
    Completed,
}

string_enum!(Stage, "stage", { Queued => "queued", Active => "active", Completed => "completed" });

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Running,
    Completed,
}

string_enum!(JobStatus, "job status", {
    Created => "created",
    Running => "running",
    Completed => "completed",
});

/// How runs for a job are materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchStyle {
    #[default]
    Single,
    Static,
    Dynamic,
}

string_enum!(SearchStyle, "search style", {
    Single => "single",
    Static => "static",
    Dynamic => "dynamic",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_run_graph_matches_lifecycle() {
        use ActiveRunStatus::*;
        assert!(Unstarted.can_transition_to(Started));
        assert!(Started.can_transition_to(WaitingForRestart));
        assert!(WaitingForRestart.can_transition_to(Restarted));
        assert!(Restarted.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Started));
        assert!(!Completed.can_transition_to(Completed));
        assert!(!Unstarted.can_transition_to(Completed));
        assert!(!WaitingForRestart.can_transition_to(Completed));
    }

    #[test]
    fn statuses_parse_case_insensitively() {
        assert_eq!(
            "Waiting_For_Restart".parse::<ActiveRunStatus>(),
            Ok(ActiveRunStatus::WaitingForRestart)
        );
        assert_eq!("DYNAMIC".parse::<Schedule>(), Ok(Schedule::Dynamic));
        assert!("killled".parse::<RunStatus>().is_err());
        assert_eq!(RunStatus::Dying.stage(), Stage::Active);
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn serde_uses_snake_case() {
        let text = serde_json::to_string(&ActiveRunStatus::WaitingForRestart).expect("json");
        assert_eq!(text, "\"waiting_for_restart\"");
    }
}
