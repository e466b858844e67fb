use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

use crate::view::natural_delta;

/// Display classification of one unit, derived from its raw state code, its
/// pause reason, its wait deadline, and the owning group's run flags. The
/// peer's vocabulary may grow, so unrecognized codes fall back to `Unknown`
/// instead of erroring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Assigning,
    Downloading,
    Core,
    Running,
    Finishing,
    Uploading,
    Ended,
    Waiting,
    Paused,
    Dumping,
    Dumped,
    Expired,
    Aborted,
    MissingData,
    MaxRetries,
    Failed,
    Rejected,
    Credited,
    AssignWait,
    DownloadWait,
    CoreWait,
    RunWait,
    UploadWait,
    DumpWait,
    /// Peer-supplied pause reason, shown verbatim.
    PauseReason(String),
    Unknown,
}

impl UnitStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "ASSIGN" => UnitStatus::Assigning,
            "DOWNLOAD" => UnitStatus::Downloading,
            "CORE" => UnitStatus::Core,
            "RUN" => UnitStatus::Running,
            "FINISH" => UnitStatus::Finishing,
            "UPLOAD" => UnitStatus::Uploading,
            "CLEAN" => UnitStatus::Ended,
            "WAIT" => UnitStatus::Waiting,
            "PAUSE" => UnitStatus::Paused,
            "DUMP" => UnitStatus::Dumping,
            "DUMPED" => UnitStatus::Dumped,
            "EXPIRED" => UnitStatus::Expired,
            "ABORTED" => UnitStatus::Aborted,
            "MISSING" => UnitStatus::MissingData,
            "RETRIES" => UnitStatus::MaxRetries,
            "FAILED" => UnitStatus::Failed,
            "REJECTED" => UnitStatus::Rejected,
            "CREDITED" => UnitStatus::Credited,
            _ => UnitStatus::Unknown,
        }
    }

    /// Wait-qualified label for a unit sitting before its `wait` timestamp.
    pub fn wait_for_code(code: &str) -> Self {
        match code {
            "ASSIGN" => UnitStatus::AssignWait,
            "DOWNLOAD" => UnitStatus::DownloadWait,
            "CORE" => UnitStatus::CoreWait,
            "RUN" => UnitStatus::RunWait,
            "UPLOAD" => UnitStatus::UploadWait,
            "DUMP" => UnitStatus::DumpWait,
            other => UnitStatus::from_code(other),
        }
    }

    /// True for states a pausing group can settle in; units outside this set
    /// keep a pause wait going.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            UnitStatus::Paused
                | UnitStatus::PauseReason(_)
                | UnitStatus::Ended
                | UnitStatus::Dumped
                | UnitStatus::Expired
                | UnitStatus::Aborted
                | UnitStatus::MissingData
                | UnitStatus::MaxRetries
                | UnitStatus::Failed
                | UnitStatus::Rejected
                | UnitStatus::Credited
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitStatus::Assigning => "Assigning",
            UnitStatus::Downloading => "Downloading",
            UnitStatus::Core => "Core",
            UnitStatus::Running => "Running",
            UnitStatus::Finishing => "Finishing",
            UnitStatus::Uploading => "Uploading",
            UnitStatus::Ended => "Ended",
            UnitStatus::Waiting => "Waiting",
            UnitStatus::Paused => "Paused",
            UnitStatus::Dumping => "Dumping",
            UnitStatus::Dumped => "Dumped",
            UnitStatus::Expired => "Expired",
            UnitStatus::Aborted => "Aborted",
            UnitStatus::MissingData => "Missing Data",
            UnitStatus::MaxRetries => "Max Retries",
            UnitStatus::Failed => "Failed",
            UnitStatus::Rejected => "Rejected",
            UnitStatus::Credited => "Credited",
            UnitStatus::AssignWait => "Assign Wait",
            UnitStatus::DownloadWait => "Download Wait",
            UnitStatus::CoreWait => "Core Wait",
            UnitStatus::RunWait => "Run Wait",
            UnitStatus::UploadWait => "Upload Wait",
            UnitStatus::DumpWait => "Dump Wait",
            UnitStatus::PauseReason(reason) => reason,
            UnitStatus::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Run flags of a unit's owning group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupFlags {
    pub paused: bool,
    pub finish: bool,
}

pub fn group_flags(tree: &Value, group: &str) -> GroupFlags {
    let config = tree
        .get("groups")
        .and_then(|groups| groups.get(group))
        .and_then(|g| g.get("config"));
    GroupFlags {
        paused: config
            .and_then(|c| c.get("paused"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        finish: config
            .and_then(|c| c.get("finish"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn parse_utc(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// True while the unit's `wait` timestamp lies in the future.
pub fn unit_waiting(unit: &Value, now: DateTime<Utc>) -> bool {
    unit.get("wait")
        .and_then(Value::as_str)
        .and_then(parse_utc)
        .map(|until| now < until)
        .unwrap_or(false)
}

fn pause_reason(unit: &Value) -> Option<&str> {
    unit.get("pause_reason")
        .and_then(Value::as_str)
        .filter(|reason| !reason.is_empty())
}

fn raw_code(unit: &Value) -> &str {
    unit.get("state").and_then(Value::as_str).unwrap_or("")
}

/// Effective state code after folding in wait, result, and group flags.
fn effective_code(unit: &Value, flags: GroupFlags, now: DateTime<Utc>) -> String {
    if unit_waiting(unit, now) {
        return "WAIT".to_string();
    }
    let code = raw_code(unit);
    if code == "DONE" {
        if let Some(result) = unit.get("result").and_then(Value::as_str) {
            if !result.is_empty() {
                return result.to_uppercase();
            }
        }
    }
    if flags.finish && code == "RUN" {
        return "FINISH".to_string();
    }
    if flags.paused || pause_reason(unit).is_some() {
        return "PAUSE".to_string();
    }
    code.to_string()
}

/// Total classification: every `(flags, code)` pair yields some label.
pub fn classify_unit(unit: &Value, flags: GroupFlags, now: DateTime<Utc>) -> UnitStatus {
    if unit_waiting(unit, now) {
        return UnitStatus::wait_for_code(raw_code(unit));
    }
    if let Some(reason) = pause_reason(unit) {
        return UnitStatus::PauseReason(reason.to_string());
    }
    UnitStatus::from_code(&effective_code(unit, flags, now))
}

/// Derived run state of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRunState {
    Pause,
    Finish { wait_secs: Option<i64> },
    Run { wait_secs: Option<i64> },
}

impl fmt::Display for GroupRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRunState::Pause => f.write_str("Paused"),
            GroupRunState::Finish { wait_secs } => match wait_secs {
                Some(secs) => write!(f, "Finish Wait {}", natural_delta(*secs)),
                None => f.write_str("Finish"),
            },
            GroupRunState::Run { wait_secs } => match wait_secs {
                Some(secs) => write!(f, "Run Wait {}", natural_delta(*secs)),
                None => f.write_str("Run"),
            },
        }
    }
}

pub fn group_run_state(tree: &Value, group: &str, now: DateTime<Utc>) -> GroupRunState {
    let flags = group_flags(tree, group);
    if flags.paused {
        return GroupRunState::Pause;
    }
    let wait_secs = tree
        .get("groups")
        .and_then(|groups| groups.get(group))
        .and_then(|g| g.get("wait"))
        .and_then(Value::as_str)
        .and_then(parse_utc)
        .map(|until| (until - now).num_seconds())
        .filter(|secs| *secs > 1);
    if flags.finish {
        GroupRunState::Finish { wait_secs }
    } else {
        GroupRunState::Run { wait_secs }
    }
}

/// Units assigned to `group`, in report order. A unit without a group field
/// belongs to the default group.
pub fn units_of<'a>(tree: &'a Value, group: &str) -> Vec<&'a Value> {
    tree.get("units")
        .and_then(Value::as_array)
        .map(|units| {
            units
                .iter()
                .filter(|unit| {
                    unit.get("group").and_then(Value::as_str).unwrap_or("") == group
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A group is truly paused only once its pause flag is set and every unit
/// has settled; a unit still mid-checkpoint (no pause reason yet) keeps the
/// group in a pause-pending sub-state.
pub fn group_truly_paused(tree: &Value, group: &str, now: DateTime<Utc>) -> bool {
    if !group_flags(tree, group).paused {
        return false;
    }
    // Classify against neutral flags: the group's own pause flag must not
    // turn a still-running unit into a settled one.
    units_of(tree, group)
        .iter()
        .all(|unit| classify_unit(unit, GroupFlags::default(), now).is_settled())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2024-06-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn classification_is_total() {
        let codes = [
            "ASSIGN", "DOWNLOAD", "CORE", "RUN", "FINISH", "UPLOAD", "CLEAN", "WAIT", "PAUSE",
            "DUMP", "DUMPED", "EXPIRED", "ABORTED", "MISSING", "RETRIES", "FAILED", "REJECTED",
            "CREDITED", "SOMETHING_NEW", "",
        ];
        for code in codes {
            for paused in [false, true] {
                for finish in [false, true] {
                    let unit = json!({"state": code});
                    let status =
                        classify_unit(&unit, GroupFlags { paused, finish }, now());
                    assert!(!status.to_string().is_empty());
                }
            }
        }
        assert_eq!(UnitStatus::from_code("SOMETHING_NEW"), UnitStatus::Unknown);
    }

    #[test]
    fn waiting_unit_gets_wait_label() {
        let unit = json!({"state": "RUN", "wait": "2024-06-01T12:05:00Z"});
        assert_eq!(
            classify_unit(&unit, GroupFlags::default(), now()),
            UnitStatus::RunWait
        );
        // wait already elapsed
        let unit = json!({"state": "RUN", "wait": "2024-06-01T11:00:00Z"});
        assert_eq!(
            classify_unit(&unit, GroupFlags::default(), now()),
            UnitStatus::Running
        );
    }

    #[test]
    fn pause_reason_shown_verbatim() {
        let unit = json!({"state": "RUN", "pause_reason": "On battery"});
        let status = classify_unit(&unit, GroupFlags::default(), now());
        assert_eq!(status.to_string(), "On battery");
        assert!(status.is_settled());
    }

    #[test]
    fn finish_flag_promotes_running_unit() {
        let unit = json!({"state": "RUN"});
        let flags = GroupFlags {
            paused: false,
            finish: true,
        };
        assert_eq!(classify_unit(&unit, flags, now()), UnitStatus::Finishing);
    }

    #[test]
    fn done_unit_reports_result() {
        let unit = json!({"state": "DONE", "result": "credited"});
        assert_eq!(
            classify_unit(&unit, GroupFlags::default(), now()),
            UnitStatus::Credited
        );
    }

    #[test]
    fn group_run_state_labels() {
        let tree = json!({
            "groups": {
                "idle": {"config": {"paused": true}},
                "busy": {"config": {"finish": false}},
                "winding": {"config": {"finish": true}, "wait": "2024-06-01T12:02:05Z"},
            }
        });
        assert_eq!(group_run_state(&tree, "idle", now()), GroupRunState::Pause);
        assert_eq!(
            group_run_state(&tree, "busy", now()),
            GroupRunState::Run { wait_secs: None }
        );
        assert_eq!(
            group_run_state(&tree, "winding", now()).to_string(),
            "Finish Wait 02m 05s"
        );
    }

    #[test]
    fn pause_pending_unit_blocks_truly_paused() {
        let tree = json!({
            "groups": {"rg1": {"config": {"paused": true}}},
            "units": [
                {"group": "rg1", "state": "RUN"}
            ]
        });
        assert!(!group_truly_paused(&tree, "rg1", now()));

        let tree = json!({
            "groups": {"rg1": {"config": {"paused": true}}},
            "units": [
                {"group": "rg1", "state": "PAUSE", "pause_reason": "Paused by user"}
            ]
        });
        assert!(group_truly_paused(&tree, "rg1", now()));
    }

    #[test]
    fn unpaused_group_is_never_truly_paused() {
        let tree = json!({
            "groups": {"rg1": {"config": {}}},
            "units": []
        });
        assert!(!group_truly_paused(&tree, "rg1", now()));
    }
}
