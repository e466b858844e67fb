use chrono::{SecondsFormat, Utc};
use foldctl_core::patch::{PatchError, PatchOp, Segment};
use serde_json::Value;

/// A classified inbound frame. The peer pushes everything: a full document,
/// an incremental update, or an opaque event (log lines, pings). There is no
/// request/response correlation on this protocol.
#[derive(Debug, Clone)]
pub enum Inbound {
    Snapshot(Value),
    Patch(Vec<PatchOp>),
    Event(Value),
}

/// Classify one parsed frame. Arrays are updates, except log frames which
/// are forwarded to subscribers unprocessed; objects are full snapshots;
/// anything else (e.g. `"ping"`) is an opaque event.
pub fn classify(message: &Value) -> Result<Inbound, PatchError> {
    match message {
        Value::Object(_) => Ok(Inbound::Snapshot(message.clone())),
        Value::Array(items) => {
            if items.first().and_then(Value::as_str) == Some("log") {
                return Ok(Inbound::Event(message.clone()));
            }
            Ok(Inbound::Patch(decode_update(items)?))
        }
        _ => Ok(Inbound::Event(message.clone())),
    }
}

/// Decode the peer's update form `[segment.., last_key, value]` into patch
/// operations: last key `-1` appends, `-2` extends with each element of the
/// value, a `null` value removes, anything else upserts.
pub fn decode_update(items: &[Value]) -> Result<Vec<PatchOp>, PatchError> {
    if items.len() < 2 {
        return Err(PatchError::MalformedUpdate(
            "update needs at least a key and a value".to_string(),
        ));
    }
    let mut path = Vec::with_capacity(items.len() - 1);
    for item in &items[..items.len() - 2] {
        path.push(segment(item)?);
    }
    let last = &items[items.len() - 2];
    let value = items[items.len() - 1].clone();

    if let Some(index) = last.as_i64() {
        if index == -1 {
            path.push(Segment::End);
            return Ok(vec![PatchOp::Add { path, value }]);
        }
        if index == -2 {
            let elements = value.as_array().ok_or_else(|| {
                PatchError::MalformedUpdate("extend value must be a sequence".to_string())
            })?;
            return Ok(elements
                .iter()
                .map(|element| {
                    let mut path = path.clone();
                    path.push(Segment::End);
                    PatchOp::Add {
                        path,
                        value: element.clone(),
                    }
                })
                .collect());
        }
    }
    path.push(segment(last)?);
    if value.is_null() {
        Ok(vec![PatchOp::Remove { path }])
    } else {
        Ok(vec![PatchOp::Add { path, value }])
    }
}

fn segment(item: &Value) -> Result<Segment, PatchError> {
    match item {
        Value::String(key) => Ok(Segment::Key(key.clone())),
        Value::Number(n) => n
            .as_u64()
            .map(|index| Segment::Index(index as usize))
            .ok_or_else(|| {
                PatchError::MalformedUpdate(format!("bad path segment index: {n}"))
            }),
        other => Err(PatchError::MalformedUpdate(format!(
            "bad path segment: {other}"
        ))),
    }
}

/// Serialize an outbound command, stamping a UTC `time` field (seconds
/// precision) when the caller did not provide one.
pub fn command_message(mut command: Value) -> String {
    if let Value::Object(map) = &mut command {
        if !map.contains_key("time") {
            let time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            map.insert("time".to_string(), Value::String(time));
        }
    }
    command.to_string()
}

/// Peer client version from a mirrored tree, `(0, 0, 0)` when absent.
pub fn peer_version(tree: &Value) -> (u64, u64, u64) {
    let raw = tree
        .get("info")
        .and_then(|info| info.get("version"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let mut parts = raw.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

pub fn version_string(version: (u64, u64, u64)) -> String {
    format!("{}.{}.{}", version.0, version.1, version.2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_classify_as_snapshots() {
        let frame = json!({"info": {"version": "8.3.18"}});
        assert!(matches!(classify(&frame), Ok(Inbound::Snapshot(_))));
    }

    #[test]
    fn scalar_frames_are_events() {
        assert!(matches!(classify(&json!("ping")), Ok(Inbound::Event(_))));
    }

    #[test]
    fn log_frames_are_events_not_patches() {
        let frame = json!(["log", -2, ["line one", "line two"]]);
        assert!(matches!(classify(&frame), Ok(Inbound::Event(_))));
    }

    #[test]
    fn update_decodes_to_upsert() {
        let ops =
            decode_update(json!(["groups", "rg1", "units", 0, "progress", 0.9]).as_array().unwrap())
                .unwrap();
        assert_eq!(
            ops,
            vec![PatchOp::Add {
                path: vec![
                    Segment::key("groups"),
                    Segment::key("rg1"),
                    Segment::key("units"),
                    Segment::Index(0),
                    Segment::key("progress"),
                ],
                value: json!(0.9),
            }]
        );
    }

    #[test]
    fn null_value_decodes_to_remove() {
        let ops = decode_update(json!(["config", "passkey", null]).as_array().unwrap()).unwrap();
        assert_eq!(
            ops,
            vec![PatchOp::Remove {
                path: vec![Segment::key("config"), Segment::key("passkey")],
            }]
        );
    }

    #[test]
    fn minus_one_appends() {
        let ops = decode_update(json!(["units", -1, {"id": "u1"}]).as_array().unwrap()).unwrap();
        assert_eq!(
            ops,
            vec![PatchOp::Add {
                path: vec![Segment::key("units"), Segment::End],
                value: json!({"id": "u1"}),
            }]
        );
    }

    #[test]
    fn minus_two_extends_element_wise() {
        let ops = decode_update(json!(["peers", -2, ["a", "b"]]).as_array().unwrap()).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(
            ops[1],
            PatchOp::Add {
                path: vec![Segment::key("peers"), Segment::End],
                value: json!("b"),
            }
        );
    }

    #[test]
    fn short_or_bad_updates_are_malformed() {
        assert!(decode_update(json!(["lonely"]).as_array().unwrap()).is_err());
        assert!(decode_update(json!([true, "x", 1]).as_array().unwrap()).is_err());
        assert!(decode_update(json!(["xs", -2, "not a list"]).as_array().unwrap()).is_err());
    }

    #[test]
    fn command_message_stamps_time() {
        let text = command_message(json!({"cmd": "state", "state": "pause"}));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["cmd"], "state");
        let time = value["time"].as_str().unwrap();
        assert!(time.ends_with('Z'));

        let text = command_message(json!({"cmd": "log", "time": "t0"}));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["time"], "t0");
    }

    #[test]
    fn version_parses_leniently() {
        assert_eq!(
            peer_version(&json!({"info": {"version": "8.3.18"}})),
            (8, 3, 18)
        );
        assert_eq!(peer_version(&json!({"info": {"version": "8.4"}})), (8, 4, 0));
        assert_eq!(peer_version(&json!({})), (0, 0, 0));
    }
}
