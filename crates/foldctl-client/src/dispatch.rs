use std::time::Duration;

use chrono::Utc;
use foldctl_core::config::{self, ConfigScope};
use foldctl_core::peer::{groups_of, resolve_group};
use foldctl_core::status::{group_flags, group_truly_paused, units_of};
use foldctl_core::FoldError;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::session::PeerSession;
use crate::wire::version_string;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Intents with a 1:1 wire command against a group's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunIntent {
    Fold,
    Finish,
    Pause,
}

impl RunIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunIntent::Fold => "fold",
            RunIntent::Finish => "finish",
            RunIntent::Pause => "pause",
        }
    }
}

/// Set the run state of the session's configured group, or of every group
/// when none is configured. Validated locally before any wire traffic; the
/// effect is only observable through the patch stream.
pub async fn set_run_state(
    session: &PeerSession,
    intent: RunIntent,
    force: bool,
) -> Result<(), FoldError> {
    let tree = session.snapshot().await;
    let groups = groups_of(&tree);
    let target = match session.peer().group.as_deref() {
        Some(requested) => Some(resolve_group(requested, &groups)?),
        None => None,
    };
    if intent == RunIntent::Finish && !force {
        let scope: Vec<String> = match &target {
            Some(group) => vec![group.clone()],
            None => groups.clone(),
        };
        for group in &scope {
            if paused_with_running_unit(&tree, group) {
                return Err(FoldError::ForceRequired(format!(
                    "group \"{group}\" is paused with a unit still running; \
                     finishing it now may lose checkpoint progress"
                )));
            }
        }
    }
    let mut message = json!({"cmd": "state", "state": intent.as_str()});
    if let Some(group) = target {
        message["group"] = Value::String(group);
    }
    session.send_command(message).await
}

fn paused_with_running_unit(tree: &Value, group: &str) -> bool {
    group_flags(tree, group).paused
        && units_of(tree, group)
            .iter()
            .any(|unit| unit.get("state").and_then(Value::as_str) == Some("RUN"))
}

/// Read a config value: per-group keys come from the resolved group's
/// config, everything else from the peer's main config.
pub async fn config_get(session: &PeerSession, key: &str) -> Result<Value, FoldError> {
    let key = config::normalize_key(key);
    let tree = session.snapshot().await;
    if config::scope_for_key(&key) == Some(ConfigScope::Group) {
        let group = resolve_config_group(session, &tree)?;
        Ok(tree
            .get("groups")
            .and_then(|groups| groups.get(&group))
            .and_then(|g| g.get("config"))
            .and_then(|c| c.get(&key))
            .cloned()
            .unwrap_or(Value::Null))
    } else {
        Ok(tree
            .get("config")
            .and_then(|c| c.get(&key))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// Set a config value. Per-group keys are written through a full groups map
/// so the peer keeps the groups we do not touch.
pub async fn config_set(
    session: &PeerSession,
    key: &str,
    raw_value: &str,
    force: bool,
) -> Result<(), FoldError> {
    let key = config::normalize_key(key);
    if config::DEPRECATED_KEYS.contains(&key.as_str()) {
        return Err(FoldError::InvalidConfigKey(key));
    }
    let scope = match config::scope_for_key(&key) {
        Some(ConfigScope::Account) => ConfigScope::Account,
        Some(ConfigScope::Group) => ConfigScope::Group,
        Some(ConfigScope::ReadOnly) | None => {
            return Err(FoldError::InvalidConfigKey(key));
        }
    };
    let value = config::validate_value(&key, raw_value, force)?;
    let tree = session.snapshot().await;

    if key == "cpus" {
        let available = tree
            .get("info")
            .and_then(|info| info.get("cpus"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if value.as_u64().unwrap_or(0) > available {
            return Err(FoldError::InvalidConfigValue {
                key,
                reason: format!("greater than available cpus {available}"),
            });
        }
    }

    let payload = if scope == ConfigScope::Group {
        let group = resolve_config_group(session, &tree)?;
        // every existing group must appear or the peer drops the rest
        let mut groups_config = Map::new();
        for name in groups_of(&tree) {
            groups_config.insert(name, json!({}));
        }
        groups_config.insert(group, json!({ key: value }));
        json!({ "groups": groups_config })
    } else {
        let linked = tree
            .get("info")
            .and_then(|info| info.get("account"))
            .and_then(Value::as_str)
            .map(|account| !account.is_empty())
            .unwrap_or(false);
        if linked {
            warn!(
                peer = %session.name(),
                key = %key,
                "machine is linked to an account; the account may overwrite this value"
            );
        }
        json!({ key: value })
    };
    session
        .send_command(json!({"cmd": "config", "config": payload}))
        .await
}

/// The group a config intent applies to: the one from the peer address, or
/// the only group when exactly one exists.
fn resolve_config_group(session: &PeerSession, tree: &Value) -> Result<String, FoldError> {
    let groups = groups_of(tree);
    match session.peer().group.as_deref() {
        Some(requested) => resolve_group(requested, &groups),
        None if groups.len() == 1 => Ok(groups[0].clone()),
        None => Err(FoldError::AmbiguousGroup(format!(
            "a group must be specified; there are {} groups",
            groups.len()
        ))),
    }
}

/// Create a group by the pause-state side effect; an existing name is left
/// alone.
pub async fn create_group(session: &PeerSession, name: &str) -> Result<(), FoldError> {
    require_version(session, (8, 3, 1), "create-group").await?;
    let name = name.trim();
    if session.groups().await.iter().any(|g| g == name) {
        warn!(peer = %session.name(), group = %name, "group already exists");
        return Ok(());
    }
    session
        .send_command(json!({"cmd": "state", "state": "pause", "group": name}))
        .await
}

pub async fn dump_unit(session: &PeerSession, unit_id: &str) -> Result<(), FoldError> {
    session
        .send_command(json!({"cmd": "dump", "unit": unit_id}))
        .await
}

/// Paused units in the session's group scope, in report order.
pub async fn paused_units(session: &PeerSession) -> Result<Vec<Value>, FoldError> {
    let tree = session.snapshot().await;
    let group = match session.peer().group.as_deref() {
        Some(requested) => Some(resolve_group(requested, &groups_of(&tree))?),
        None => None,
    };
    let units = tree
        .get("units")
        .and_then(Value::as_array)
        .map(|units| {
            units
                .iter()
                .filter(|unit| {
                    unit.get("pause_reason")
                        .and_then(Value::as_str)
                        .map(|reason| !reason.is_empty())
                        .unwrap_or(false)
                })
                .filter(|unit| match &group {
                    Some(group) => {
                        unit.get("group").and_then(Value::as_str).unwrap_or("") == group
                    }
                    None => true,
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    Ok(units)
}

/// Dump every paused unit in scope. Without `force` the units are only
/// reported back to the caller.
pub async fn dump_all(session: &PeerSession, force: bool) -> Result<Vec<Value>, FoldError> {
    let units = paused_units(session).await?;
    if force {
        for unit in &units {
            if let Some(unit_id) = unit.get("id").and_then(Value::as_str) {
                dump_unit(session, unit_id).await?;
            } else {
                warn!(peer = %session.name(), "paused unit has no id; skipping");
            }
        }
    }
    Ok(units)
}

/// Link to an account; missing token or machine name fall back to the
/// values the peer already knows.
pub async fn link_account(
    session: &PeerSession,
    token: Option<&str>,
    machine_name: Option<&str>,
) -> Result<(), FoldError> {
    require_version(session, (8, 3, 1), "link-account").await?;
    let tree = session.snapshot().await;
    let info = tree.get("info");
    let token = token
        .map(str::to_string)
        .or_else(|| {
            info.and_then(|i| i.get("account"))
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        })
        .ok_or_else(|| FoldError::InvalidConfigValue {
            key: "account-token".to_string(),
            reason: "no token given and none known to the peer".to_string(),
        })?;
    if !(token.len() == 43 && token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'))
    {
        return Err(FoldError::InvalidConfigValue {
            key: "account-token".to_string(),
            reason: "must be 43 url-base64 characters".to_string(),
        });
    }
    let name = machine_name
        .map(str::to_string)
        .or_else(|| {
            info.and_then(|i| i.get("mach_name"))
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
        })
        .ok_or_else(|| FoldError::InvalidConfigValue {
            key: "machine-name".to_string(),
            reason: "no name given and none known to the peer".to_string(),
        })?;
    session
        .send_command(json!({"cmd": "link", "token": token, "name": name}))
        .await
}

pub async fn unlink_account(session: &PeerSession) -> Result<(), FoldError> {
    let version = session.version().await;
    if !((8, 3, 1)..(8, 3, 17)).contains(&version) {
        return Err(FoldError::UnsupportedPeer {
            peer: session.name().to_string(),
            version: version_string(version),
            required: "8.3.1 through 8.3.16 (unlink-account)".to_string(),
        });
    }
    session.send_command(json!({"cmd": "reset"})).await
}

/// Restart the peer's account/node connection.
pub async fn restart_account(session: &PeerSession) -> Result<(), FoldError> {
    require_version(session, (8, 3, 17), "restart-account").await?;
    session.send_command(json!({"cmd": "restart"})).await
}

/// Enable every supported, not-yet-claimed gpu in the session's group.
pub async fn enable_all_gpus(session: &PeerSession) -> Result<(), FoldError> {
    require_version(session, (8, 3, 17), "enable-all-gpus").await?;
    let tree = session.snapshot().await;
    let groups = groups_of(&tree);
    let target = match session.peer().group.as_deref() {
        Some(requested) => resolve_group(requested, &groups)?,
        None => {
            return Err(FoldError::AmbiguousGroup(
                "an existing group must be specified for enable-all-gpus".to_string(),
            ))
        }
    };

    let supported: Vec<String> = tree
        .get("info")
        .and_then(|info| info.get("gpus"))
        .and_then(Value::as_object)
        .map(|gpus| {
            gpus.iter()
                .filter(|(_, gpu)| {
                    gpu.get("supported").and_then(Value::as_bool) == Some(true)
                })
                .map(|(id, _)| id.clone())
                .collect()
        })
        .unwrap_or_default();
    if supported.is_empty() {
        warn!(peer = %session.name(), "no supported gpus found");
        return Ok(());
    }

    let enabled = |group: &str, id: &str| -> bool {
        tree.get("groups")
            .and_then(|groups| groups.get(group))
            .and_then(|g| g.get("config"))
            .and_then(|c| c.get("gpus"))
            .and_then(|gpus| gpus.get(id))
            .and_then(|gpu| gpu.get("enabled"))
            .and_then(Value::as_bool)
            == Some(true)
    };
    let to_enable: Vec<String> = supported
        .into_iter()
        .filter(|id| !groups.iter().any(|group| enabled(group, id)))
        .collect();
    debug!(peer = %session.name(), gpus = ?to_enable, "gpus to enable");
    if to_enable.is_empty() {
        warn!(peer = %session.name(), "no gpus to enable");
        return Ok(());
    }

    // start from the target group's current gpu map so nothing gets disabled
    let mut target_gpus = tree
        .get("groups")
        .and_then(|groups| groups.get(&target))
        .and_then(|g| g.get("config"))
        .and_then(|c| c.get("gpus"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for id in to_enable {
        target_gpus.insert(id, json!({"enabled": true}));
    }
    let mut groups_config = Map::new();
    for name in &groups {
        groups_config.insert(name.clone(), json!({}));
    }
    groups_config.insert(target, json!({"gpus": target_gpus}));
    session
        .send_command(json!({"cmd": "config", "config": {"groups": groups_config}}))
        .await
}

/// Start streaming the peer's log over the normal message stream.
pub async fn request_log(session: &PeerSession) -> Result<(), FoldError> {
    session
        .send_command(json!({"cmd": "log", "enable": true}))
        .await
}

/// Convergence intent: poll the mirror until every target group is truly
/// paused (pause flag set and all units settled), or the timeout elapses.
/// A group still waiting on a mid-checkpoint unit keeps the wait going.
pub async fn wait_until_paused(session: &PeerSession, overall: Duration) -> Result<(), FoldError> {
    require_version(session, (8, 3, 17), "wait-until-paused").await?;
    let deadline = Instant::now() + overall;
    loop {
        let tree = session.snapshot().await;
        let groups = groups_of(&tree);
        let targets: Vec<String> = match session.peer().group.as_deref() {
            Some(requested) => vec![resolve_group(requested, &groups)?],
            None => groups,
        };
        let now = Utc::now();
        if targets
            .iter()
            .all(|group| group_truly_paused(&tree, group, now))
        {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(FoldError::ConvergenceTimeout(
                "all target groups to pause".to_string(),
            ));
        }
        tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
    }
}

async fn require_version(
    session: &PeerSession,
    min: (u64, u64, u64),
    what: &str,
) -> Result<(), FoldError> {
    let version = session.version().await;
    if version < min {
        return Err(FoldError::UnsupportedPeer {
            peer: session.name().to_string(),
            version: version_string(version),
            required: format!("{}+ ({what})", version_string(min)),
        });
    }
    Ok(())
}
