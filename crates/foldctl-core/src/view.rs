use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::peer::{groups_of, DEFAULT_PORT};
use crate::status::{classify_unit, group_flags, group_run_state, unit_waiting, units_of};

/// Point-in-time input to the derivation layer: one peer's mirrored tree, or
/// the connection-state string to show when the peer never became usable.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub label: String,
    pub port: u16,
    pub status: String,
    pub tree: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitRow {
    pub prcg: String,
    pub cpus: u64,
    pub gpus: u64,
    pub core: String,
    pub status: String,
    pub progress: String,
    pub ppd: u64,
    pub tpf: String,
    pub eta: String,
    pub timeout: String,
    pub deadline: String,
    pub is_gpu: bool,
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub label: String,
    pub status: String,
    pub units: Vec<UnitRow>,
}

#[derive(Debug, Clone)]
pub struct PeerRows {
    pub label: String,
    /// Connection-state note shown instead of groups when the peer has no
    /// usable snapshot.
    pub offline: Option<String>,
    pub groups: Vec<GroupRow>,
}

/// Everything one refresh tick needs: rows in display order plus totals.
/// Rebuilt from scratch on every tick, never stored.
#[derive(Debug, Clone)]
pub struct AggregateView {
    pub peers: Vec<PeerRows>,
    pub unit_count: usize,
    pub ppd_total: u64,
    pub ppd_cpu: u64,
    pub ppd_gpu: u64,
}

/// Derive the aggregate view. Peers keep address-list order; within a peer,
/// groups keep report order with the default group first; units keep report
/// order.
pub fn build_view(peers: &[PeerSnapshot], now: DateTime<Utc>) -> AggregateView {
    let mut view = AggregateView {
        peers: Vec::with_capacity(peers.len()),
        unit_count: 0,
        ppd_total: 0,
        ppd_cpu: 0,
        ppd_gpu: 0,
    };

    for peer in peers {
        let tree = match &peer.tree {
            Some(tree) => tree,
            None => {
                view.peers.push(PeerRows {
                    label: peer.label.clone(),
                    offline: Some(peer.status.clone()),
                    groups: Vec::new(),
                });
                continue;
            }
        };
        let name = machine_label(peer, tree);

        let mut group_names = groups_of(tree);
        if let Some(default_at) = group_names.iter().position(|g| g.is_empty()) {
            let default = group_names.remove(default_at);
            group_names.insert(0, default);
        }

        let mut groups = Vec::new();
        if group_names.is_empty() {
            let units = all_unit_rows(tree, now);
            tally(&mut view, &units);
            groups.push(GroupRow {
                label: name.clone(),
                status: String::new(),
                units,
            });
        } else {
            for group in &group_names {
                let flags = group_flags(tree, group);
                let units: Vec<UnitRow> = units_of(tree, group)
                    .into_iter()
                    .map(|unit| unit_row(unit, flags, now))
                    .collect();
                tally(&mut view, &units);
                groups.push(GroupRow {
                    label: format!("{name}/{group}"),
                    status: group_run_state(tree, group, now).to_string(),
                    units,
                });
            }
        }
        view.peers.push(PeerRows {
            label: name,
            offline: None,
            groups,
        });
    }

    view
}

fn tally(view: &mut AggregateView, units: &[UnitRow]) {
    for unit in units {
        view.unit_count += 1;
        view.ppd_total += unit.ppd;
        if unit.is_gpu {
            view.ppd_gpu += unit.ppd;
        } else {
            view.ppd_cpu += unit.ppd;
        }
    }
}

fn machine_label(peer: &PeerSnapshot, tree: &Value) -> String {
    let info = tree.get("info");
    let mut name = info
        .and_then(|i| i.get("mach_name"))
        .or_else(|| info.and_then(|i| i.get("hostname")))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.label.clone());
    if peer.port != DEFAULT_PORT && !name.contains(':') {
        name.push_str(&format!(":{}", peer.port));
    }
    name
}

fn all_unit_rows(tree: &Value, now: DateTime<Utc>) -> Vec<UnitRow> {
    tree.get("units")
        .and_then(Value::as_array)
        .map(|units| {
            units
                .iter()
                .map(|unit| {
                    let group = unit.get("group").and_then(Value::as_str).unwrap_or("");
                    unit_row(unit, group_flags(tree, group), now)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn unit_row(unit: &Value, flags: crate::status::GroupFlags, now: DateTime<Utc>) -> UnitRow {
    let assignment = unit.get("assignment");
    let project = assignment
        .and_then(|a| a.get("project"))
        .map(display_scalar)
        .unwrap_or_default();
    let wu = unit.get("wu");
    let run = wu.and_then(|w| w.get("run")).map(display_scalar).unwrap_or_default();
    let clone = wu
        .and_then(|w| w.get("clone"))
        .map(display_scalar)
        .unwrap_or_default();
    let gen = wu.and_then(|w| w.get("gen")).map(display_scalar).unwrap_or_default();
    let core = assignment
        .and_then(|a| a.get("core"))
        .and_then(|c| c.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let waiting = unit_waiting(unit, now);
    let mut progress = None;
    if waiting {
        progress = unit.get("wait_progress").and_then(Value::as_f64);
    }
    let progress = progress
        .or_else(|| unit.get("wu_progress").and_then(Value::as_f64))
        .or_else(|| unit.get("progress").and_then(Value::as_f64))
        .unwrap_or(0.0);

    let ppd = unit.get("ppd").and_then(as_u64_lossy).unwrap_or(0);

    let eta = match unit.get("eta") {
        Some(Value::Number(n)) => n
            .as_i64()
            .map(natural_delta)
            .unwrap_or_default(),
        Some(Value::String(s)) => shorten_eta(s),
        _ => String::new(),
    };

    let (timeout, deadline) = timeout_and_deadline(unit, now);

    UnitRow {
        prcg: format!("{project} {run},{clone},{gen}"),
        cpus: unit.get("cpus").and_then(Value::as_u64).unwrap_or(0),
        gpus: unit
            .get("gpus")
            .and_then(Value::as_array)
            .map(|g| g.len() as u64)
            .unwrap_or(0),
        core,
        status: classify_unit(unit, flags, now).to_string(),
        progress: format_percent(progress),
        ppd,
        tpf: tpf(unit, now),
        eta,
        timeout,
        deadline,
        is_gpu: is_gpu(unit),
    }
}

fn display_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn as_u64_lossy(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f.max(0.0) as u64))
}

fn is_gpu(unit: &Value) -> bool {
    if unit
        .get("gpus")
        .and_then(Value::as_array)
        .map(|g| !g.is_empty())
        .unwrap_or(false)
    {
        return true;
    }
    let assignment = unit.get("assignment");
    if assignment
        .and_then(|a| a.get("min_cpus"))
        .and_then(Value::as_u64)
        == Some(0)
    {
        return true;
    }
    assignment
        .and_then(|a| a.get("core"))
        .and_then(|c| c.get("type"))
        .and_then(Value::as_str)
        .map(|t| t.starts_with("0x2"))
        .unwrap_or(false)
}

fn run_time_secs(unit: &Value, now: DateTime<Utc>) -> i64 {
    let mut secs = unit
        .get("run_time")
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as i64;
    if unit.get("state").and_then(Value::as_str) == Some("RUN") {
        if let Some(started) = unit
            .get("start_time")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            secs += (now - started.with_timezone(&Utc)).num_seconds();
        }
    }
    secs
}

fn tpf(unit: &Value, now: DateTime<Utc>) -> String {
    let frames = unit
        .get("wu_progress")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        * 100.0;
    if frames <= 0.0 {
        return String::new();
    }
    let secs = (run_time_secs(unit, now) as f64 / frames) as i64;
    if secs == 0 {
        return String::new();
    }
    natural_delta(secs)
}

fn timeout_and_deadline(unit: &Value, now: DateTime<Utc>) -> (String, String) {
    let assignment = match unit.get("assignment") {
        Some(a) => a,
        None => return (String::new(), String::new()),
    };
    let assigned = match assignment
        .get("time")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        Some(t) => t.with_timezone(&Utc),
        None => return (String::new(), String::new()),
    };
    let field = |key: &str| {
        let secs = assignment.get(key).and_then(Value::as_f64).unwrap_or(0.0) as i64;
        remaining(
            (assigned + chrono::Duration::seconds(secs) - now).num_seconds(),
        )
    };
    (field("timeout"), field("deadline"))
}

/// Progress fraction as a percentage with one decimal, truncated the way the
/// peer's own UI does it.
pub fn format_percent(fraction: f64) -> String {
    let pct = (fraction * 1000.0).floor() / 10.0;
    format!("{pct:.1}%")
}

/// Thousands-separated integer display.
pub fn format_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Human-readable interval: `05s`, `02m 05s`, `3h 02m`, `2d 3h`.
pub fn natural_delta(secs: i64) -> String {
    if secs < 0 {
        return format!("-({})", natural_delta(-secs));
    }
    if secs < 60 {
        return format!("{secs:02}s");
    }
    let (mins, s) = (secs / 60, secs % 60);
    let (hours, m) = (mins / 60, mins % 60);
    let (days, h) = (hours / 24, hours % 24);
    if hours == 0 {
        format!("{m:02}m {s:02}s")
    } else if days == 0 {
        format!("{h}h {m:02}m")
    } else {
        format!("{days}d {h}h")
    }
}

/// A remaining interval at or below zero displays as `Expired`.
pub fn remaining(secs: i64) -> String {
    if secs <= 0 {
        "Expired".to_string()
    } else {
        natural_delta(secs)
    }
}

/// Compact a peer-formatted ETA string (`"2 hours"` becomes `"2h"`).
pub fn shorten_eta(eta: &str) -> String {
    eta.replace(" days", "d")
        .replace(" day", "d")
        .replace(" hours", "h")
        .replace(" hour", "h")
        .replace(" mins", "m")
        .replace(" min", "m")
        .replace(" secs", "s")
        .replace(" sec", "s")
}

const TABLE_HEADER: &str = "PRCG                 CPUs GPUs Core Status          Progress \
PPD         TPF      ETA     Timeout Deadline";

/// Derive one unit's row outside a full view, resolving the owning group's
/// flags from the tree.
pub fn row_for_unit(tree: &Value, unit: &Value, now: DateTime<Utc>) -> UnitRow {
    let group = unit.get("group").and_then(Value::as_str).unwrap_or("");
    unit_row(unit, group_flags(tree, group), now)
}

/// Table header, rules included.
pub fn header_lines() -> Vec<String> {
    let rule = "-".repeat(TABLE_HEADER.len());
    vec![rule.clone(), TABLE_HEADER.to_string(), rule]
}

/// Render the view to plain text lines; layout only, no recomputation.
pub fn table_lines(view: &AggregateView) -> Vec<String> {
    let mut lines = header_lines();

    for peer in &view.peers {
        if let Some(status) = &peer.offline {
            lines.push(format!("{:<35} {}", peer.label, status));
            continue;
        }
        for group in &peer.groups {
            if group.status.is_empty() {
                lines.push(group.label.clone());
            } else {
                lines.push(format!("{:<35} {}", group.label, group.status));
            }
            for unit in &group.units {
                lines.push(unit_line(unit));
            }
        }
    }

    if view.unit_count > 1 {
        lines.push(String::new());
        let mut line = format!("Total PPD: {}", format_thousands(view.ppd_total));
        if view.ppd_cpu > 0 {
            line.push_str(&format!("  CPU: {}", format_thousands(view.ppd_cpu)));
        }
        if view.ppd_gpu > 0 {
            line.push_str(&format!("  GPU: {}", format_thousands(view.ppd_gpu)));
        }
        lines.push(line);
    }
    lines
}

pub fn unit_line(unit: &UnitRow) -> String {
    format!(
        "{:<20} {:<4} {:<4} {:<4} {:<16}{:^8} {:<11} {:<7}  {:<7}  {:<7}  {:<7}",
        unit.prcg,
        unit.cpus,
        unit.gpus,
        unit.core,
        unit.status,
        unit.progress,
        format_thousands(unit.ppd),
        unit.tpf,
        unit.eta,
        unit.timeout,
        unit.deadline,
    )
}
