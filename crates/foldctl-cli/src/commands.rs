use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use foldctl_client::{dispatch, Aggregator, PeerEvent, PeerSession, RunIntent, SessionState};
use foldctl_core::view::{build_view, header_lines, row_for_unit, table_lines, unit_line};
use foldctl_core::PeerFailure;
use serde_json::Value;

pub async fn units(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let failures = aggregator.connect(overall).await;
    let view = build_view(&aggregator.snapshots().await, Utc::now());
    for line in table_lines(&view) {
        println!("{line}");
    }
    print_failures(&failures);
    Ok(())
}

pub async fn info(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let failures = aggregator.connect(overall).await;
    let multi = aggregator.sessions().len() > 1;
    if multi {
        println!();
    }
    for session in aggregator.sessions() {
        if session.state() != SessionState::Live {
            continue;
        }
        let tree = session.snapshot().await;
        print_info(&tree);
        if multi {
            println!();
        }
    }
    print_failures(&failures);
    Ok(())
}

fn print_info(tree: &Value) {
    let info = match tree.get("info") {
        Some(info) => info,
        None => return,
    };
    let text = |key: &str| info.get(key).and_then(Value::as_str).unwrap_or("");
    let cores = info.get("cpus").and_then(Value::as_u64).unwrap_or(0);
    println!("  Host: {}", text("hostname"));
    println!("Client: {}", text("version"));
    println!("    OS: {} {}", text("os"), text("os_version"));
    println!(
        "   CPU: {} cores, {}, \"{}\"",
        cores,
        text("cpu"),
        text("cpu_brand")
    );
}

pub async fn run_state(
    aggregator: &Aggregator,
    intent: RunIntent,
    force: bool,
    overall: Duration,
) -> Result<()> {
    let mut failures = aggregator.connect(overall).await;
    failures.extend(aggregator.set_run_state(intent, force).await);
    surface(aggregator, failures)
}

pub async fn state(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    let snapshot = session.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

pub async fn get(aggregator: &Aggregator, keypath: &str, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    let value = session.read_path(keypath).await.unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

pub async fn groups(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    println!("{}", serde_json::to_string(&session.groups().await)?);
    Ok(())
}

pub async fn watch(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    let snapshot = session.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    let mut events = session.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(PeerEvent::Inbound(value)) => println!("{value}"),
                Ok(PeerEvent::State(state)) => {
                    tracing::info!(state = %state, "session state");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

pub async fn log(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    let mut events = session.subscribe();
    dispatch::request_log(session).await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(PeerEvent::Inbound(value)) => {
                    for line in log_lines(&value) {
                        println!("{line}");
                    }
                }
                Ok(PeerEvent::State(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

/// Log frames look like `["log", index, line-or-lines]`; the index is noise.
fn log_lines(value: &Value) -> Vec<String> {
    let items = match value.as_array() {
        Some(items) if items.len() > 1 && items[0] == "log" => items,
        _ => return Vec::new(),
    };
    match &items[items.len() - 1] {
        Value::String(line) => vec![line.clone()],
        Value::Array(lines) => lines
            .iter()
            .filter_map(Value::as_str)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

pub async fn config(
    aggregator: &Aggregator,
    key: &str,
    value: Option<&str>,
    force: bool,
    overall: Duration,
) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    match value {
        None => {
            let value = dispatch::config_get(session, key).await?;
            println!("{}", serde_json::to_string(&value)?);
        }
        Some(value) => dispatch::config_set(session, key, value, force).await?,
    }
    Ok(())
}

pub async fn create_group(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    let group = match session.peer().group.clone() {
        Some(group) if !group.is_empty() => group,
        _ => bail!("no group specified; append /name to the address"),
    };
    dispatch::create_group(session, &group).await?;
    Ok(())
}

pub async fn dump_all(aggregator: &Aggregator, force: bool, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    let units = dispatch::dump_all(session, force).await?;
    if units.is_empty() {
        println!("{}: no paused units found", session.name());
        return Ok(());
    }
    let tree = session.snapshot().await;
    let now = Utc::now();
    println!("{}:", if force { "Dumped units" } else { "Units to dump" });
    for line in header_lines() {
        println!("{line}");
    }
    for unit in &units {
        println!("{}", unit_line(&row_for_unit(&tree, unit, now)));
    }
    if !force {
        println!("{}: to dump these units, use --force", session.name());
    }
    Ok(())
}

pub async fn wait_until_paused(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    dispatch::wait_until_paused(session, overall).await?;
    Ok(())
}

pub async fn link_account(
    aggregator: &Aggregator,
    token: Option<&str>,
    machine_name: Option<&str>,
    overall: Duration,
) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    dispatch::link_account(session, token, machine_name).await?;
    Ok(())
}

pub async fn unlink_account(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    dispatch::unlink_account(session).await?;
    Ok(())
}

pub async fn restart_account(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    dispatch::restart_account(session).await?;
    Ok(())
}

pub async fn enable_all_gpus(aggregator: &Aggregator, overall: Duration) -> Result<()> {
    let session = single_live(aggregator, overall).await?;
    dispatch::enable_all_gpus(session).await?;
    Ok(())
}

/// One-shot single-peer commands surface the first fatal error directly.
async fn single_live(
    aggregator: &Aggregator,
    overall: Duration,
) -> Result<&Arc<PeerSession>> {
    let session = aggregator.single()?;
    session.start();
    session.wait_live(overall).await?;
    Ok(session)
}

fn print_failures(failures: &[PeerFailure]) {
    for failure in failures {
        eprintln!("{}: {}", failure.peer, failure.error);
    }
}

/// Multi-peer commands report per-peer failures and only fail the whole
/// call when no peer succeeded.
fn surface(aggregator: &Aggregator, failures: Vec<PeerFailure>) -> Result<()> {
    print_failures(&failures);
    if !failures.is_empty() && failures.len() >= aggregator.sessions().len() {
        let first = &failures[0];
        return Err(anyhow!(first.error.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_frames_yield_lines() {
        assert_eq!(
            log_lines(&json!(["log", -2, ["first", "", "second"]])),
            ["first", "second"]
        );
        assert_eq!(log_lines(&json!(["log", -1, "only"])), ["only"]);
        assert!(log_lines(&json!(["groups", "rg1", "wait", null])).is_empty());
        assert!(log_lines(&json!("ping")).is_empty());
    }
}
