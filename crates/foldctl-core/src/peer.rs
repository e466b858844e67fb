use serde_json::Value;
use std::fmt;

use crate::error::FoldError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 7396;

/// Identity of one remote peer: `[host][:port][/group]`. Immutable once a
/// session is built from it. No group means "all groups"; an empty group
/// name is the default group; `//name` escapes a literal leading slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub group: Option<String>,
}

impl PeerAddress {
    /// Parse a single `[host][:port][/group]` spec. `.` and the empty host
    /// mean localhost.
    pub fn parse(spec: &str) -> Result<Self, FoldError> {
        let (address, group) = split_group(spec);
        let address = address.trim();
        let (host, port) = match address.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| FoldError::InvalidAddress(spec.to_string()))?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };
        let host = match host {
            "" | "." => DEFAULT_HOST,
            other => other,
        };
        Ok(Self {
            host: host.to_string(),
            port,
            group,
        })
    }

    /// Parse a comma-separated multi-peer spec. A group is only meaningful
    /// for a single peer; duplicates collapse, keeping first-listed order.
    pub fn parse_list(spec: &str) -> Result<Vec<Self>, FoldError> {
        let mut peers: Vec<Self> = Vec::new();
        for part in spec.split(',') {
            let peer = Self::parse(part)?;
            if !peers.iter().any(|p| p.host == peer.host && p.port == peer.port) {
                peers.push(peer);
            }
        }
        if peers.len() > 1 && peers.iter().any(|p| p.group.is_some()) {
            return Err(FoldError::InvalidAddress(format!(
                "{spec}: multiple hosts cannot carry a group"
            )));
        }
        Ok(peers)
    }

    /// Websocket endpoint for this peer.
    pub fn endpoint(&self) -> String {
        format!("ws://{}:{}/api/websocket", self.host, self.port)
    }

    /// Short display label; the port is shown only when non-default.
    pub fn label(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(group) = &self.group {
            write!(f, "/{group}")?;
        }
        Ok(())
    }
}

/// Split `addr/group` at the first slash and strip the group's leading
/// slash, so `/` is the default (empty) group and `//name` is `/name`.
fn split_group(spec: &str) -> (&str, Option<String>) {
    match spec.find('/') {
        Some(at) => {
            let group = &spec[at + 1..];
            (&spec[..at], Some(group.to_string()))
        }
        None => (spec, None),
    }
}

/// Resolve a requested group name against the names a peer reports. A name
/// that exists both bare and slash-prefixed is ambiguous; a bare miss falls
/// back to the slash-prefixed form left over from old installs.
pub fn resolve_group(requested: &str, groups: &[String]) -> Result<String, FoldError> {
    let mut name = requested.to_string();
    if !name.is_empty() {
        let slashed = format!("/{name}");
        let has_bare = groups.iter().any(|g| g == &name);
        let has_slashed = groups.iter().any(|g| g == &slashed);
        if has_bare && has_slashed {
            return Err(FoldError::AmbiguousGroup(format!(
                "both \"{name}\" and \"{slashed}\" exist"
            )));
        }
        if has_slashed && !has_bare {
            name = slashed;
        }
    }
    if !groups.iter().any(|g| g == &name) {
        return Err(FoldError::GroupNotFound(requested.to_string()));
    }
    Ok(name)
}

/// Group names a peer reports, in report order.
pub fn groups_of(tree: &Value) -> Vec<String> {
    tree.get("groups")
        .and_then(Value::as_object)
        .map(|groups| groups.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_fills_defaults() {
        let peer = PeerAddress::parse(".").unwrap();
        assert_eq!(peer.host, "localhost");
        assert_eq!(peer.port, DEFAULT_PORT);
        assert_eq!(peer.group, None);

        let peer = PeerAddress::parse("").unwrap();
        assert_eq!(peer.host, "localhost");

        let peer = PeerAddress::parse(":8101").unwrap();
        assert_eq!(peer.host, "localhost");
        assert_eq!(peer.port, 8101);
    }

    #[test]
    fn parse_group_forms() {
        assert_eq!(PeerAddress::parse("host").unwrap().group, None);
        assert_eq!(
            PeerAddress::parse("host/").unwrap().group,
            Some(String::new())
        );
        assert_eq!(
            PeerAddress::parse("host/oven").unwrap().group,
            Some("oven".to_string())
        );
        assert_eq!(
            PeerAddress::parse("host//oven").unwrap().group,
            Some("/oven".to_string())
        );
        assert_eq!(
            PeerAddress::parse("/oven").unwrap().group,
            Some("oven".to_string())
        );
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(PeerAddress::parse("host:banana").is_err());
        assert!(PeerAddress::parse("host:70000").is_err());
    }

    #[test]
    fn parse_list_keeps_order_and_dedupes() {
        let peers = PeerAddress::parse_list("b,a,b:7396").unwrap();
        let hosts: Vec<&str> = peers.iter().map(|p| p.host.as_str()).collect();
        assert_eq!(hosts, ["b", "a"]);
    }

    #[test]
    fn parse_list_rejects_group_with_multiple_hosts() {
        assert!(PeerAddress::parse_list("a/g1,b").is_err());
        assert!(PeerAddress::parse_list("a/g1").is_ok());
    }

    #[test]
    fn endpoint_shape() {
        let peer = PeerAddress::parse("box:8101/oven").unwrap();
        assert_eq!(peer.endpoint(), "ws://box:8101/api/websocket");
        assert_eq!(peer.label(), "box:8101");
    }

    #[test]
    fn resolve_group_prefers_exact_then_slashed() {
        let groups = vec!["".to_string(), "oven".to_string(), "/attic".to_string()];
        assert_eq!(resolve_group("oven", &groups).unwrap(), "oven");
        assert_eq!(resolve_group("attic", &groups).unwrap(), "/attic");
        assert_eq!(resolve_group("", &groups).unwrap(), "");
        assert!(matches!(
            resolve_group("cellar", &groups),
            Err(FoldError::GroupNotFound(_))
        ));
    }

    #[test]
    fn resolve_group_flags_ambiguity() {
        let groups = vec!["oven".to_string(), "/oven".to_string()];
        assert!(matches!(
            resolve_group("oven", &groups),
            Err(FoldError::AmbiguousGroup(_))
        ));
    }

    #[test]
    fn groups_come_back_in_report_order() {
        let tree = json!({"groups": {"zeta": {}, "": {}, "alpha": {}}});
        assert_eq!(groups_of(&tree), ["zeta", "", "alpha"]);
    }
}
