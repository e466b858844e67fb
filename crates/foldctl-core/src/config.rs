use serde_json::Value;

use crate::error::FoldError;

/// Settings owned by the linked account when one exists.
pub const ACCOUNT_KEYS: &[&str] = &["user", "team", "passkey", "cause"];

/// Settings that live under a resource group's config.
pub const GROUP_KEYS: &[&str] = &[
    "on_idle",
    "beta",
    "key",
    "cpus",
    "on_battery",
    "keep_awake",
    "cuda",
];

/// Peer-maintained state that is readable but never settable.
pub const READ_ONLY_KEYS: &[&str] = &["peers", "gpus", "paused", "finish"];

/// Keys the targeted protocol dropped; setting them is always rejected.
pub const DEPRECATED_KEYS: &[&str] = &["fold_anon", "peers", "checkpoint", "priority"];

pub const KNOWN_CAUSES: &[&str] = &[
    "any",
    "alzheimers",
    "cancer",
    "huntingtons",
    "parkinsons",
    "influenza",
    "diabetes",
    "covid-19",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    Account,
    Group,
    ReadOnly,
}

/// Dotted CLI keys use dashes; the wire uses underscores.
pub fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
}

pub fn scope_for_key(key: &str) -> Option<ConfigScope> {
    if ACCOUNT_KEYS.contains(&key) {
        Some(ConfigScope::Account)
    } else if GROUP_KEYS.contains(&key) {
        Some(ConfigScope::Group)
    } else if READ_ONLY_KEYS.contains(&key) {
        Some(ConfigScope::ReadOnly)
    } else {
        None
    }
}

pub fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("not a boolean: \"{other}\"")),
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> FoldError {
    FoldError::InvalidConfigValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Validate and convert a raw CLI value for `key` into its wire value.
/// `force` relaxes only the legacy user-name rules.
pub fn validate_value(key: &str, raw: &str, force: bool) -> Result<Value, FoldError> {
    match key {
        "user" => {
            let user = raw.trim();
            if user.is_empty() {
                return Ok(Value::String("Anonymous".to_string()));
            }
            let legal = user.len() <= 100
                && !user.contains(['\t', '\n', '\r']);
            if !legal && !force {
                return Err(FoldError::ForceRequired(format!(
                    "user \"{user}\" breaks the naming rules (max 100 bytes, no tabs or newlines)"
                )));
            }
            Ok(Value::String(user.to_string()))
        }
        "passkey" => {
            let passkey = raw.trim().to_lowercase();
            if !passkey.is_empty()
                && !(passkey.len() == 32 && passkey.chars().all(|c| c.is_ascii_hexdigit()))
            {
                return Err(invalid(key, "must be \"\" or 32 hexadecimal characters"));
            }
            Ok(Value::String(passkey))
        }
        "team" => {
            let team: i64 = raw
                .parse()
                .map_err(|_| invalid(key, "not a number"))?;
            if !(0..0x7FFF_FFFF).contains(&team) {
                return Err(invalid(key, "must be 0 to 0x7FFFFFFF"));
            }
            Ok(Value::from(team))
        }
        "key" => {
            let project_key: u64 = raw
                .parse()
                .map_err(|_| invalid(key, "not a number"))?;
            Ok(Value::from(project_key))
        }
        "cpus" => {
            let cpus: u64 = raw
                .parse()
                .map_err(|_| invalid(key, "not a number"))?;
            if cpus > 256 {
                return Err(invalid(key, "must be 0 to 256"));
            }
            Ok(Value::from(cpus))
        }
        "cause" => {
            let cause = if raw.is_empty() {
                "any".to_string()
            } else {
                raw.trim().to_lowercase()
            };
            if !KNOWN_CAUSES.contains(&cause.as_str()) {
                return Err(invalid(
                    key,
                    format!("must be one of: {}", KNOWN_CAUSES.join(" ")),
                ));
            }
            Ok(Value::String(cause))
        }
        "beta" | "on_idle" | "on_battery" | "keep_awake" | "cuda" => {
            let flag = parse_bool(raw).map_err(|reason| invalid(key, reason))?;
            Ok(Value::Bool(flag))
        }
        other => Err(FoldError::InvalidConfigKey(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_classify_into_scopes() {
        assert_eq!(scope_for_key("user"), Some(ConfigScope::Account));
        assert_eq!(scope_for_key("cpus"), Some(ConfigScope::Group));
        assert_eq!(scope_for_key("paused"), Some(ConfigScope::ReadOnly));
        assert_eq!(scope_for_key("nonsense"), None);
        assert_eq!(normalize_key("on-idle"), "on_idle");
    }

    #[test]
    fn user_rules_and_force_override() {
        assert_eq!(validate_value("user", "", false).unwrap(), json!("Anonymous"));
        assert_eq!(
            validate_value("user", " alice ", false).unwrap(),
            json!("alice")
        );
        assert!(matches!(
            validate_value("user", "bad\tname", false),
            Err(FoldError::ForceRequired(_))
        ));
        assert_eq!(
            validate_value("user", "bad\tname", true).unwrap(),
            json!("bad\tname")
        );
    }

    #[test]
    fn passkey_must_be_32_hex() {
        assert!(validate_value("passkey", "abc", false).is_err());
        assert_eq!(
            validate_value("passkey", &"A1".repeat(16), false).unwrap(),
            json!("a1".repeat(16))
        );
        assert_eq!(validate_value("passkey", "", false).unwrap(), json!(""));
    }

    #[test]
    fn numeric_bounds() {
        assert!(validate_value("team", "-1", false).is_err());
        assert_eq!(validate_value("team", "224497", false).unwrap(), json!(224497));
        assert!(validate_value("cpus", "300", false).is_err());
        assert_eq!(validate_value("cpus", "16", false).unwrap(), json!(16));
    }

    #[test]
    fn cause_falls_back_to_any() {
        assert_eq!(validate_value("cause", "", false).unwrap(), json!("any"));
        assert_eq!(
            validate_value("cause", "CANCER", false).unwrap(),
            json!("cancer")
        );
        assert!(validate_value("cause", "gardening", false).is_err());
    }

    #[test]
    fn booleans_accept_common_spellings() {
        assert_eq!(validate_value("beta", "on", false).unwrap(), json!(true));
        assert_eq!(validate_value("cuda", "0", false).unwrap(), json!(false));
        assert!(validate_value("on_idle", "maybe", false).is_err());
    }
}
