//! Snap entries
//!
//! A snap is configured either as a bare name or as a mapping with `name`,
//! `channel` and `classic`. Normalization happens when the job runs, so a bad
//! entry fails only the instances that use it.

use crate::pipeline::errors::ConfigError;
use serde_yaml::Value;

/// Channel used when none is configured
pub const DEFAULT_CHANNEL: &str = "latest/stable";

/// A normalized snap request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapSpec {
    /// Snap name
    pub name: String,
    /// Channel to install from
    pub channel: String,
    /// Whether to install with classic confinement
    pub classic: bool,
}

impl SnapSpec {
    /// A snap from the default channel with strict confinement
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            classic: false,
        }
    }

    /// Arguments of the `snap install` invocation
    #[must_use]
    pub fn install_command(&self) -> Vec<String> {
        let mut argv = vec![
            "snap".to_string(),
            "install".to_string(),
            self.name.clone(),
            "--channel".to_string(),
            self.channel.clone(),
        ];
        if self.classic {
            argv.push("--classic".to_string());
        }
        argv
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

/// Normalizes one raw snap entry
pub fn normalize_snap(raw: &Value) -> Result<SnapSpec, ConfigError> {
    match raw {
        Value::String(name) => Ok(SnapSpec::named(name.clone())),
        Value::Mapping(map) => {
            let name = match map.get("name") {
                Some(Value::String(name)) => name.clone(),
                _ => {
                    return Err(invalid(
                        "You configured a Snap but you did not specify a name.",
                    ));
                }
            };
            let channel = match map.get("channel") {
                None => DEFAULT_CHANNEL.to_string(),
                Some(Value::String(channel)) => channel.clone(),
                Some(_) => {
                    return Err(invalid(
                        "You configured a Snap `channel`, but you did not specify a value.",
                    ));
                }
            };
            let classic = match map.get("classic") {
                None => false,
                Some(Value::Bool(classic)) => *classic,
                Some(Value::Null) => {
                    return Err(invalid(
                        "You configured a Snap `classic`, but you did not specify a value. \
                         Valid values would either be `True` or `False`.",
                    ));
                }
                Some(_) => {
                    return Err(invalid(
                        "You configured a Snap `classic`, but you did not specify a valid value. \
                         Valid values would either be `true` or `false`.",
                    ));
                }
            };
            Ok(SnapSpec {
                name,
                channel,
                classic,
            })
        }
        _ => Err(invalid(
            "You configured a Snap, but you used an unknown format. \
             Please refer to the documentation for an overview of supported formats.",
        )),
    }
}

/// Normalizes every entry, failing on the first bad one
pub fn normalize_snaps(raw: &[Value]) -> Result<Vec<SnapSpec>, ConfigError> {
    raw.iter().map(normalize_snap).collect()
}
