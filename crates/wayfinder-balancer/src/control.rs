use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operator command against one endpoint, applied at the next window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Take the endpoint out of every ring until it is marked up
    MarkDown { uri: String },
    /// Return a marked-down endpoint, slow-starting it through fast recovery
    MarkUp { uri: String },
    /// Override the announced weight; `None` clears the override
    SetWeight { uri: String, weight: Option<f64> },
}

impl ControlCommand {
    pub fn uri(&self) -> &str {
        match self {
            ControlCommand::MarkDown { uri }
            | ControlCommand::MarkUp { uri }
            | ControlCommand::SetWeight { uri, .. } => uri,
        }
    }
}

/// Standing operator overrides of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EndpointOverride {
    pub marked_down: bool,
    pub weight: Option<f64>,
}

impl EndpointOverride {
    /// Folds a command into the override.
    pub fn apply(&mut self, command: &ControlCommand) {
        match command {
            ControlCommand::MarkDown { .. } => self.marked_down = true,
            ControlCommand::MarkUp { .. } => self.marked_down = false,
            ControlCommand::SetWeight { weight, .. } => self.weight = *weight,
        }
    }

    pub fn is_default(&self) -> bool {
        *self == EndpointOverride::default()
    }
}

/// Latest override of every endpoint an operator has touched.
#[derive(Debug, Clone, Default)]
pub struct StandingOverrides {
    overrides: BTreeMap<String, EndpointOverride>,
}

impl StandingOverrides {
    pub fn record(&mut self, command: &ControlCommand) {
        let entry = self.overrides.entry(command.uri().to_string()).or_default();
        entry.apply(command);
        if entry.is_default() {
            self.overrides.remove(command.uri());
        }
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Commands that bring a fresh load balancer to the same overrides.
    pub fn replay(&self) -> Vec<ControlCommand> {
        let mut commands = Vec::new();
        for (uri, o) in &self.overrides {
            if o.marked_down {
                commands.push(ControlCommand::MarkDown { uri: uri.clone() });
            }
            if o.weight.is_some() {
                commands.push(ControlCommand::SetWeight {
                    uri: uri.clone(),
                    weight: o.weight,
                });
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_folding() {
        let mut o = EndpointOverride::default();
        o.apply(&ControlCommand::MarkDown { uri: "u".into() });
        o.apply(&ControlCommand::SetWeight {
            uri: "u".into(),
            weight: Some(3.0),
        });
        assert!(o.marked_down);
        assert_eq!(o.weight, Some(3.0));

        o.apply(&ControlCommand::MarkUp { uri: "u".into() });
        o.apply(&ControlCommand::SetWeight {
            uri: "u".into(),
            weight: None,
        });
        assert!(o.is_default());
    }

    #[test]
    fn test_standing_overrides_keep_latest_per_endpoint() {
        let mut standing = StandingOverrides::default();
        for _ in 0..100 {
            standing.record(&ControlCommand::MarkDown { uri: "a".into() });
            standing.record(&ControlCommand::MarkUp { uri: "a".into() });
        }
        assert!(standing.is_empty());

        standing.record(&ControlCommand::MarkDown { uri: "a".into() });
        standing.record(&ControlCommand::SetWeight {
            uri: "b".into(),
            weight: Some(1.0),
        });
        standing.record(&ControlCommand::SetWeight {
            uri: "b".into(),
            weight: Some(2.0),
        });
        assert_eq!(standing.len(), 2);
        assert_eq!(
            standing.replay(),
            vec![
                ControlCommand::MarkDown { uri: "a".into() },
                ControlCommand::SetWeight {
                    uri: "b".into(),
                    weight: Some(2.0)
                },
            ]
        );
    }

    #[test]
    fn test_command_json() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"command": "set_weight", "uri": "http://a:1/", "weight": 0.5}"#).unwrap();
        assert_eq!(cmd.uri(), "http://a:1/");
    }
}
