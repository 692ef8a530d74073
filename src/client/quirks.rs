use super::keys::ModifierKeyMap;
use crate::ServerVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerFlavor {
    #[default]
    Generic,
    AppleRemoteDesktop,
}

/// Servers whose version line starts with `prefix` are of `flavor`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuirkRule {
    pub prefix: String,
    pub flavor: ServerFlavor,
    pub keymap: ModifierKeyMap,
}

/// Server specific behaviour, keyed on the version line
///
/// Only used to pick a flavor and a modifier key map, the protocol itself is
/// negotiated the same way for every server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerQuirks {
    rules: Vec<QuirkRule>,
}

impl Default for ServerQuirks {
    fn default() -> Self {
        Self {
            rules: vec![QuirkRule {
                prefix: "RFB 003.889".to_string(),
                flavor: ServerFlavor::AppleRemoteDesktop,
                keymap: ModifierKeyMap::APPLE,
            }],
        }
    }
}

impl ServerQuirks {
    /// No rules, every server is generic
    pub fn none() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(mut self, rule: QuirkRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The first matching rule wins
    pub fn classify(&self, version: &ServerVersion) -> (ServerFlavor, ModifierKeyMap) {
        self.rules
            .iter()
            .find(|rule| version.text().starts_with(&rule.prefix))
            .map(|rule| (rule.flavor, rule.keymap))
            .unwrap_or((ServerFlavor::Generic, ModifierKeyMap::STANDARD))
    }
}
