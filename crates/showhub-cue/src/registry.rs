use std::collections::HashMap;

use showhub_proto::Value;

/// Named actions a cue action can reference instead of carrying an inline
/// address/args payload. Each id expands to an ordered list of concrete
/// wire-protocol commands.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Vec<(String, Vec<Value>)>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, commands: Vec<(String, Vec<Value>)>) {
        self.actions.insert(id.into(), commands);
    }

    pub fn resolve(&self, id: &str) -> Option<Vec<(String, Vec<Value>)>> {
        self.actions.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_registered_action_to_its_commands() {
        let mut registry = ActionRegistry::new();
        registry.register("blackout", vec![("/lights/exec/1".into(), vec![Value::Int(0)])]);

        assert_eq!(
            registry.resolve("blackout"),
            Some(vec![("/lights/exec/1".into(), vec![Value::Int(0)])])
        );
        assert_eq!(registry.resolve("missing"), None);
    }
}
