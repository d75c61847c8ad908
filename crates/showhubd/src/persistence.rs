//! Show/macro persistence (spec §6 "Persisted state layout" + SPEC_FULL
//! §4.14). Shows and macro tables round-trip to sanitised-filename text
//! files under `InfraConfig::paths.state_dir`; a missing file is a
//! `Config-missing` condition (spec §7), never a startup-aborting error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use showhub_cue::{Cue, CueAction, CueActionKind, ShowState};
use showhub_macro::{MacroAction, MacroDef};
use showhub_proto::Value;
use tracing::warn;

/// Non-alphanumeric → `_`, lowercased. Used both for persisted filenames
/// and for the hub's `/system/driver/<name>/status` address segment. Thin
/// wrapper over the config crate's own filename sanitiser so both stay in
/// lockstep.
pub fn sanitise_filename(name: &str) -> String {
    showhub_config::loader::sanitize_filename(name)
}

fn show_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.show.json", sanitise_filename(name)))
}

fn macros_path(dir: &Path) -> PathBuf {
    dir.join("macros.json")
}

#[derive(Serialize, Deserialize)]
struct StoredValue {
    #[serde(rename = "type")]
    kind: String,
    value: serde_json::Value,
}

impl From<&Value> for StoredValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Int(i) => StoredValue { kind: "i".into(), value: (*i).into() },
            Value::Float(f) => StoredValue { kind: "f".into(), value: (*f as f64).into() },
            Value::String(s) => StoredValue { kind: "s".into(), value: s.clone().into() },
            Value::Bool(b) => StoredValue { kind: "b".into(), value: (*b).into() },
            Value::Blob(b) => StoredValue { kind: "blob".into(), value: b.clone().into() },
        }
    }
}

impl StoredValue {
    fn into_value(self) -> Value {
        match self.kind.as_str() {
            "i" => Value::Int(self.value.as_i64().unwrap_or_default() as i32),
            "f" => Value::Float(self.value.as_f64().unwrap_or_default() as f32),
            "b" => Value::Bool(self.value.as_bool().unwrap_or_default()),
            "blob" => Value::Blob(
                self.value
                    .as_array()
                    .map(|arr| arr.iter().filter_map(|v| v.as_u64()).map(|v| v as u8).collect())
                    .unwrap_or_default(),
            ),
            _ => Value::String(self.value.as_str().unwrap_or_default().to_string()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredCueAction {
    named: Option<String>,
    address: Option<String>,
    args: Vec<StoredValue>,
    delay_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct StoredCue {
    id: String,
    name: String,
    actions: Vec<StoredCueAction>,
    auto_follow_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct StoredShow {
    name: String,
    cues: Vec<StoredCue>,
}

/// Serialize `state` to `<state_dir>/<sanitised-name>.show.json`. Only the
/// cue list and name are persisted — `activeCueIndex`/`firedCues` are
/// session state, re-derived by `go`/`standby` after load.
pub fn save_show(dir: &Path, state: &ShowState) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let stored = StoredShow {
        name: state.name.clone(),
        cues: state
            .cues
            .iter()
            .map(|cue| StoredCue {
                id: cue.id.clone(),
                name: cue.name.clone(),
                auto_follow_ms: cue.auto_follow_ms,
                actions: cue
                    .actions
                    .iter()
                    .map(|action| match &action.kind {
                        CueActionKind::Named(id) => StoredCueAction {
                            named: Some(id.clone()),
                            address: None,
                            args: vec![],
                            delay_ms: action.delay_ms,
                        },
                        CueActionKind::Inline { address, args } => StoredCueAction {
                            named: None,
                            address: Some(address.clone()),
                            args: args.iter().map(StoredValue::from).collect(),
                            delay_ms: action.delay_ms,
                        },
                    })
                    .collect(),
            })
            .collect(),
    };
    let json = serde_json::to_string_pretty(&stored)?;
    std::fs::write(show_path(dir, &state.name), json)
}

/// Load `<state_dir>/<sanitised-name>.show.json`. A missing file logs a
/// warning and returns an empty show, never an error.
pub fn load_show(dir: &Path, name: &str) -> ShowState {
    let path = show_path(dir, name);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "show profile missing or unreadable, starting empty");
            return ShowState::empty(name);
        }
    };
    let stored: StoredShow = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "show profile malformed, starting empty");
            return ShowState::empty(name);
        }
    };
    ShowState {
        name: stored.name,
        cues: stored
            .cues
            .into_iter()
            .map(|cue| Cue {
                id: cue.id,
                name: cue.name,
                auto_follow_ms: cue.auto_follow_ms,
                actions: cue
                    .actions
                    .into_iter()
                    .map(|action| CueAction {
                        kind: match action.named {
                            Some(id) => CueActionKind::Named(id),
                            None => CueActionKind::Inline {
                                address: action.address.unwrap_or_default(),
                                args: action.args.into_iter().map(StoredValue::into_value).collect(),
                            },
                        },
                        delay_ms: action.delay_ms,
                    })
                    .collect(),
            })
            .collect(),
        active_cue_index: None,
        fired_cue_indices: Default::default(),
    }
}

#[derive(Serialize, Deserialize)]
struct StoredMacroAction {
    address: String,
    args: Vec<StoredValue>,
    delay_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredMacroDef {
    trigger: String,
    actions: Vec<StoredMacroAction>,
}

pub fn save_macros(dir: &Path, defs: &[MacroDef]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let stored: Vec<StoredMacroDef> = defs
        .iter()
        .map(|def| StoredMacroDef {
            trigger: def.trigger.clone(),
            actions: def
                .actions
                .iter()
                .map(|a| StoredMacroAction {
                    address: a.address.clone(),
                    args: a.args.iter().map(StoredValue::from).collect(),
                    delay_ms: a.delay_ms,
                })
                .collect(),
        })
        .collect();
    let json = serde_json::to_string_pretty(&stored)?;
    std::fs::write(macros_path(dir), json)
}

pub fn load_macros(dir: &Path) -> Vec<MacroDef> {
    let path = macros_path(dir);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "macro table missing or unreadable, starting empty");
            return Vec::new();
        }
    };
    let stored: Vec<StoredMacroDef> = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "macro table malformed, starting empty");
            return Vec::new();
        }
    };
    stored
        .into_iter()
        .map(|def| MacroDef {
            trigger: def.trigger,
            actions: def
                .actions
                .into_iter()
                .map(|a| MacroAction {
                    address: a.address,
                    args: a.args.into_iter().map(StoredValue::into_value).collect(),
                    delay_ms: a.delay_ms,
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sanitise_filename_replaces_non_alphanumeric_and_lowercases() {
        assert_eq!(sanitise_filename("Main Show #1"), "main_show__1");
        assert_eq!(sanitise_filename("avantis"), "avantis");
    }

    #[test]
    fn show_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let state = ShowState {
            name: "Opening Night".into(),
            cues: vec![Cue {
                id: "c1".into(),
                name: "Blackout".into(),
                actions: vec![CueAction {
                    kind: CueActionKind::Inline { address: "/lights/exec/1".into(), args: vec![Value::Int(0)] },
                    delay_ms: Some(500),
                }],
                auto_follow_ms: Some(2000),
            }],
            active_cue_index: Some(0),
            fired_cue_indices: HashSet::new(),
        };

        save_show(dir.path(), &state).unwrap();
        let loaded = load_show(dir.path(), "Opening Night");

        assert_eq!(loaded.name, "Opening Night");
        assert_eq!(loaded.cues.len(), 1);
        assert_eq!(loaded.cues[0].auto_follow_ms, Some(2000));
        assert_eq!(loaded.active_cue_index, None, "session state is not persisted");
    }

    #[test]
    fn missing_show_file_loads_empty_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_show(dir.path(), "nonexistent");
        assert!(loaded.cues.is_empty());
    }

    #[test]
    fn macros_round_trip_with_placeholders_intact() {
        let dir = tempfile::tempdir().unwrap();
        let defs = vec![MacroDef {
            trigger: "/panic".into(),
            actions: vec![MacroAction { address: "/a".into(), args: vec![Value::String("$$1".into())], delay_ms: 0 }],
        }];
        save_macros(dir.path(), &defs).unwrap();
        let loaded = load_macros(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].actions[0].args[0], Value::String("$$1".into()));
    }
}
