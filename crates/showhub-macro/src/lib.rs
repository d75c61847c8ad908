//! Macro engine (spec §4.9): named bundles of actions triggered by a single
//! address, with `$$N` placeholder substitution and nested-macro dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use showhub_proto::Value;
use tokio::task::JoinHandle;
use tracing::warn;

/// Where a macro's resolved actions end up. Implemented by the hub's router
/// in the full system; tests supply a capturing stub.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, address: &str, args: Vec<Value>);
}

#[derive(Debug, Clone)]
pub struct MacroAction {
    pub address: String,
    pub args: Vec<Value>,
    pub delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub trigger: String,
    pub actions: Vec<MacroAction>,
}

pub struct MacroEngine {
    macros: Mutex<HashMap<String, Vec<MacroAction>>>,
    dispatcher: Arc<dyn Dispatcher>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl MacroEngine {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            macros: Mutex::new(HashMap::new()),
            dispatcher,
            timers: Mutex::new(Vec::new()),
        })
    }

    /// Index by lowercase trigger address. A repeated trigger logs a warning
    /// and the last definition in `defs` wins.
    pub fn load(&self, defs: Vec<MacroDef>) {
        let mut macros = self.macros.lock().unwrap();
        macros.clear();
        for def in defs {
            let key = def.trigger.to_lowercase();
            if macros.contains_key(&key) {
                warn!(trigger = %key, "duplicate macro trigger, last definition wins");
            }
            macros.insert(key, def.actions);
        }
    }

    pub fn is_macro(&self, address: &str) -> bool {
        self.macros.lock().unwrap().contains_key(&address.to_lowercase())
    }

    /// Fire the macro bound to `address`, if any. No-op if `address` is not
    /// a registered trigger.
    pub async fn execute(self: &Arc<Self>, address: &str, trigger_args: Vec<Value>) {
        let key = address.to_lowercase();
        let actions = { self.macros.lock().unwrap().get(&key).cloned() };
        let Some(actions) = actions else { return };

        let mut chain = HashSet::new();
        chain.insert(key);
        self.run_actions(actions, Arc::new(trigger_args), chain).await;
    }

    async fn run_actions(
        self: &Arc<Self>,
        actions: Vec<MacroAction>,
        trigger_args: Arc<Vec<Value>>,
        chain: HashSet<String>,
    ) {
        for action in actions {
            let resolved = substitute(&action.args, &trigger_args);
            let target_key = action.address.to_lowercase();

            if self.macros.lock().unwrap().contains_key(&target_key) {
                if chain.contains(&target_key) {
                    warn!(address = %action.address, "macro cycle detected, aborting branch");
                    continue;
                }
                let mut branch_chain = chain.clone();
                branch_chain.insert(target_key.clone());
                let nested = { self.macros.lock().unwrap().get(&target_key).cloned() };
                let Some(nested) = nested else { continue };

                if action.delay_ms > 0 {
                    self.spawn_delayed_nested(action.delay_ms, nested, Arc::clone(&trigger_args), branch_chain);
                } else {
                    Box::pin(self.run_actions(nested, Arc::clone(&trigger_args), branch_chain)).await;
                }
            } else if action.delay_ms > 0 {
                self.spawn_delayed_dispatch(action.delay_ms, action.address, resolved);
            } else {
                self.dispatcher.dispatch(&action.address, resolved).await;
            }
        }
    }

    fn spawn_delayed_dispatch(self: &Arc<Self>, delay_ms: u64, address: String, args: Vec<Value>) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            engine.dispatcher.dispatch(&address, args).await;
        });
        self.timers.lock().unwrap().push(handle);
    }

    fn spawn_delayed_nested(
        self: &Arc<Self>,
        delay_ms: u64,
        nested: Vec<MacroAction>,
        trigger_args: Arc<Vec<Value>>,
        chain: HashSet<String>,
    ) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            engine.run_actions(nested, trigger_args, chain).await;
        });
        self.timers.lock().unwrap().push(handle);
    }

    /// Cancel every pending timer and clear the macro table.
    pub fn shutdown(&self) {
        for handle in self.timers.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.macros.lock().unwrap().clear();
    }
}

/// Replace every `$$N` string argument (1-based) with the N-th trigger arg.
/// Placeholders with no matching trigger arg are left as the literal string.
fn substitute(args: &[Value], trigger_args: &[Value]) -> Vec<Value> {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => placeholder_index(s)
                .and_then(|n| trigger_args.get(n - 1).cloned())
                .unwrap_or_else(|| arg.clone()),
            other => other.clone(),
        })
        .collect()
}

fn placeholder_index(s: &str) -> Option<usize> {
    let digits = s.strip_prefix("$$")?;
    if digits.is_empty() {
        return None;
    }
    digits.parse::<usize>().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CapturingDispatcher {
        calls: StdMutex<Vec<(String, Vec<Value>)>>,
    }

    impl CapturingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: StdMutex::new(Vec::new()) })
        }

        fn calls(&self) -> Vec<(String, Vec<Value>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatcher for CapturingDispatcher {
        async fn dispatch(&self, address: &str, args: Vec<Value>) {
            self.calls.lock().unwrap().push((address.to_string(), args));
        }
    }

    fn action(address: &str, args: Vec<Value>) -> MacroAction {
        MacroAction { address: address.into(), args, delay_ms: 0 }
    }

    #[test]
    fn load_indexes_by_lowercase_trigger_last_wins() {
        let engine = MacroEngine::new(CapturingDispatcher::new());
        engine.load(vec![
            MacroDef { trigger: "/Panic".into(), actions: vec![action("/a", vec![])] },
            MacroDef { trigger: "/panic".into(), actions: vec![action("/b", vec![])] },
        ]);
        assert!(engine.is_macro("/PANIC"));
        assert_eq!(engine.macros.lock().unwrap().get("/panic").unwrap()[0].address, "/b");
    }

    #[tokio::test]
    async fn placeholder_args_are_substituted_from_trigger_args() {
        let dispatcher = CapturingDispatcher::new();
        let engine = MacroEngine::new(dispatcher.clone());
        engine.load(vec![MacroDef {
            trigger: "/m".into(),
            actions: vec![action("/ch/1/mix/fader", vec![Value::String("$$1".into())])],
        }]);

        engine.execute("/m", vec![Value::Float(0.85)]).await;

        assert_eq!(dispatcher.calls(), vec![("/ch/1/mix/fader".into(), vec![Value::Float(0.85)])]);
    }

    #[tokio::test]
    async fn unmatched_placeholder_is_left_as_literal_string() {
        let dispatcher = CapturingDispatcher::new();
        let engine = MacroEngine::new(dispatcher.clone());
        engine.load(vec![MacroDef {
            trigger: "/m".into(),
            actions: vec![action("/a", vec![Value::String("$$3".into())])],
        }]);

        engine.execute("/m", vec![Value::Float(1.0)]).await;

        assert_eq!(dispatcher.calls(), vec![("/a".into(), vec![Value::String("$$3".into())])]);
    }

    #[tokio::test]
    async fn cycle_is_detected_and_aborts_only_that_branch() {
        let dispatcher = CapturingDispatcher::new();
        let engine = MacroEngine::new(dispatcher.clone());
        engine.load(vec![
            MacroDef {
                trigger: "/m".into(),
                actions: vec![action("/m2", vec![]), action("/marker", vec![])],
            },
            MacroDef {
                trigger: "/m2".into(),
                actions: vec![action("/m", vec![])],
            },
        ]);

        engine.execute("/m", vec![]).await;

        // /m -> /m2 -> /m (cycle, aborted); the sibling /marker action still fires.
        assert_eq!(dispatcher.calls(), vec![("/marker".into(), vec![])]);
    }

    #[tokio::test]
    async fn macro_reached_via_two_sibling_branches_fires_twice() {
        let dispatcher = CapturingDispatcher::new();
        let engine = MacroEngine::new(dispatcher.clone());
        engine.load(vec![
            MacroDef {
                trigger: "/m".into(),
                actions: vec![action("/shared", vec![]), action("/shared", vec![])],
            },
            MacroDef {
                trigger: "/shared".into(),
                actions: vec![action("/leaf", vec![])],
            },
        ]);

        engine.execute("/m", vec![]).await;

        assert_eq!(dispatcher.calls(), vec![("/leaf".into(), vec![]), ("/leaf".into(), vec![])]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_action_dispatches_after_its_delay() {
        let dispatcher = CapturingDispatcher::new();
        let engine = MacroEngine::new(dispatcher.clone());
        engine.load(vec![MacroDef {
            trigger: "/m".into(),
            actions: vec![MacroAction { address: "/a".into(), args: vec![], delay_ms: 100 }],
        }]);

        engine.execute("/m", vec![]).await;
        assert!(dispatcher.calls().is_empty());

        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.calls(), vec![("/a".into(), vec![])]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers_and_clears_macros() {
        let dispatcher = CapturingDispatcher::new();
        let engine = MacroEngine::new(dispatcher.clone());
        engine.load(vec![MacroDef {
            trigger: "/m".into(),
            actions: vec![MacroAction { address: "/a".into(), args: vec![], delay_ms: 1000 }],
        }]);

        engine.execute("/m", vec![]).await;
        engine.shutdown();

        tokio::time::advance(Duration::from_millis(2000)).await;
        tokio::task::yield_now().await;

        assert!(dispatcher.calls().is_empty());
        assert!(!engine.is_macro("/m"));
    }
}
