//! Cue engine (spec §4.10): an editable, ordered show state with `go`/standby
//! firing and auto-follow scheduling.

mod registry;

pub use registry::ActionRegistry;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use showhub_proto::Value;
use tokio::task::JoinHandle;
use tracing::warn;

/// Where resolved cue commands end up. Implemented by the hub's router.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, address: &str, args: Vec<Value>);
}

#[derive(Debug, Clone)]
pub enum CueActionKind {
    /// Expands to whatever commands are registered under this id.
    Named(String),
    /// A direct address/args payload, not looked up in the registry.
    Inline { address: String, args: Vec<Value> },
}

#[derive(Debug, Clone)]
pub struct CueAction {
    pub kind: CueActionKind,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Cue {
    pub id: String,
    pub name: String,
    pub actions: Vec<CueAction>,
    pub auto_follow_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ShowState {
    pub name: String,
    pub cues: Vec<Cue>,
    pub active_cue_index: Option<usize>,
    pub fired_cue_indices: HashSet<usize>,
}

impl ShowState {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cues: Vec::new(),
            active_cue_index: None,
            fired_cue_indices: HashSet::new(),
        }
    }
}

pub struct CueEngine {
    state: Mutex<ShowState>,
    registry: Mutex<ActionRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    auto_follow_timer: Mutex<Option<JoinHandle<()>>>,
}

impl CueEngine {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ShowState::empty("")),
            registry: Mutex::new(ActionRegistry::new()),
            dispatcher,
            auto_follow_timer: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> std::sync::MutexGuard<'_, ActionRegistry> {
        self.registry.lock().unwrap()
    }

    /// Both entry points apply the same lifecycle rule: the new state fully
    /// replaces the old one, including cancelling any pending auto-follow.
    pub fn load_template(&self, state: ShowState) {
        self.replace_state(state);
    }

    pub fn load_state(&self, state: ShowState) {
        self.replace_state(state);
    }

    fn replace_state(&self, state: ShowState) {
        self.cancel_auto_follow();
        *self.state.lock().unwrap() = state;
    }

    pub fn snapshot(&self) -> ShowState {
        self.state.lock().unwrap().clone()
    }

    /// Advance `activeCueIndex` by one (or to 0 if none is active), fire the
    /// new cue's actions, and arm auto-follow if it has one. A no-op past
    /// the last cue. Always cancels a pending auto-follow timer first.
    pub async fn go(self: &Arc<Self>) {
        self.cancel_auto_follow();

        let fired = {
            let mut state = self.state.lock().unwrap();
            let new_index = state.active_cue_index.map(|i| i + 1).unwrap_or(0);
            if new_index >= state.cues.len() {
                return;
            }
            if let Some(previous) = state.active_cue_index {
                state.fired_cue_indices.insert(previous);
            }
            state.active_cue_index = Some(new_index);

            let cue = state.cues[new_index].clone();
            let has_next = new_index + 1 < state.cues.len();
            (cue, has_next)
        };
        let (cue, has_next) = fired;

        for action in &cue.actions {
            self.dispatch_action(action.clone()).await;
        }

        if has_next {
            if let Some(follow_ms) = cue.auto_follow_ms.filter(|ms| *ms > 0) {
                self.arm_auto_follow(follow_ms);
            }
        }
    }

    /// Clears the active cue and the fired set. Does not touch the cue list.
    pub fn standby(&self) {
        self.cancel_auto_follow();
        let mut state = self.state.lock().unwrap();
        state.active_cue_index = None;
        state.fired_cue_indices.clear();
    }

    pub fn reset(&self) {
        self.standby();
    }

    pub fn add_cue(&self, cue: Cue, index: Option<usize>) {
        let mut state = self.state.lock().unwrap();
        let at = index.unwrap_or(state.cues.len()).min(state.cues.len());
        state.cues.insert(at, cue);
        // Inserting shifts everything at or after `at` up by one.
        state.active_cue_index = state.active_cue_index.map(|i| if i >= at { i + 1 } else { i });
        state.fired_cue_indices = state
            .fired_cue_indices
            .iter()
            .map(|&i| if i >= at { i + 1 } else { i })
            .collect();
    }

    /// Removes the cue with `id`. If it was the active cue, the show goes
    /// to no active cue; every index past it shifts down by one.
    pub fn remove_cue(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(removed_index) = state.cues.iter().position(|c| c.id == id) else {
            return;
        };
        state.cues.remove(removed_index);
        state.active_cue_index = remap_after_remove(state.active_cue_index, removed_index);
        state.fired_cue_indices = state
            .fired_cue_indices
            .iter()
            .filter_map(|&i| remap_after_remove(Some(i), removed_index))
            .collect();
    }

    /// Moves the cue with `id` to `new_index`, preserving which cue identity
    /// `active_cue_index` and `fired_cue_indices` point to.
    pub fn move_cue(&self, id: &str, new_index: usize) {
        let mut state = self.state.lock().unwrap();
        let Some(from) = state.cues.iter().position(|c| c.id == id) else {
            return;
        };
        let to = new_index.min(state.cues.len().saturating_sub(1));
        if from == to {
            return;
        }
        let cue = state.cues.remove(from);
        state.cues.insert(to, cue);

        state.active_cue_index = state.active_cue_index.map(|i| remap_after_move(i, from, to));
        state.fired_cue_indices = state
            .fired_cue_indices
            .iter()
            .map(|&i| remap_after_move(i, from, to))
            .collect();
    }

    pub fn update_cue(&self, id: &str, mutate: impl FnOnce(&mut Cue)) {
        let mut state = self.state.lock().unwrap();
        if let Some(cue) = state.cues.iter_mut().find(|c| c.id == id) {
            mutate(cue);
        } else {
            warn!(id, "update_cue: no such cue");
        }
    }

    pub fn add_action(&self, cue_id: &str, action: CueAction, index: Option<usize>) {
        let mut state = self.state.lock().unwrap();
        if let Some(cue) = state.cues.iter_mut().find(|c| c.id == cue_id) {
            let at = index.unwrap_or(cue.actions.len()).min(cue.actions.len());
            cue.actions.insert(at, action);
        } else {
            warn!(cue_id, "add_action: no such cue");
        }
    }

    pub fn remove_action(&self, cue_id: &str, action_index: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(cue) = state.cues.iter_mut().find(|c| c.id == cue_id) {
            if action_index < cue.actions.len() {
                cue.actions.remove(action_index);
            }
        } else {
            warn!(cue_id, "remove_action: no such cue");
        }
    }

    /// Resolve `action` to its concrete commands and dispatch. An
    /// undelayed action is awaited in place so actions within one cue fire
    /// in listed order (spec §5); a delayed action gets its own independent
    /// timer so it doesn't hold up the rest of the cue.
    async fn dispatch_action(self: &Arc<Self>, action: CueAction) {
        let commands = match &action.kind {
            CueActionKind::Inline { address, args } => vec![(address.clone(), args.clone())],
            CueActionKind::Named(id) => {
                let commands = self.registry.lock().unwrap().resolve(id);
                match commands {
                    Some(commands) => commands,
                    None => {
                        warn!(action_id = %id, "cue action references unknown registered action");
                        return;
                    }
                }
            }
        };

        match action.delay_ms.filter(|ms| *ms > 0) {
            None => {
                for (address, args) in commands {
                    self.dispatcher.dispatch(&address, args).await;
                }
            }
            Some(delay_ms) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    for (address, args) in commands {
                        engine.dispatcher.dispatch(&address, args).await;
                    }
                });
            }
        }
    }

    fn arm_auto_follow(self: &Arc<Self>, delay_ms: u64) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            engine.go().await;
        });
        *self.auto_follow_timer.lock().unwrap() = Some(handle);
    }

    fn cancel_auto_follow(&self) {
        if let Some(handle) = self.auto_follow_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn shutdown(&self) {
        self.cancel_auto_follow();
    }
}

fn remap_after_remove(index: Option<usize>, removed: usize) -> Option<usize> {
    index.and_then(|i| match i.cmp(&removed) {
        std::cmp::Ordering::Equal => None,
        std::cmp::Ordering::Greater => Some(i - 1),
        std::cmp::Ordering::Less => Some(i),
    })
}

fn remap_after_move(index: usize, from: usize, to: usize) -> usize {
    if index == from {
        to
    } else if from < to && index > from && index <= to {
        index - 1
    } else if to < from && index >= to && index < from {
        index + 1
    } else {
        index
    }
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

    fn inline_cue(id: &str, address: &str) -> Cue {
        Cue {
            id: id.into(),
            name: id.into(),
            actions: vec![CueAction {
                kind: CueActionKind::Inline { address: address.into(), args: vec![] },
                delay_ms: None,
            }],
            auto_follow_ms: None,
        }
    }

    fn show(cues: Vec<Cue>) -> ShowState {
        ShowState { name: "test".into(), cues, active_cue_index: None, fired_cue_indices: HashSet::new() }
    }

    #[tokio::test]
    async fn go_from_fresh_state_activates_first_cue() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher.clone());
        engine.load_template(show(vec![inline_cue("c1", "/a"), inline_cue("c2", "/b")]));

        engine.go().await;
        tokio::task::yield_now().await;

        assert_eq!(engine.snapshot().active_cue_index, Some(0));
        assert_eq!(dispatcher.calls(), vec![("/a".into(), vec![])]);
    }

    #[tokio::test]
    async fn go_marks_previous_active_cue_as_fired() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher.clone());
        engine.load_template(show(vec![inline_cue("c1", "/a"), inline_cue("c2", "/b")]));

        engine.go().await;
        engine.go().await;
        tokio::task::yield_now().await;

        let snap = engine.snapshot();
        assert_eq!(snap.active_cue_index, Some(1));
        assert!(snap.fired_cue_indices.contains(&0));
    }

    #[tokio::test]
    async fn go_past_last_cue_is_a_no_op() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher.clone());
        engine.load_template(show(vec![inline_cue("c1", "/a")]));

        engine.go().await;
        engine.go().await;
        tokio::task::yield_now().await;

        assert_eq!(engine.snapshot().active_cue_index, Some(0));
    }

    #[test]
    fn standby_clears_active_and_fired() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher);
        let mut state = show(vec![inline_cue("c1", "/a")]);
        state.active_cue_index = Some(0);
        state.fired_cue_indices.insert(0);
        engine.load_state(state);

        engine.standby();

        let snap = engine.snapshot();
        assert_eq!(snap.active_cue_index, None);
        assert!(snap.fired_cue_indices.is_empty());
    }

    #[test]
    fn remove_cue_clears_active_index_when_active_cue_removed() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher);
        let mut state = show(vec![inline_cue("c1", "/a"), inline_cue("c2", "/b"), inline_cue("c3", "/c")]);
        state.active_cue_index = Some(1);
        state.fired_cue_indices.insert(0);
        engine.load_state(state);

        engine.remove_cue("c2");

        let snap = engine.snapshot();
        assert_eq!(snap.cues.len(), 2);
        assert_eq!(snap.active_cue_index, None);
        assert!(snap.fired_cue_indices.contains(&0));
    }

    #[test]
    fn remove_cue_before_active_shifts_active_index_down() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher);
        let mut state = show(vec![inline_cue("c1", "/a"), inline_cue("c2", "/b"), inline_cue("c3", "/c")]);
        state.active_cue_index = Some(2);
        engine.load_state(state);

        engine.remove_cue("c1");

        assert_eq!(engine.snapshot().active_cue_index, Some(1));
    }

    #[test]
    fn move_cue_keeps_active_pointing_at_the_same_cue_identity() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher);
        let mut state = show(vec![inline_cue("c1", "/a"), inline_cue("c2", "/b"), inline_cue("c3", "/c")]);
        state.active_cue_index = Some(1); // active = c2
        engine.load_state(state);

        engine.move_cue("c2", 0);

        let snap = engine.snapshot();
        assert_eq!(snap.cues[0].id, "c2");
        assert_eq!(snap.active_cue_index, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_follow_schedules_the_next_go() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher.clone());
        let mut c1 = inline_cue("c1", "/a");
        c1.auto_follow_ms = Some(200);
        engine.load_template(show(vec![c1, inline_cue("c2", "/b")]));

        engine.go().await;
        tokio::task::yield_now().await;
        assert_eq!(engine.snapshot().active_cue_index, Some(0));

        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        assert_eq!(engine.snapshot().active_cue_index, Some(1));
        assert_eq!(dispatcher.calls(), vec![("/a".into(), vec![]), ("/b".into(), vec![])]);
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_go_cancels_pending_auto_follow() {
        let dispatcher = CapturingDispatcher::new();
        let engine = CueEngine::new(dispatcher.clone());
        let mut c1 = inline_cue("c1", "/a");
        c1.auto_follow_ms = Some(200);
        engine.load_template(show(vec![c1, inline_cue("c2", "/b"), inline_cue("c3", "/c")]));

        engine.go().await; // activates c1, arms auto-follow
        tokio::task::yield_now().await;
        engine.go().await; // activates c2 manually, should cancel c1's auto-follow
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;

        // Without cancellation this would have reached c3 via auto-follow.
        assert_eq!(engine.snapshot().active_cue_index, Some(1));
    }
}
