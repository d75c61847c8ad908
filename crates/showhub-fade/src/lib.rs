//! The 50 Hz fade engine: tracks the current value of every named parameter
//! and runs timed interpolations ("fades") between values.
//!
//! See spec §4.2. The engine is the single writer of tracked-value state;
//! ticks and `start_fade`/`cancel_*` calls race from different tasks, so all
//! mutation goes through one `std::sync::Mutex` (held only for the duration
//! of a pure computation — never across an `.await` or into driver code).

mod easing;

pub use easing::Easing;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const TICK_INTERVAL: Duration = Duration::from_millis(20);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum FadeEvent {
    /// A parameter's value changed, either mid-fade or as a terminal snap.
    Value { key: String, value: f64 },
    /// A fade for `key` ran to completion (or was snapped via `cancel_fade`).
    Complete { key: String },
}

/// Request to start an interpolation. `start_value` is only honored when the
/// key has no tracked value yet (a "cold start"); otherwise the engine picks
/// up from wherever the key currently is, per spec §9's open question.
#[derive(Debug, Clone)]
pub struct StartFade {
    pub key: String,
    pub start_value: f64,
    pub end_value: f64,
    pub duration_ms: u64,
    pub easing: Easing,
}

struct ActiveFade {
    start_value: f64,
    end_value: f64,
    started_at: Instant,
    duration_ms: u64,
    easing: Easing,
}

#[derive(Default)]
struct FadeState {
    tracked: HashMap<String, f64>,
    active: HashMap<String, ActiveFade>,
}

pub struct FadeEngine {
    state: Mutex<FadeState>,
    events: broadcast::Sender<FadeEvent>,
}

impl FadeEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(FadeState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FadeEvent> {
        self.events.subscribe()
    }

    /// Spawn the 50 Hz ticker. The returned handle is owned by the caller so
    /// `shutdown()` can abort it.
    pub fn spawn_ticker(self: &std::sync::Arc<Self>) -> JoinHandle<()> {
        let engine = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                engine.tick();
            }
        })
    }

    pub fn set_current_value(&self, key: &str, value: f64) {
        self.state.lock().unwrap().tracked.insert(key.to_string(), value);
    }

    pub fn get_current_value(&self, key: &str) -> Option<f64> {
        self.state.lock().unwrap().tracked.get(key).copied()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Start a fade. Cold start (no tracked value) snaps immediately instead
    /// of creating an active fade, to avoid an audible zero-to-target jump on
    /// first use. Warm start replaces any existing fade for the key
    /// atomically — at most one `fadeComplete` fires for the merged lifetime.
    pub fn start_fade(&self, req: StartFade) {
        let mut emit_value = None;
        let mut emit_complete = false;

        {
            let mut state = self.state.lock().unwrap();
            match state.tracked.get(&req.key).copied() {
                None => {
                    state.tracked.insert(req.key.clone(), req.end_value);
                    emit_value = Some(req.end_value);
                    emit_complete = true;
                }
                Some(current) => {
                    state.active.insert(
                        req.key.clone(),
                        ActiveFade {
                            start_value: current,
                            end_value: req.end_value,
                            started_at: Instant::now(),
                            duration_ms: req.duration_ms,
                            easing: req.easing,
                        },
                    );
                }
            }
        }

        if let Some(value) = emit_value {
            let _ = self.events.send(FadeEvent::Value {
                key: req.key.clone(),
                value,
            });
        }
        if emit_complete {
            let _ = self.events.send(FadeEvent::Complete { key: req.key });
        }
    }

    /// Remove a fade without completing it. With `snap`, append one terminal
    /// value event at the fade's `end_value` and update the tracked value;
    /// without it, remove silently.
    pub fn cancel_fade(&self, key: &str, snap: bool) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let removed = state.active.remove(key);
            if snap {
                if let Some(fade) = &removed {
                    state.tracked.insert(key.to_string(), fade.end_value);
                }
            }
            removed
        };

        if let (true, Some(fade)) = (snap, removed) {
            let _ = self.events.send(FadeEvent::Value {
                key: key.to_string(),
                value: fade.end_value,
            });
        }
    }

    pub fn cancel_all(&self) {
        self.state.lock().unwrap().active.clear();
    }

    /// Stop a named fade, or every fade with no argument — built-in `/fade/stop`.
    pub fn stop(&self, key: Option<&str>) {
        match key {
            Some(key) => self.cancel_fade(key, true),
            None => self.cancel_all(),
        }
    }

    fn tick(&self) {
        let mut value_events = Vec::new();
        let mut complete_events = Vec::new();

        {
            let mut state = self.state.lock().unwrap();
            let mut finished = Vec::new();

            for (key, fade) in state.active.iter() {
                let progress = if fade.duration_ms == 0 {
                    1.0
                } else {
                    (fade.started_at.elapsed().as_secs_f64() * 1000.0 / fade.duration_ms as f64)
                        .min(1.0)
                };
                let eased = fade.easing.apply(progress);
                let value = fade.start_value + eased * (fade.end_value - fade.start_value);

                value_events.push((key.clone(), value));
                if progress >= 1.0 {
                    finished.push(key.clone());
                }
            }

            for (key, value) in &value_events {
                state.tracked.insert(key.clone(), *value);
            }
            for key in finished {
                state.active.remove(&key);
                complete_events.push(key);
            }
        }

        for (key, value) in value_events {
            let _ = self.events.send(FadeEvent::Value { key, value });
        }
        for key in complete_events {
            let _ = self.events.send(FadeEvent::Complete { key });
        }
    }
}

impl Default for FadeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn drain(rx: &mut broadcast::Receiver<FadeEvent>) -> Vec<FadeEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[test]
    fn cold_start_snaps_without_creating_a_fade() {
        let engine = FadeEngine::new();
        let mut rx = engine.subscribe();

        engine.start_fade(StartFade {
            key: "input/1/fader".into(),
            start_value: 0.0,
            end_value: 0.8,
            duration_ms: 500,
            easing: Easing::Linear,
        });

        assert_eq!(engine.get_current_value("input/1/fader"), Some(0.8));
        assert_eq!(engine.active_count(), 0);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                FadeEvent::Value { key: "input/1/fader".into(), value: 0.8 },
                FadeEvent::Complete { key: "input/1/fader".into() },
            ]
        );
    }

    #[test]
    fn warm_start_ignores_caller_start_value() {
        let engine = FadeEngine::new();
        engine.set_current_value("k", 0.3);

        engine.start_fade(StartFade {
            key: "k".into(),
            start_value: 0.9, // must be ignored
            end_value: 1.0,
            duration_ms: 200,
            easing: Easing::Linear,
        });

        assert_eq!(engine.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_interpolates_and_completes() {
        let engine = Arc::new(FadeEngine::new());
        engine.set_current_value("k", 0.0);
        let mut rx = engine.subscribe();

        engine.start_fade(StartFade {
            key: "k".into(),
            start_value: 0.0,
            end_value: 1.0,
            duration_ms: 200,
            easing: Easing::Linear,
        });

        tokio::time::advance(StdDuration::from_millis(100)).await;
        engine.tick();
        let last_mid = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                FadeEvent::Value { value, .. } => Some(value),
                _ => None,
            })
            .last()
            .unwrap();
        assert!((0.4..=0.6).contains(&last_mid), "{last_mid}");

        tokio::time::advance(StdDuration::from_millis(150)).await;
        engine.tick();
        assert_eq!(engine.get_current_value("k"), Some(1.0));
        assert_eq!(engine.active_count(), 0);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, FadeEvent::Complete { key } if key == "k")));
    }

    #[test]
    fn replacing_an_active_fade_yields_one_completion() {
        let engine = FadeEngine::new();
        engine.set_current_value("k", 0.0);

        engine.start_fade(StartFade {
            key: "k".into(),
            start_value: 0.0,
            end_value: 1.0,
            duration_ms: 1000,
            easing: Easing::Linear,
        });
        engine.start_fade(StartFade {
            key: "k".into(),
            start_value: 0.0,
            end_value: 0.5,
            duration_ms: 1000,
            easing: Easing::Linear,
        });

        assert_eq!(engine.active_count(), 1);
    }

    #[test]
    fn cancel_fade_with_snap_emits_one_terminal_value() {
        let engine = FadeEngine::new();
        engine.set_current_value("k", 0.0);
        engine.start_fade(StartFade {
            key: "k".into(),
            start_value: 0.0,
            end_value: 1.0,
            duration_ms: 1000,
            easing: Easing::Linear,
        });

        let mut rx = engine.subscribe();
        engine.cancel_fade("k", true);
        let events = drain(&mut rx);
        assert_eq!(events, vec![FadeEvent::Value { key: "k".into(), value: 1.0 }]);
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn cancel_fade_without_snap_emits_nothing() {
        let engine = FadeEngine::new();
        engine.set_current_value("k", 0.0);
        engine.start_fade(StartFade {
            key: "k".into(),
            start_value: 0.0,
            end_value: 1.0,
            duration_ms: 1000,
            easing: Easing::Linear,
        });

        let mut rx = engine.subscribe();
        engine.cancel_fade("k", false);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn zero_duration_fade_completes_on_next_tick() {
        let engine = FadeEngine::new();
        engine.set_current_value("k", 0.0);
        engine.start_fade(StartFade {
            key: "k".into(),
            start_value: 0.0,
            end_value: 1.0,
            duration_ms: 0,
            easing: Easing::Linear,
        });
        engine.tick();
        assert_eq!(engine.get_current_value("k"), Some(1.0));
        assert_eq!(engine.active_count(), 0);
    }
}
