use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

pub const JOB_STATE_CHANGED_EVENT: &str = "job.state_changed";
pub const AGENT_CONNECTED_EVENT: &str = "agent.connected";
pub const AGENT_DISCONNECTED_EVENT: &str = "agent.disconnected";

pub type ListenerResult = Result<(), String>;

type SyncListener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;
type AsyncListener = Arc<dyn Fn(Event) -> ListenerResult + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("sync listener #{listener_index} failed for event '{event}': {message}")]
    ListenerFailed {
        event: String,
        listener_index: usize,
        message: String,
    },
    #[error("sync listener #{listener_index} panicked for event '{event}'")]
    ListenerPanicked { event: String, listener_index: usize },
    #[error("event emitter is shutting down, '{event}' was not delivered")]
    ShuttingDown { event: String },
}

#[derive(Default)]
pub struct EventEmitter {
    sync_listeners: RwLock<HashMap<String, Vec<SyncListener>>>,
    async_listeners: RwLock<HashMap<String, Vec<AsyncListener>>>,
    running_async: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        let mut listeners = match self.sync_listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn on_async<F>(&self, event_name: impl Into<String>, listener: F)
    where
        F: Fn(Event) -> ListenerResult + Send + Sync + 'static,
    {
        let mut listeners = match self.async_listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn emit(&self, event_name: impl Into<String>, payload: Option<Value>) -> Result<(), EmitError> {
        let event = Event::new(event_name, payload);
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EmitError::ShuttingDown { event: event.name });
        }
        self.run_sync(&event)?;
        self.dispatch_async(event);
        Ok(())
    }

    /// Emits and logs any listener failure instead of returning it.
    pub fn emit_logged(&self, event_name: impl Into<String>, payload: Option<Value>) {
        if let Err(error) = self.emit(event_name, payload) {
            tracing::warn!(target: "events::emitter", %error, "event delivery failed");
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Waits until every spawned async listener has returned.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.running_async.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    fn run_sync(&self, event: &Event) -> Result<(), EmitError> {
        let handlers = {
            let listeners = match self.sync_listeners.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match listeners.get(&event.name) {
                Some(handlers) => handlers.clone(),
                None => return Ok(()),
            }
        };

        for (idx, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(EmitError::ListenerFailed {
                        event: event.name.clone(),
                        listener_index: idx,
                        message,
                    });
                }
                Err(_) => {
                    return Err(EmitError::ListenerPanicked {
                        event: event.name.clone(),
                        listener_index: idx,
                    });
                }
            }
        }

        Ok(())
    }

    fn dispatch_async(&self, event: Event) {
        let handlers = {
            let listeners = match self.async_listeners.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match listeners.get(&event.name) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };

        for (idx, listener) in handlers.into_iter().enumerate() {
            let event_for_listener = event.clone();
            let running = Arc::clone(&self.running_async);
            running.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                let event_name = event_for_listener.name.clone();
                match catch_unwind(AssertUnwindSafe(|| listener(event_for_listener))) {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => {
                        tracing::warn!(
                            target: "events::emitter",
                            listener_index = idx,
                            event = %event_name,
                            %message,
                            "async listener failed"
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            target: "events::emitter",
                            listener_index = idx,
                            event = %event_name,
                            "async listener panicked"
                        );
                    }
                }
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use super::{EmitError, EventEmitter, AGENT_DISCONNECTED_EVENT, JOB_STATE_CHANGED_EVENT};

    #[test]
    fn state_change_listeners_see_payload_in_registration_order() {
        let emitter = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["audit", "metrics"] {
            let seen = Arc::clone(&seen);
            emitter.on(JOB_STATE_CHANGED_EVENT, move |event| {
                let to = event
                    .payload
                    .as_ref()
                    .and_then(|payload| payload["to"].as_str())
                    .unwrap_or("?");
                seen.lock().expect("seen lock").push(format!("{tag}:{to}"));
                Ok(())
            });
        }

        emitter
            .emit(JOB_STATE_CHANGED_EVENT, Some(json!({"job_id": 3, "to": "completed"})))
            .expect("emit should pass");
        emitter
            .emit(AGENT_DISCONNECTED_EVENT, None)
            .expect("emit without listeners should pass");

        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec!["audit:completed".to_owned(), "metrics:completed".to_owned()]
        );
    }

    #[test]
    fn sync_listener_error_and_panic_bubble_up() {
        let failing = EventEmitter::new();
        failing.on("agent.connected", |_event| Err("listener failure".to_owned()));
        assert!(matches!(
            failing.emit("agent.connected", None),
            Err(EmitError::ListenerFailed {
                listener_index: 0,
                ..
            })
        ));

        let panicking = EventEmitter::new();
        panicking.on("agent.connected", |_event| panic!("boom"));
        assert!(matches!(
            panicking.emit("agent.connected", None),
            Err(EmitError::ListenerPanicked { .. })
        ));
    }

    #[test]
    fn async_listener_runs_and_is_awaited_on_idle() {
        let emitter = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        emitter.on_async(JOB_STATE_CHANGED_EVENT, move |_event| {
            std::thread::sleep(Duration::from_millis(20));
            calls_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        emitter
            .emit(JOB_STATE_CHANGED_EVENT, None)
            .expect("emit should pass");
        assert!(emitter.wait_for_idle(Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn emit_after_shutdown_is_rejected() {
        let emitter = EventEmitter::new();
        emitter.begin_shutdown();

        assert!(matches!(
            emitter.emit(JOB_STATE_CHANGED_EVENT, None),
            Err(EmitError::ShuttingDown { .. })
        ));
    }
}
