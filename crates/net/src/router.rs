//! Event router
//!
//! Maps event names to handlers. Handlers for one event run synchronously in
//! registration order; an error or panic in one is logged and the rest still
//! run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::connection::ClientId;
use crate::error::HandlerResult;
use crate::handle::ServerHandle;
use crate::protocol::Envelope;

/// Shared handler signature
pub type Handler =
    Arc<dyn Fn(&ClientId, &Value, &mut ServerHandle<'_>) -> HandlerResult + Send + Sync>;

/// Outcome of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

#[derive(Default, Clone)]
pub struct EventRouter {
    handlers: HashMap<String, Vec<Handler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for an event
    pub fn on<F>(&mut self, event: impl Into<String>, handler: F)
    where
        F: Fn(&ClientId, &Value, &mut ServerHandle<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map_or(0, Vec::len)
    }

    /// Run every handler registered for `event`
    pub fn dispatch(
        &self,
        event: &str,
        client_id: &ClientId,
        payload: &Value,
        server: &mut ServerHandle<'_>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(handlers) = self.handlers.get(event) else {
            debug!(event = %event, client_id = %client_id, "No handlers for event");
            return report;
        };

        for (index, handler) in handlers.iter().enumerate() {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(client_id, payload, server))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(event = %event, client_id = %client_id, handler = index, error = %e, "Handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    error!(
                        event = %event,
                        client_id = %client_id,
                        handler = index,
                        panic = %panic_message(panic.as_ref()),
                        "Handler panicked"
                    );
                }
            }
        }
        report
    }

    /// Parse inbound text into an envelope and dispatch it
    pub fn dispatch_text(
        &self,
        client_id: &ClientId,
        text: &str,
        server: &mut ServerHandle<'_>,
    ) -> DispatchReport {
        let envelope = Envelope::parse(text);
        self.dispatch(&envelope.event, client_id, &envelope.payload, server)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ReactorState;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let log = recorder();
        let mut router = EventRouter::new();
        for name in ["first", "second", "third"] {
            let log = log.clone();
            router.on("ping", move |_, _, _| {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            });
        }

        let mut state = ReactorState::default();
        let report = router.dispatch(
            "ping",
            &ClientId::from("client_a"),
            &json!({}),
            &mut ServerHandle::new(&mut state),
        );

        assert_eq!(report, DispatchReport { invoked: 3, failed: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failures_are_isolated() {
        let log = recorder();
        let mut router = EventRouter::new();

        router.on("save", |_, _, _| Err("disk full".into()));
        router.on("save", |_, _, _| panic!("handler bug"));
        {
            let log = log.clone();
            router.on("save", move |_, _, _| {
                log.lock().unwrap().push("save".into());
                Ok(())
            });
        }
        {
            let log = log.clone();
            router.on("other", move |_, _, _| {
                log.lock().unwrap().push("other".into());
                Ok(())
            });
        }

        let mut state = ReactorState::default();
        let mut server = ServerHandle::new(&mut state);
        let id = ClientId::from("client_a");

        let report = router.dispatch("save", &id, &json!({}), &mut server);
        assert_eq!(report, DispatchReport { invoked: 3, failed: 2 });

        router.dispatch("other", &id, &json!({}), &mut server);
        assert_eq!(*log.lock().unwrap(), vec!["save", "other"]);
    }

    #[test]
    fn test_unknown_event_is_noop() {
        let router = EventRouter::new();
        let mut state = ReactorState::default();
        let report = router.dispatch(
            "nothing",
            &ClientId::from("client_a"),
            &Value::Null,
            &mut ServerHandle::new(&mut state),
        );
        assert_eq!(report.invoked, 0);
        assert_eq!(router.handler_count("nothing"), 0);
    }

    #[test]
    fn test_raw_text_synthesizes_message_event() {
        let seen = Arc::new(Mutex::new(None));
        let mut router = EventRouter::new();
        {
            let seen = seen.clone();
            router.on("message", move |_, payload, _| {
                *seen.lock().unwrap() = Some(payload.clone());
                Ok(())
            });
        }

        let mut state = ReactorState::default();
        let raw = "  not json {\"event\": ";
        router.dispatch_text(&ClientId::from("client_a"), raw, &mut ServerHandle::new(&mut state));

        assert_eq!(*seen.lock().unwrap(), Some(json!({ "message": raw })));
    }
}
