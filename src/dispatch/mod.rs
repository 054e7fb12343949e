use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::wire::envelope::{ArgumentMap, BinaryPayload, Envelope};

/// `Ok(None)` replies with an empty acknowledgement; `Err` becomes an
/// error-tagged reply.
pub type HandlerResult = Result<Option<ArgumentMap>, String>;

type ArgumentHandler = Box<dyn Fn(&ArgumentMap) -> HandlerResult + Send + Sync>;
type PayloadHandler = Box<dyn Fn(&ArgumentMap, Option<&BinaryPayload>) -> HandlerResult + Send + Sync>;

enum Handler {
    Argument(ArgumentHandler),
    WithPayload(PayloadHandler),
}

impl Handler {
    fn invoke(&self, envelope: &Envelope) -> HandlerResult {
        match self {
            Self::Argument(handler) => handler(&envelope.argument),
            Self::WithPayload(handler) => handler(&envelope.argument, envelope.binary.as_ref()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchError {
    DuplicateHandler { table: String, function: String },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateHandler { table, function } => write!(
                f,
                "handler for '{function}' is already registered in dispatch table '{table}'"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Routes inbound envelopes to named handlers.
///
/// Built once per responder role and shared read-only afterwards. Handler
/// failures, including panics, are converted into `error` replies so the
/// peer always gets an answer.
pub struct DispatchTable {
    name: String,
    log_context: String,
    handlers: HashMap<String, Handler>,
    logger: Arc<Logger>,
}

impl DispatchTable {
    pub fn new(name: impl Into<String>, logger: Arc<Logger>) -> Self {
        let name = name.into();
        Self {
            log_context: format!("dispatch::{name}"),
            name,
            handlers: HashMap::new(),
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register<F>(&mut self, function: impl Into<String>, handler: F) -> Result<(), DispatchError>
    where
        F: Fn(&ArgumentMap) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(function.into(), Handler::Argument(Box::new(handler)))
    }

    /// Like [`register`](Self::register), for handlers that also consume the
    /// binary part of the message.
    pub fn register_with_payload<F>(
        &mut self,
        function: impl Into<String>,
        handler: F,
    ) -> Result<(), DispatchError>
    where
        F: Fn(&ArgumentMap, Option<&BinaryPayload>) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(function.into(), Handler::WithPayload(Box::new(handler)))
    }

    pub fn contains(&self, function: &str) -> bool {
        self.handlers.contains_key(function)
    }

    pub fn functions(&self) -> Vec<&str> {
        let mut functions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        functions.sort_unstable();
        functions
    }

    pub fn dispatch(&self, envelope: &Envelope) -> Envelope {
        let Some(handler) = self.handlers.get(&envelope.function) else {
            self.logger.debug(
                Some(&self.log_context),
                &format!("no handler for '{}', replying with no-op", envelope.function),
            );
            return Envelope::nothing_happened();
        };

        match catch_unwind(AssertUnwindSafe(|| handler.invoke(envelope))) {
            Ok(Ok(Some(argument))) => Envelope::reply(argument),
            Ok(Ok(None)) => Envelope::reply(ArgumentMap::new()),
            Ok(Err(message)) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some(&self.log_context),
                    "handler failed",
                    Some(json!({"function": envelope.function, "error": message})),
                );
                Envelope::error(&envelope.function, message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.logger.log(
                    LogLevel::Error,
                    Some(&self.log_context),
                    "handler panicked",
                    Some(json!({"function": envelope.function, "panic": message})),
                );
                Envelope::error(&envelope.function, format!("handler panicked: {message}"))
            }
        }
    }

    fn insert(&mut self, function: String, handler: Handler) -> Result<(), DispatchError> {
        if self.handlers.contains_key(&function) {
            return Err(DispatchError::DuplicateHandler {
                table: self.name.clone(),
                function,
            });
        }
        self.handlers.insert(function, handler);
        Ok(())
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("name", &self.name)
            .field("functions", &self.functions())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use crate::logging::memory::memory_logger;
    use crate::wire::envelope::{
        message_argument, ArgumentMap, BinaryPayload, Envelope, NOTHING_HAPPENED_MESSAGE,
        REPLY_FUNCTION,
    };

    use super::{DispatchError, DispatchTable};

    fn request(function: &str, argument: serde_json::Value) -> Envelope {
        Envelope::from_json(function, argument).expect("literal argument is an object")
    }

    #[test]
    fn routes_to_registered_handler_exactly_once() {
        let (logger, _sink) = memory_logger();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut table = DispatchTable::new("gui_requests", logger);
        table
            .register("request_POI", move |argument| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(argument.get("prio"), Some(&json!(false)));
                Ok(Some(message_argument("Poi added")))
            })
            .expect("first registration should succeed");

        let reply = table.dispatch(&request("request_POI", json!({"prio": false})));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reply.function, REPLY_FUNCTION);
        assert_eq!(reply.message(), Some("Poi added"));
    }

    #[test]
    fn unknown_function_replies_nothing_happened() {
        let (logger, _sink) = memory_logger();
        let table = DispatchTable::new("imm_info", logger);

        let reply = table.dispatch(&Envelope::call("get_info"));

        assert_eq!(reply, Envelope::nothing_happened());
        assert_eq!(reply.message(), Some(NOTHING_HAPPENED_MESSAGE));
    }

    #[test]
    fn duplicate_registration_keeps_first_handler() {
        let (logger, _sink) = memory_logger();
        let mut table = DispatchTable::new("imm_commands", logger);
        table
            .register("add_poi", |_| Ok(Some(message_argument("first"))))
            .expect("first registration should succeed");

        let err = table
            .register("add_poi", |_| Ok(Some(message_argument("second"))))
            .expect_err("second registration should fail");

        assert_eq!(
            err,
            DispatchError::DuplicateHandler {
                table: "imm_commands".to_owned(),
                function: "add_poi".to_owned()
            }
        );
        let reply = table.dispatch(&Envelope::call("add_poi"));
        assert_eq!(reply.message(), Some("first"));
    }

    #[test]
    fn handler_error_becomes_error_reply_and_is_logged() {
        let (logger, sink) = memory_logger();
        let mut table = DispatchTable::new("rds_notifications", logger);
        table
            .register("new_pic", |_| Err("image store unavailable".to_owned()))
            .expect("registration should succeed");

        let reply = table.dispatch(&Envelope::call("new_pic"));

        assert!(reply.is_error());
        assert_eq!(reply.message(), Some("image store unavailable"));
        assert!(sink.contains("handler failed"));
    }

    #[test]
    fn panicking_handler_is_isolated_and_table_stays_usable() {
        let (logger, sink) = memory_logger();
        let mut table = DispatchTable::new("gui_requests", logger);
        table
            .register("set_mode", |_| panic!("mode switch exploded"))
            .expect("registration should succeed");
        table
            .register("connect", |_| Ok(None))
            .expect("registration should succeed");

        let crashed = table.dispatch(&Envelope::call("set_mode"));
        assert!(crashed.is_error());
        assert!(crashed
            .message()
            .is_some_and(|message| message.contains("mode switch exploded")));
        assert!(sink.contains("handler panicked"));

        let healthy = table.dispatch(&Envelope::call("connect"));
        assert_eq!(healthy, Envelope::reply(ArgumentMap::new()));
        let again = table.dispatch(&Envelope::call("set_mode"));
        assert!(again.is_error());
    }

    #[test]
    fn payload_handlers_see_binary_part() {
        let (logger, _sink) = memory_logger();
        let mut table = DispatchTable::new("rds_notifications", logger);
        table
            .register_with_payload("new_pic", |_, binary| {
                let size = binary.map(|payload| payload.bytes.len()).unwrap_or(0);
                Ok(Some(message_argument(format!("{size} bytes"))))
            })
            .expect("registration should succeed");

        let envelope = Envelope::call("new_pic").with_binary(BinaryPayload::new(
            "uint8",
            vec![2, 2],
            vec![1, 2, 3, 4],
        ));

        assert_eq!(table.dispatch(&envelope).message(), Some("4 bytes"));
        assert_eq!(table.functions(), vec!["new_pic"]);
    }
}
