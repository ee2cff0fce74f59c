//! The script engine behind the console prompt.
//!
//! QuickJS runtimes are single-threaded, so one dedicated thread owns the
//! runtime and evaluates requests in order. Results come back over oneshot
//! channels. `console.*` calls and unhandled rejections inside evaluated
//! code are published to the log stream.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use protocol::{LogLevel, LogRecord, UnhandledRejection};
use rquickjs::function::Rest;
use rquickjs::{Context, Ctx, Function, Object, Runtime, Type, Value};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::eval::{remap_positions, wrap_async, SourceDeletions};
use crate::logging::LogStream;

/// Longest a single evaluation may run before it is interrupted.
pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(10);

const SETTLE_FN: &str = "__paneterm_settle";
const REPORT_FN: &str = "__paneterm_report";
const RUN_FN: &str = "__paneterm_run";
const TRACK_FN: &str = "__paneterm_track";
const DRAIN_FN: &str = "__paneterm_drain";

/// Installs the runner that awaits an evaluation and reports how it
/// settled, plus the bookkeeping for rejections nobody handled. The Rust
/// hooks are hidden from user code afterwards.
const BOOTSTRAP: &str = r#"
(() => {
  const settle = globalThis.__paneterm_settle;
  const report = globalThis.__paneterm_report;
  delete globalThis.__paneterm_settle;
  delete globalThis.__paneterm_report;
  const unhandled = [];
  const hidden = (name, value) => Object.defineProperty(globalThis, name, { value });
  hidden("__paneterm_run", function __paneterm_run(id, body, context, capture) {
    body(context).then(
      (result) => {
        if (!capture) {
          settle(id, "done");
        } else if (Array.isArray(result) && result.length === 1) {
          settle(id, "value", result[0]);
        } else {
          settle(id, "error", new Error(String(result)));
        }
      },
      (error) => settle(id, "error", error),
    );
  });
  hidden("__paneterm_track", function (promise, reason, handled) {
    const index = unhandled.findIndex((entry) => entry.promise === promise);
    if (handled) {
      if (index >= 0) unhandled.splice(index, 1);
    } else if (index < 0) {
      unhandled.push({ promise, reason });
    }
  });
  hidden("__paneterm_drain", function () {
    const reasons = unhandled.map((entry) => entry.reason);
    unhandled.length = 0;
    for (const reason of reasons) report(reason);
  });
})();
"#;

/// A display as seen from `$$.terminals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalInfo {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
}

/// One evaluation.
#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub source: String,
    pub deletions: SourceDeletions,
    /// Whether `source` returns `[value]` to be echoed.
    pub capture: bool,
    pub depth: u32,
    pub terminals: Vec<TerminalInfo>,
}

impl EvalRequest {
    fn context_json(&self) -> String {
        serde_json::json!({
            "depth": self.depth,
            "terminals": self.terminals,
        })
        .to_string()
    }
}

/// How an evaluation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// Finished without a captured value.
    Done,
    /// Finished with a captured value; `None` for `undefined`.
    Value(Option<serde_json::Value>),
    /// The source did not compile.
    SyntaxError(String),
    /// Threw, rejected or was interrupted.
    Error(String),
    /// Still waiting on something that never settled.
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalResponse {
    pub outcome: EvalOutcome,
    /// `$$.depth` after evaluation, if still a usable number.
    pub depth: Option<u32>,
}

impl EvalResponse {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: EvalOutcome::Error(message.into()),
            depth: None,
        }
    }
}

struct Job {
    request: EvalRequest,
    reply: oneshot::Sender<EvalResponse>,
}

/// Handle to the engine thread. The thread stops once every handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    jobs: mpsc::UnboundedSender<Job>,
}

impl ScriptEngine {
    /// Start the engine thread.
    pub fn spawn(log: LogStream, timeout: Duration) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let spawned = thread::Builder::new()
            .name("paneterm-console".to_string())
            .spawn(move || match Interpreter::new(log, timeout) {
                Ok(interpreter) => {
                    while let Some(job) = rx.blocking_recv() {
                        let response = interpreter.evaluate(&job.request);
                        let _ = job.reply.send(response);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start script engine");
                    while let Some(job) = rx.blocking_recv() {
                        let _ = job
                            .reply
                            .send(EvalResponse::failed(format!("script engine unavailable: {e}")));
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn script engine thread");
        }
        Self { jobs }
    }

    /// Evaluate a request.
    pub async fn evaluate(&self, request: EvalRequest) -> EvalResponse {
        let (reply, response) = oneshot::channel();
        if self.jobs.send(Job { request, reply }).is_err() {
            return EvalResponse::failed("script engine unavailable");
        }
        response
            .await
            .unwrap_or_else(|_| EvalResponse::failed("script engine stopped"))
    }
}

/// How the runner reported a settled evaluation.
enum Settlement {
    Done,
    Value(Option<serde_json::Value>),
    Error(String),
}

struct Interpreter {
    // Declared before the runtime so it is dropped first.
    context: Context,
    _runtime: Runtime,
    settled: Rc<RefCell<HashMap<u64, Settlement>>>,
    next_id: Cell<u64>,
    deadline: Arc<Mutex<Option<Instant>>>,
    timeout: Duration,
}

impl Interpreter {
    fn new(log: LogStream, timeout: Duration) -> rquickjs::Result<Self> {
        let runtime = Runtime::new()?;

        // A promise rejected before its handler is attached (any async
        // function that throws early) is reported here first as unhandled,
        // then as handled. Only what is still unhandled once the job queue
        // drains gets published.
        runtime.set_host_promise_rejection_tracker(Some(Box::new(
            |ctx, promise, reason, is_handled| {
                if let Ok(track) = ctx.globals().get::<_, Function>(TRACK_FN) {
                    let _ = track.call::<_, ()>((promise, reason, is_handled));
                }
            },
        )));

        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let interrupt = Arc::clone(&deadline);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            interrupt
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some_and(|deadline| Instant::now() >= deadline)
        })));

        let context = Context::full(&runtime)?;
        let settled = Rc::new(RefCell::new(HashMap::new()));
        context.with(|ctx| install_globals(&ctx, &log, &settled))?;

        Ok(Self {
            context,
            _runtime: runtime,
            settled,
            next_id: Cell::new(1),
            deadline,
            timeout,
        })
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    fn evaluate(&self, request: &EvalRequest) -> EvalResponse {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        self.set_deadline(Some(Instant::now() + self.timeout));
        let response = self.context.with(|ctx| {
            let body = match ctx.eval::<Function, _>(wrap_async(&request.source)) {
                Ok(body) => body,
                Err(e) => {
                    let (name, text) = describe_error(&ctx, e);
                    let text = remap_positions(&text, &request.deletions);
                    let outcome = if name == "SyntaxError" {
                        EvalOutcome::SyntaxError(text)
                    } else {
                        EvalOutcome::Error(text)
                    };
                    return EvalResponse {
                        outcome,
                        depth: None,
                    };
                }
            };

            let context = match ctx.eval::<Object, _>(format!("({})", request.context_json())) {
                Ok(context) => context,
                Err(e) => return EvalResponse::failed(describe_error(&ctx, e).1),
            };

            let started = ctx
                .globals()
                .get::<_, Function>(RUN_FN)
                .and_then(|run| {
                    run.call::<_, ()>((id as f64, body, context.clone(), request.capture))
                });
            if let Err(e) = started {
                return EvalResponse::failed(describe_error(&ctx, e).1);
            }

            while ctx.execute_pending_job() {}
            if let Ok(drain) = ctx.globals().get::<_, Function>(DRAIN_FN) {
                let _ = drain.call::<_, ()>(());
            }

            let depth = context
                .get::<_, f64>("depth")
                .ok()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(|d| d.min(f64::from(u32::MAX)) as u32);

            let outcome = match self.settled.borrow_mut().remove(&id) {
                Some(Settlement::Done) => EvalOutcome::Done,
                Some(Settlement::Value(value)) => EvalOutcome::Value(value),
                Some(Settlement::Error(text)) => {
                    EvalOutcome::Error(remap_positions(&text, &request.deletions))
                }
                None => EvalOutcome::Pending,
            };
            EvalResponse { outcome, depth }
        });
        self.set_deadline(None);
        response
    }
}

fn install_globals(
    ctx: &Ctx<'_>,
    log: &LogStream,
    settled: &Rc<RefCell<HashMap<u64, Settlement>>>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let console = Object::new(ctx.clone())?;
    for (name, level) in [
        ("log", LogLevel::Info),
        ("info", LogLevel::Info),
        ("debug", LogLevel::Debug),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        let log = log.clone();
        let function = Function::new(
            ctx.clone(),
            move |_ctx: Ctx, args: Rest<Value>| {
                let values = args.0.iter().map(to_log_value).collect();
                log.publish(console_record(level, values));
            },
        )?;
        console.set(name, function)?;
    }
    globals.set("console", console)?;

    let settled = Rc::clone(settled);
    let settle = Function::new(ctx.clone(), move |_ctx: Ctx, args: Rest<Value>| {
        let args = args.0;
        let Some(id) = args.first().and_then(Value::as_number) else {
            return;
        };
        let kind = args
            .get(1)
            .and_then(|v| v.as_string())
            .and_then(|s| s.to_string().ok())
            .unwrap_or_default();
        let settlement = match kind.as_str() {
            "value" => Settlement::Value(
                args.get(2)
                    .filter(|v| !v.is_undefined())
                    .map(to_log_value),
            ),
            "error" => Settlement::Error(
                args.get(2)
                    .map(|v| describe_value(v).1)
                    .unwrap_or_default(),
            ),
            _ => Settlement::Done,
        };
        settled.borrow_mut().insert(id as u64, settlement);
    })?;
    globals.set(SETTLE_FN, settle)?;

    let log = log.clone();
    let report = Function::new(ctx.clone(), move |_ctx: Ctx, args: Rest<Value>| {
        let reason = args.0.first().map(to_log_value).unwrap_or_default();
        log.publish(LogRecord::UnhandledRejection(UnhandledRejection { reason }));
    })?;
    globals.set(REPORT_FN, report)?;

    ctx.eval::<(), _>(BOOTSTRAP)
}

fn console_record(level: LogLevel, values: Vec<serde_json::Value>) -> LogRecord {
    match level {
        LogLevel::Debug => LogRecord::Debug(values),
        LogLevel::Info => LogRecord::Info(values),
        LogLevel::Warn => LogRecord::Warn(values),
        LogLevel::Error => LogRecord::Error(values),
    }
}

/// Name and printable text of a failed engine call.
fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> (String, String) {
    if err.is_exception() {
        let exception = ctx.catch();
        return describe_value(&exception);
    }
    ("Error".to_string(), err.to_string())
}

/// Name and printable text of a thrown value.
fn describe_value(value: &Value<'_>) -> (String, String) {
    if let Some(exception) = value.as_exception() {
        let name = exception
            .get::<_, String>("name")
            .unwrap_or_else(|_| "Error".to_string());
        let message = exception.message().unwrap_or_default();
        let mut text = format!("{name}: {message}");
        if let Some(stack) = exception.stack().filter(|s| !s.trim().is_empty()) {
            text.push('\n');
            text.push_str(stack.trim_end());
        }
        return (name, text);
    }
    let text = match to_log_value(value) {
        serde_json::Value::String(s) => s,
        other => super::format::inspect(&other, super::format::DEFAULT_INSPECT_DEPTH),
    };
    ("Error".to_string(), text)
}

/// Convert a script value for logging. Errors become their printable text.
fn to_log_value(value: &Value<'_>) -> serde_json::Value {
    match value.type_of() {
        Type::Null | Type::Undefined | Type::Uninitialized => serde_json::Value::Null,
        Type::Bool => value
            .as_bool()
            .map(serde_json::Value::Bool)
            .unwrap_or(serde_json::Value::Null),
        Type::Int => value
            .as_int()
            .map(|n| serde_json::Value::Number(n.into()))
            .unwrap_or(serde_json::Value::Null),
        Type::Float => value
            .as_float()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| match value.as_float() {
                Some(f) if f.is_nan() => serde_json::Value::String("NaN".to_string()),
                Some(f) if f > 0.0 => serde_json::Value::String("Infinity".to_string()),
                Some(_) => serde_json::Value::String("-Infinity".to_string()),
                None => serde_json::Value::Null,
            }),
        Type::String => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
        Type::Exception => serde_json::Value::String(describe_value(value).1),
        Type::Array => value
            .as_array()
            .map(|array| {
                serde_json::Value::Array(
                    array
                        .iter::<Value>()
                        .filter_map(Result::ok)
                        .map(|item| to_log_value(&item))
                        .collect(),
                )
            })
            .unwrap_or(serde_json::Value::Null),
        Type::Function | Type::Constructor => serde_json::Value::String("[Function]".to_string()),
        Type::Object => value
            .as_object()
            .map(|object| {
                let mut map = serde_json::Map::new();
                for key in object.keys::<String>().flatten() {
                    if let Ok(item) = object.get::<_, Value>(&key) {
                        map.insert(key, to_log_value(&item));
                    }
                }
                serde_json::Value::Object(map)
            })
            .unwrap_or(serde_json::Value::Null),
        Type::Symbol => serde_json::Value::String("Symbol()".to_string()),
        _ => serde_json::Value::String(format!("[{}]", value.type_name())),
    }
}
