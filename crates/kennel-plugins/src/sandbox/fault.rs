//! Panic containment for isolated calls.
//!
//! [`CatchFault`] polls its inner future under `catch_unwind` and turns a
//! panic into a [`Fault`]. While a contained poll is running, the process
//! panic hook records a backtrace of the panicking thread instead of
//! printing the default report.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use crate::error::PluginError;

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain a capturing hook in front of whatever hook is installed.
pub(crate) fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

/// A panic caught inside an isolated call.
#[derive(Debug, Clone)]
pub struct Fault {
    /// The panic payload rendered as text.
    pub message: String,
    /// Backtrace of the panicking thread.
    pub backtrace: String,
}

impl From<Fault> for PluginError {
    fn from(fault: Fault) -> Self {
        Self::Critical {
            fault: fault.message,
            backtrace: fault.backtrace,
        }
    }
}

/// Render a panic payload.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Future adapter that converts panics of the inner future into [`Fault`]s.
pub(crate) struct CatchFault<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> CatchFault<F> {
    pub(crate) fn new(inner: F) -> Self {
        install_hook();
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for CatchFault<F> {
    type Output = Result<F::Output, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outer = CAPTURING.with(|flag| flag.replace(true));
        let polled = panic::catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll(cx)));
        CAPTURING.with(|flag| flag.set(outer));

        match polled {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => {
                let backtrace = LAST_TRACE
                    .with(|slot| slot.borrow_mut().take())
                    .unwrap_or_else(|| "<backtrace unavailable>".to_string());
                Poll::Ready(Err(Fault {
                    message: payload_message(payload.as_ref()),
                    backtrace,
                }))
            },
        }
    }
}
