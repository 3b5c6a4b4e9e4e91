//! Inbound message routing.
//!
//! Every parsed line goes through [`Router::route`] on the read loop:
//! liveness (PING/PONG) and login tracking first, then the owning channel's
//! join state, then subscribers and user handlers in registration order.

use crate::connection::Connection;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use twirc_protocol::command::{PING, PONG, RPL_ENDOFMOTD};
use twirc_protocol::Message;

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A callback invoked for every inbound message.
///
/// Handlers run synchronously on the read loop, so they must not block. The
/// connection is passed in explicitly; use [`Connection::shutdown`] to stop
/// from inside a handler.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, conn: &Connection, message: Message) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Connection, Message) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, conn: &Connection, message: Message) -> Result<(), HandlerError> {
        self(conn, message)
    }
}

/// Router statistics.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub routed_total: AtomicU64,
    pub pongs_total: AtomicU64,
    pub handler_failures_total: AtomicU64,
}

/// Dispatches inbound messages.
#[derive(Default)]
pub struct Router {
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    stats: RouterStats,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; handlers run in registration order.
    pub fn register(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Routes one inbound message.
    pub(crate) fn route(&self, conn: &Connection, message: Message) {
        self.stats.routed_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Recv: {}", message);

        match message.command() {
            PING => {
                let pong = format!("{} :{}", PONG, message.content());
                match conn.send_raw(&pong) {
                    Ok(true) => {
                        self.stats.pongs_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => tracing::warn!("PONG dropped, system queue full"),
                    Err(e) => tracing::warn!("PONG not queued: {}", e),
                }
            }
            RPL_ENDOFMOTD => conn.open_auth_gate(),
            _ => {}
        }

        if let Some(channel) = message.channel().and_then(|name| conn.channel(name)) {
            channel.on_inbound_message(&message);
        }

        conn.publish(&message);

        // Snapshot so a handler may register further handlers.
        let handlers = self.handlers.read().clone();
        for (idx, handler) in handlers.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(conn, message.clone())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stats
                        .handler_failures_total
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Handler #{} failed on '{}': {}", idx, message, e);
                }
                Err(panic) => {
                    self.stats
                        .handler_failures_total
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "Handler #{} panicked on '{}': {}",
                        idx,
                        message,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
