use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::identity::IdentityResolver;
use crate::protocol::handlers::{HandlerContext, HandlerRegistry};
use crate::protocol::parse::{Request, RequestHead};
use crate::protocol::response::{Ack, ReturnCode};
use crate::protocol::routes::{ReloadableRoutes, Route, RouteSlot};
use crate::store::{CacheStore, StoreConnection};
use crate::sync::Clock;

/// Turns one request document into its acknowledgement.
///
/// Every handler of the routed chain runs even when an earlier one fails; failures are
/// collected into the ACK message and the code of the last failure becomes the return code.
pub struct Dispatcher {
    routes: ReloadableRoutes,
    registry: HandlerRegistry,
    store: Arc<dyn CacheStore>,
    resolver: IdentityResolver,
    clock: Arc<dyn Clock>,
    skip_market_segments: Vec<String>,
}

#[derive(Debug, Default)]
struct Failures {
    last: Option<ReturnCode>,
    messages: Vec<String>,
}

impl Failures {
    fn push(&mut self, code: ReturnCode, message: String) {
        warn!(rc = code.code(), %message, "request processing failed");
        self.last = Some(code);
        self.messages.push(message);
    }
}

impl Dispatcher {
    pub fn new(
        routes: ReloadableRoutes,
        registry: HandlerRegistry,
        store: Arc<dyn CacheStore>,
        resolver: IdentityResolver,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { routes, registry, store, resolver, clock, skip_market_segments: Vec::new() }
    }

    pub fn with_skip_market_segments(mut self, segments: Vec<String>) -> Self {
        self.skip_market_segments = segments;
        self
    }

    pub async fn dispatch(&self, doc: &str) -> Ack {
        let head = RequestHead::parse(doc);
        let ack = Ack::for_request(&head);

        let table = match self.routes.current(|name| self.registry.contains(name)).await {
            Ok(table) => table,
            Err(e) => {
                error!(oc = %head.oc, error = %e, "route table unavailable");
                return ack.with_code(ReturnCode::ReloadFailed).with_message(format!("{} (OC={})", e, head.oc));
            }
        };

        let slots = match table.route(&head.oc) {
            Route::Chain(slots) => slots,
            Route::Ignored => {
                debug!(oc = %head.oc, "ignored operation code");
                return ack;
            }
            Route::Unknown => {
                warn!(oc = %head.oc, tn = %head.tn, "unsupported operation code");
                return ack
                    .with_code(ReturnCode::UnsupportedOc)
                    .with_message(format!("unsupported operation code '{}'", head.oc));
            }
        };

        let mut conn = match self.store.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(oc = %head.oc, error = %e, "cache store unreachable");
                return ack
                    .with_code(ReturnCode::StoreUnreachable)
                    .with_message(format!("cache store unreachable: {}", e));
            }
        };

        let failures = self.run_chain(conn.as_mut(), &head, slots, doc).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "closing request connection failed");
        }

        info!(oc = %head.oc, tn = %head.tn, failures = failures.messages.len(), "request processed");
        match failures.last {
            Some(code) => ack.with_code(code).with_message(failures.messages.join("\n")),
            None => ack,
        }
    }

    async fn run_chain(
        &self,
        conn: &mut dyn StoreConnection,
        head: &RequestHead,
        slots: &[RouteSlot],
        doc: &str,
    ) -> Failures {
        let mut failures = Failures::default();
        let mut ctx = HandlerContext {
            conn,
            resolver: &self.resolver,
            clock: self.clock.as_ref(),
            skip_market_segments: &self.skip_market_segments,
        };

        for slot in slots {
            let request = match Request::parse(doc, slot.shape) {
                Ok(request) => request,
                Err(e) => {
                    failures.push(ReturnCode::HandlerError, format!("{} parse failed: {}", slot.shape, e));
                    continue;
                }
            };
            for name in &slot.handlers {
                let Some(handler) = self.registry.get(name) else {
                    failures.push(ReturnCode::HandlerError, format!("{}: handler not registered", name));
                    continue;
                };
                let outcome = AssertUnwindSafe(handler.handle(&mut ctx, &request)).catch_unwind().await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(ReturnCode::HandlerError, format!("{}: {}", name, e)),
                    Err(panic) => {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        failures.push(ReturnCode::HandlerPanic, format!("{} panicked: {}", name, reason));
                    }
                }
                if ctx.conn.in_transaction()
                    && let Err(e) = ctx.conn.rollback().await
                {
                    warn!(handler = %name, error = %e, "rollback of unfinished transaction failed");
                }
            }
        }
        debug!(oc = %head.oc, slots = slots.len(), "handler chain finished");
        failures
    }
}
