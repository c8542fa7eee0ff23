use crate::config::ActionRuleConfig;
use crate::event::{EventNotification, EventVariables, PhoneEvent};
use crate::template;
use anyhow::Result;
use axum::{
    extract::{RawQuery, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod dispatch;
pub mod request_log;
#[cfg(test)]
mod tests;

pub use dispatch::{
    ActionDispatcher, ActionKind, ActionSink, DispatchJob, DispatchQueue, SystemActionSink,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRule {
    pub event: PhoneEvent,
    pub url_template: String,
    pub open_in_browser: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ActionRules {
    rules: HashMap<PhoneEvent, ActionRule>,
}

impl ActionRules {
    pub fn new(rules: impl IntoIterator<Item = ActionRule>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.event, r)).collect(),
        }
    }

    /// Builds the rule set from the `[actions]` table; unknown event names
    /// are logged and ignored.
    pub fn from_config(actions: &HashMap<String, ActionRuleConfig>) -> Self {
        let rules = actions.iter().filter_map(|(name, rule)| match name.parse() {
            Ok(event) => Some(ActionRule {
                event,
                url_template: rule.url.clone(),
                open_in_browser: rule.browser,
            }),
            Err(e) => {
                warn!("ignoring action: {}", e);
                None
            }
        });
        Self::new(rules)
    }

    pub fn get(&self, event: PhoneEvent) -> Option<&ActionRule> {
        self.rules.get(&event)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Shared, swappable rule set. Readers always get a complete snapshot.
#[derive(Clone, Default)]
pub struct RuleStore {
    inner: Arc<RwLock<Arc<ActionRules>>>,
}

impl RuleStore {
    pub fn new(rules: ActionRules) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(rules))),
        }
    }

    pub fn snapshot(&self) -> Arc<ActionRules> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, rules: ActionRules) {
        let rules = Arc::new(rules);
        match self.inner.write() {
            Ok(mut guard) => *guard = rules,
            Err(poisoned) => *poisoned.into_inner() = rules,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Listening,
}

#[derive(Clone)]
struct CallbackContext {
    rules: RuleStore,
    queue: DispatchQueue,
    started_at: Instant,
}

pub struct CallbackServer {
    rules: RuleStore,
    queue: DispatchQueue,
}

impl CallbackServer {
    pub fn new(rules: RuleStore, queue: DispatchQueue) -> Self {
        Self { rules, queue }
    }

    pub fn router(&self) -> Router {
        let ctx = CallbackContext {
            rules: self.rules.clone(),
            queue: self.queue.clone(),
            started_at: Instant::now(),
        };

        let mut router = Router::new().route("/health", get(health_handler));
        for event in PhoneEvent::ALL {
            router = router.route(
                &event.path(),
                get(
                    move |State(ctx): State<CallbackContext>, RawQuery(query): RawQuery| async move {
                        handle_event(ctx, event, query.as_deref().unwrap_or_default())
                    },
                ),
            );
        }

        let skip_paths = Arc::new(vec!["/health".to_string()]);
        router
            .layer(middleware::from_fn_with_state(
                skip_paths,
                request_log::log_requests,
            ))
            .with_state(ctx)
    }

    /// Starts serving on an already bound listener. The returned server is
    /// `Listening` as soon as this returns.
    pub fn listen(
        self,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<ListeningServer> {
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let listening = Arc::new(AtomicBool::new(true));

        let flag = listening.clone();
        let shutdown = token.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            flag.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => info!("callback server stopped"),
                Err(ref e) => warn!("callback server error: {}", e),
            }
            result.map_err(anyhow::Error::from)
        });

        info!(%local_addr, "callback server listening");
        Ok(ListeningServer {
            local_addr,
            token,
            listening,
            task,
        })
    }
}

pub struct ListeningServer {
    local_addr: SocketAddr,
    token: CancellationToken,
    listening: Arc<AtomicBool>,
    task: JoinHandle<Result<()>>,
}

impl ListeningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        if self.listening.load(Ordering::SeqCst) {
            ServerState::Listening
        } else {
            ServerState::Stopped
        }
    }

    pub async fn stop(self) -> Result<ServerState> {
        self.token.cancel();
        self.wait().await
    }

    /// Waits until the server stops on its own or its token is cancelled.
    pub async fn wait(self) -> Result<ServerState> {
        self.task.await??;
        Ok(ServerState::Stopped)
    }
}

/// Splits a raw query string without form decoding, so a literal `+` in a
/// phone number survives.
fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(name), decode(value))
        })
        .collect()
}

fn decode(s: &str) -> String {
    match urlencoding::decode(s) {
        Ok(value) => value.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned(),
    }
}

fn handle_event(ctx: CallbackContext, event: PhoneEvent, raw_query: &str) -> Response {
    let query = parse_query(raw_query);
    let notification = EventNotification::new(event, EventVariables::from_query(&query));
    info!(
        %event,
        variables = notification.variables.len(),
        received_at = %notification.received_at.to_rfc3339(),
        "phone event received"
    );

    let rules = ctx.rules.snapshot();
    if let Some(rule) = rules.get(event) {
        let url = template::resolve(&rule.url_template, &notification.variables);
        if url.trim().is_empty() {
            debug!(%event, "no action url configured, skipping");
        } else {
            let kind = if rule.open_in_browser {
                ActionKind::OpenBrowser
            } else {
                ActionKind::HttpGet
            };
            ctx.queue.submit(DispatchJob { event, url, kind });
        }
    }

    (StatusCode::OK, "OK").into_response()
}

async fn health_handler(State(ctx): State<CallbackContext>) -> Response {
    Json(serde_json::json!({
        "status": "running",
        "uptime": ctx.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "rules": ctx.rules.snapshot().len(),
    }))
    .into_response()
}
