use super::*;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Dispatched {
    kind: ActionKind,
    url: String,
}

/// Records every action. A GET whose url contains `hold` waits until a
/// GET containing `release` has been recorded.
struct RecordingSink {
    tx: mpsc::UnboundedSender<Dispatched>,
    release: Notify,
}

impl RecordingSink {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Dispatched>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                release: Notify::new(),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ActionSink for RecordingSink {
    async fn http_get(&self, url: &str) -> anyhow::Result<()> {
        if url.contains("hold") {
            tokio::time::timeout(Duration::from_secs(5), self.release.notified())
                .await
                .map_err(|_| anyhow::anyhow!("never released"))?;
        }
        let _ = self.tx.send(Dispatched {
            kind: ActionKind::HttpGet,
            url: url.to_string(),
        });
        if url.contains("release") {
            self.release.notify_one();
        }
        Ok(())
    }

    async fn open_browser(&self, url: &str) -> anyhow::Result<()> {
        let _ = self.tx.send(Dispatched {
            kind: ActionKind::OpenBrowser,
            url: url.to_string(),
        });
        Ok(())
    }
}

fn rule(event: PhoneEvent, url: &str, browser: bool) -> ActionRule {
    ActionRule {
        event,
        url_template: url.to_string(),
        open_in_browser: browser,
    }
}

async fn start(
    rules: RuleStore,
    sink: Arc<dyn ActionSink>,
) -> (ListeningServer, CancellationToken) {
    let token = CancellationToken::new();
    let (queue, dispatcher) = ActionDispatcher::new(sink, 4, 16, token.child_token());
    tokio::spawn(dispatcher.serve());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = CallbackServer::new(rules, queue)
        .listen(listener, token.child_token())
        .unwrap();
    (server, token)
}

async fn get(server: &ListeningServer, path_and_query: &str) -> reqwest::StatusCode {
    reqwest::get(format!("http://{}{}", server.local_addr(), path_and_query))
        .await
        .unwrap()
        .status()
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Dispatched>) -> Dispatched {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("dispatch timed out")
        .expect("sink dropped")
}

#[tokio::test]
async fn test_event_resolves_and_dispatches_get() {
    let (sink, mut rx) = RecordingSink::new();
    let rules = RuleStore::new(ActionRules::new([rule(
        PhoneEvent::Incoming,
        "http://crm.local/search?num={remote}&name={display_remote}&x={foo}",
        false,
    )]));
    let (server, _token) = start(rules, sink).await;

    let status = get(
        &server,
        "/snom/incoming?remote=+49301234&display_remote=Jane%20Doe&call_id=$call_id",
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::OK);

    assert_eq!(
        next(&mut rx).await,
        Dispatched {
            kind: ActionKind::HttpGet,
            url: "http://crm.local/search?num=%2B49301234&name=Jane%20Doe&x=".to_string(),
        }
    );
}

#[tokio::test]
async fn test_browser_rule_opens_browser() {
    let (sink, mut rx) = RecordingSink::new();
    let rules = RuleStore::new(ActionRules::new([rule(
        PhoneEvent::Connected,
        "https://crm.local/call/{call_id}",
        true,
    )]));
    let (server, _token) = start(rules, sink).await;

    assert_eq!(
        get(&server, "/snom/connected?call_id=abc").await,
        reqwest::StatusCode::OK
    );
    let dispatched = next(&mut rx).await;
    assert_eq!(dispatched.kind, ActionKind::OpenBrowser);
    assert_eq!(dispatched.url, "https://crm.local/call/abc");
}

#[tokio::test]
async fn test_empty_template_and_missing_rule_dispatch_nothing() {
    let (sink, mut rx) = RecordingSink::new();
    let rules = RuleStore::new(ActionRules::new([
        rule(PhoneEvent::Onhook, "", false),
        rule(PhoneEvent::Offhook, "{local}", true),
    ]));
    let (server, _token) = start(rules, sink).await;

    for path in ["/snom/onhook", "/snom/offhook", "/snom/outgoing?remote=1"] {
        assert_eq!(get(&server, path).await, reqwest::StatusCode::OK);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_overlapping_events_are_independent() {
    let (sink, mut rx) = RecordingSink::new();
    let rules = RuleStore::new(ActionRules::new([
        rule(PhoneEvent::Incoming, "http://crm.local/hold?n={remote}", false),
        rule(PhoneEvent::Connected, "http://crm.local/release?n={remote}", false),
    ]));
    let (server, _token) = start(rules, sink).await;

    // The incoming action is still blocked when connected arrives, yet both
    // callbacks are acknowledged right away.
    assert_eq!(
        get(&server, "/snom/incoming?remote=100").await,
        reqwest::StatusCode::OK
    );
    assert_eq!(
        get(&server, "/snom/connected?remote=100").await,
        reqwest::StatusCode::OK
    );

    let first = next(&mut rx).await;
    let second = next(&mut rx).await;
    assert_eq!(first.url, "http://crm.local/release?n=100");
    assert_eq!(second.url, "http://crm.local/hold?n=100");
}

#[tokio::test]
async fn test_invalid_resolved_url_is_dropped() {
    let (sink, mut rx) = RecordingSink::new();
    let rules = RuleStore::new(ActionRules::new([rule(
        PhoneEvent::Disconnected,
        "not a url {remote}",
        false,
    )]));
    let (server, _token) = start(rules, sink).await;

    assert_eq!(
        get(&server, "/snom/disconnected?remote=1").await,
        reqwest::StatusCode::OK
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_rule_reload_is_visible() {
    let (sink, mut rx) = RecordingSink::new();
    let rules = RuleStore::new(ActionRules::default());
    let (server, _token) = start(rules.clone(), sink).await;

    get(&server, "/snom/incoming?remote=1").await;
    rules.replace(ActionRules::new([rule(
        PhoneEvent::Incoming,
        "http://crm.local/?n={remote}",
        false,
    )]));
    get(&server, "/snom/incoming?remote=2").await;

    assert_eq!(next(&mut rx).await.url, "http://crm.local/?n=2");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_server_state_and_health() {
    let (sink, _rx) = RecordingSink::new();
    let (server, _token) = start(RuleStore::default(), sink).await;
    assert_eq!(server.state(), ServerState::Listening);

    let health: serde_json::Value =
        reqwest::get(format!("http://{}/health", server.local_addr()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(health["status"], "running");
    assert_eq!(health["rules"], 0);

    let addr = server.local_addr();
    assert_eq!(server.stop().await.unwrap(), ServerState::Stopped);
    assert!(reqwest::get(format!("http://{}/health", addr)).await.is_err());
}

#[test]
fn test_parse_query_keeps_plus() {
    let query = parse_query("remote=+4930&display_remote=J%C3%BCrgen&flag&=x");
    assert_eq!(query["remote"], "+4930");
    assert_eq!(query["display_remote"], "Jürgen");
    assert_eq!(query["flag"], "");
}

#[test]
fn test_rules_from_config_skip_unknown_events() {
    let mut actions = HashMap::new();
    actions.insert(
        "incoming".to_string(),
        ActionRuleConfig {
            url: "http://x/{remote}".to_string(),
            browser: true,
        },
    );
    actions.insert("ringing".to_string(), ActionRuleConfig::default());

    let rules = ActionRules::from_config(&actions);
    assert_eq!(rules.len(), 1);
    assert!(rules.get(PhoneEvent::Incoming).unwrap().open_in_browser);
}
