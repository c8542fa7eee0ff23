use crate::callback::{
    ActionDispatcher, ActionRules, ActionSink, CallbackServer, ListeningServer, RuleStore,
    ServerState, SystemActionSink,
};
use crate::config::{Config, PhoneConfig};
use crate::error::{Error, Result};
use crate::keyevent::{self, DialRequest};
use crate::net_tool;
use crate::phone::{ActionUrlProvisioner, Credentials, PhoneControlClient, ProvisionReport};
use crate::port_allocator::{PortAllocator, PortBinding};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The four operations offered to the desktop shell and to batch mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Dial(String),
    KeyEvent(DialRequest),
    Hangup(Option<u8>),
    HangupAll,
}

impl Command {
    /// Batch surface: `dial <number>`, `keyevent <sequence>`, `hangup [line]`
    /// and `hangup_all`.
    pub fn parse(command: &str, parameter: Option<&str>) -> Result<Self> {
        let parameter = parameter.map(str::trim).filter(|p| !p.is_empty());
        match (command, parameter) {
            ("dial", Some(number)) => Ok(Command::Dial(number.to_string())),
            ("keyevent", Some(sequence)) => Ok(Command::KeyEvent(DialRequest::raw(sequence))),
            ("hangup", None) => Ok(Command::Hangup(None)),
            ("hangup", Some(line)) => line
                .parse()
                .map(|line| Command::Hangup(Some(line)))
                .map_err(|_| Error::InvalidCommand(format!("invalid line number: {}", line))),
            ("hangup_all", None) => Ok(Command::HangupAll),
            ("dial" | "keyevent", None) => Err(Error::InvalidCommand(format!(
                "{} requires a parameter",
                command
            ))),
            ("hangup_all", Some(_)) => Err(Error::InvalidCommand(
                "hangup_all takes no parameter".to_string(),
            )),
            (other, _) => Err(Error::InvalidCommand(format!(
                "unknown command: {} (expected dial, keyevent, hangup or hangup_all)",
                other
            ))),
        }
    }

    /// Dial box input: with the modifier held the text is a raw key-event
    /// program, otherwise it is keyed in character by character.
    pub fn from_dial_input(text: &str, modifier_held: bool) -> Self {
        if modifier_held {
            Command::KeyEvent(DialRequest::raw(text))
        } else {
            Command::KeyEvent(DialRequest::immediate(text))
        }
    }
}

pub struct PhoneBridge {
    phone: PhoneControlClient,
    credentials: Credentials,
}

impl PhoneBridge {
    pub fn new(config: &PhoneConfig) -> Result<Self> {
        Ok(Self {
            phone: PhoneControlClient::new(config)?,
            credentials: config.credentials(),
        })
    }

    pub async fn execute(&self, command: &Command) -> Result<()> {
        let credentials = self.credentials.clone();
        info!(?command, host = %credentials.host, "executing phone command");
        match command {
            Command::Dial(number) => self.phone.dial_number(&credentials, number).await,
            Command::KeyEvent(request) => {
                // Compile fully before the first request so a bad program
                // sends nothing.
                let tokens = keyevent::compile(request)?;
                self.phone.dial(&credentials, &tokens).await
            }
            Command::Hangup(line) => self.phone.hangup(&credentials, *line).await,
            Command::HangupAll => self.phone.hangup_all(&credentials).await,
        }
    }

    pub async fn test_connection(&self) -> Result<()> {
        let credentials = self.credentials.clone();
        self.phone.test_connection(&credentials).await
    }

    pub async fn provision(&self, callback_base: &str) -> ProvisionReport {
        let credentials = self.credentials.clone();
        ActionUrlProvisioner::new(&self.phone)
            .provision(&credentials, callback_base)
            .await
    }
}

type ControlJob = (Command, oneshot::Sender<Result<()>>);

/// Runs phone commands off the caller's thread, one at a time, in the order
/// they were submitted.
#[derive(Clone)]
pub struct ControlWorker {
    sender: mpsc::UnboundedSender<ControlJob>,
}

impl ControlWorker {
    pub fn spawn(bridge: Arc<PhoneBridge>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ControlJob>();
        tokio::spawn(async move {
            while let Some((command, reply)) = receiver.recv().await {
                let result = bridge.execute(&command).await;
                if let Err(ref e) = result {
                    warn!(?command, "phone command failed: {}", e);
                }
                let _ = reply.send(result);
            }
        });
        Self { sender }
    }

    /// The receiver resolves once the command finished; dropping it does not
    /// cancel the command.
    pub fn submit(&self, command: Command) -> oneshot::Receiver<Result<()>> {
        let (reply, receiver) = oneshot::channel();
        if let Err(mpsc::error::SendError((command, reply))) = self.sender.send((command, reply)) {
            warn!(?command, "control worker stopped");
            let _ = reply.send(Err(Error::InvalidCommand(
                "control worker stopped".to_string(),
            )));
        }
        receiver
    }
}

pub struct AppBuilder {
    config: Config,
    config_path: Option<PathBuf>,
    sink: Option<Arc<dyn ActionSink>>,
    token: Option<CancellationToken>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            config_path: None,
            sink: None,
            token: None,
        }
    }

    /// Where a changed callback port gets written back.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_action_sink(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Port allocation, callback server, then Action URL provisioning, in
    /// that order.
    pub async fn start(self) -> anyhow::Result<RunningApp> {
        let mut config = self.config;
        let token = self.token.unwrap_or_default();

        let bind_ip: IpAddr = config
            .callback
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid callback.bind_addr: {}", e))?;
        let allocator = PortAllocator::new(bind_ip, config.callback.max_port_attempts);
        let (listener, binding) = allocator.allocate(config.callback.port).await?;

        if binding.changed() {
            config.callback.port = binding.bound_port;
            if let Some(ref path) = self.config_path {
                match config.save(path) {
                    Ok(()) => info!(
                        port = binding.bound_port,
                        path = %path.display(),
                        "persisted callback port"
                    ),
                    Err(e) => warn!("failed to persist callback port: {}", e),
                }
            }
        }

        let sink = self.sink.unwrap_or_else(|| {
            Arc::new(SystemActionSink::new(Duration::from_millis(
                config.callback.action_timeout_ms,
            )))
        });
        let (queue, dispatcher) = ActionDispatcher::new(
            sink,
            config.callback.dispatch_workers,
            config.callback.dispatch_queue,
            token.child_token(),
        );
        let dispatcher = tokio::spawn(dispatcher.serve());

        let rules = RuleStore::new(ActionRules::from_config(&config.actions));
        let server =
            CallbackServer::new(rules.clone(), queue).listen(listener, token.child_token())?;

        let bridge = PhoneBridge::new(&config.phone)?;
        let mut callback_base = None;
        let mut report = None;
        if config.callback.provision {
            match net_tool::advertise_host(
                config.callback.advertise_host.as_deref(),
                &config.phone.host,
            )
            .await
            {
                Ok(host) => {
                    let base = format!("http://{}:{}", host, binding.bound_port);
                    let result = bridge.provision(&base).await;
                    for failure in result.failures() {
                        warn!("{}", failure);
                    }
                    callback_base = Some(base);
                    report = Some(result);
                }
                Err(e) => warn!("cannot determine callback host, skipping provisioning: {}", e),
            }
        }

        Ok(RunningApp {
            config,
            binding,
            callback_base,
            report,
            rules,
            bridge: Arc::new(bridge),
            server,
            dispatcher,
            token,
        })
    }
}

pub struct RunningApp {
    pub config: Config,
    pub binding: PortBinding,
    pub callback_base: Option<String>,
    pub report: Option<ProvisionReport>,
    pub rules: RuleStore,
    pub bridge: Arc<PhoneBridge>,
    server: ListeningServer,
    dispatcher: JoinHandle<()>,
    token: CancellationToken,
}

impl RunningApp {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn state(&self) -> ServerState {
        self.server.state()
    }

    pub fn reload_rules(&self, config: &Config) {
        let rules = ActionRules::from_config(&config.actions);
        info!(rules = rules.len(), "reloaded action rules");
        self.rules.replace(rules);
    }

    pub async fn stop(self) -> anyhow::Result<ServerState> {
        self.token.cancel();
        self.wait().await
    }

    pub async fn wait(self) -> anyhow::Result<ServerState> {
        let state = self.server.wait().await?;
        self.token.cancel();
        let _ = self.dispatcher.await;
        Ok(state)
    }
}
