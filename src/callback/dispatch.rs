use crate::event::PhoneEvent;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    HttpGet,
    OpenBrowser,
}

#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub event: PhoneEvent,
    pub url: String,
    pub kind: ActionKind,
}

/// Side effect of a resolved action rule.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn http_get(&self, url: &str) -> Result<()>;
    async fn open_browser(&self, url: &str) -> Result<()>;
}

pub struct SystemActionSink {
    client: reqwest::Client,
    timeout: Duration,
}

impl SystemActionSink {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(crate::version::get_useragent())
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }
}

#[async_trait]
impl ActionSink for SystemActionSink {
    async fn http_get(&self, url: &str) -> Result<()> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("{} returned {}", url, response.status()));
        }
        Ok(())
    }

    async fn open_browser(&self, url: &str) -> Result<()> {
        let mut command = browser_command(url);
        let status = tokio::time::timeout(self.timeout, command.status())
            .await
            .map_err(|_| anyhow!("browser launcher timed out"))??;
        if !status.success() {
            return Err(anyhow!("browser launcher exited with {}", status));
        }
        Ok(())
    }
}

#[cfg(target_os = "windows")]
fn browser_command(url: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("rundll32");
    cmd.arg("url.dll,FileProtocolHandler").arg(url);
    cmd
}

#[cfg(target_os = "macos")]
fn browser_command(url: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn browser_command(url: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("xdg-open");
    cmd.arg(url);
    cmd
}

/// Sending half handed to request handlers. Never waits.
#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<DispatchJob>,
}

impl DispatchQueue {
    pub fn submit(&self, job: DispatchJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(event = %job.event, url = %job.url, "dispatch queue full, dropping action");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(event = %job.event, url = %job.url, "dispatcher stopped, dropping action");
                false
            }
        }
    }
}

pub struct ActionDispatcher {
    receiver: mpsc::Receiver<DispatchJob>,
    sink: Arc<dyn ActionSink>,
    permits: Arc<Semaphore>,
    token: CancellationToken,
}

impl ActionDispatcher {
    pub fn new(
        sink: Arc<dyn ActionSink>,
        workers: usize,
        queue_depth: usize,
        token: CancellationToken,
    ) -> (DispatchQueue, Self) {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let dispatcher = Self {
            receiver,
            sink,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            token,
        };
        (DispatchQueue { sender }, dispatcher)
    }

    pub async fn serve(mut self) {
        let token = self.token.clone();
        select! {
            _ = token.cancelled() => {
                info!("action dispatcher cancelled");
            }
            _ = self.recv_loop() => {
                info!("action dispatcher queue closed");
            }
        }
    }

    async fn recv_loop(&mut self) {
        while let Some(job) = self.receiver.recv().await {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let sink = self.sink.clone();
            let token = self.token.clone();
            tokio::spawn(async move {
                let _permit = permit;
                select! {
                    _ = token.cancelled() => {}
                    _ = run_job(sink.as_ref(), job) => {}
                }
            });
        }
    }
}

async fn run_job(sink: &dyn ActionSink, job: DispatchJob) {
    if let Err(e) = url::Url::parse(&job.url) {
        warn!(event = %job.event, url = %job.url, "skipping action with invalid url: {}", e);
        return;
    }
    let start = Instant::now();
    let result = match job.kind {
        ActionKind::HttpGet => sink.http_get(&job.url).await,
        ActionKind::OpenBrowser => sink.open_browser(&job.url).await,
    };
    match result {
        Ok(()) => debug!(
            event = %job.event,
            url = %job.url,
            kind = ?job.kind,
            elapsed_ms = start.elapsed().as_millis(),
            "action dispatched"
        ),
        Err(e) => warn!(
            event = %job.event,
            url = %job.url,
            kind = ?job.kind,
            elapsed_ms = start.elapsed().as_millis(),
            "action failed: {}",
            e
        ),
    }
}
