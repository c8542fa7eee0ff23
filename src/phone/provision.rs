use super::{Credentials, PhoneControlClient};
use crate::error::Error;
use crate::event::PhoneEvent;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct ProvisionOutcome {
    pub event: PhoneEvent,
    pub setting: String,
    pub url: String,
    /// `None` when the phone accepted the setting.
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ProvisionReport {
    pub outcomes: Vec<ProvisionOutcome>,
}

impl ProvisionReport {
    pub fn succeeded(&self) -> impl Iterator<Item = PhoneEvent> + '_ {
        self.outcomes
            .iter()
            .filter(|o| o.error.is_none())
            .map(|o| o.event)
    }

    pub fn failures(&self) -> Vec<Error> {
        self.outcomes
            .iter()
            .filter_map(|o| {
                o.error.as_ref().map(|reason| Error::ProvisioningFailed {
                    event: o.event,
                    reason: reason.clone(),
                })
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.error.is_none())
    }
}

/// Points the phone's Action URL settings at the callback server.
pub struct ActionUrlProvisioner<'a> {
    client: &'a PhoneControlClient,
}

impl<'a> ActionUrlProvisioner<'a> {
    pub fn new(client: &'a PhoneControlClient) -> Self {
        Self { client }
    }

    pub async fn provision(
        &self,
        credentials: &Credentials,
        callback_base: &str,
    ) -> ProvisionReport {
        let requests = PhoneEvent::ALL.into_iter().map(|event| async move {
            let setting = self.client.profile().action_setting(event.as_str());
            let url = event.action_url(callback_base);
            let result = self.client.save_setting(credentials, &setting, &url).await;
            if let Err(ref e) = result {
                warn!(%event, %setting, "failed to provision action url: {}", e);
            }
            ProvisionOutcome {
                event,
                setting,
                url,
                error: result.err().map(|e| e.to_string()),
            }
        });

        let report = ProvisionReport {
            outcomes: join_all(requests).await,
        };
        info!(
            callback_base,
            succeeded = report.succeeded().count(),
            failed = report.outcomes.len() - report.succeeded().count(),
            "action url provisioning finished"
        );
        report
    }
}
