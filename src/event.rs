use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Call-state events the phone reports through its Action URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneEvent {
    Incoming,
    Outgoing,
    Connected,
    Disconnected,
    Onhook,
    Offhook,
}

impl PhoneEvent {
    pub const ALL: [PhoneEvent; 6] = [
        PhoneEvent::Incoming,
        PhoneEvent::Outgoing,
        PhoneEvent::Connected,
        PhoneEvent::Disconnected,
        PhoneEvent::Onhook,
        PhoneEvent::Offhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhoneEvent::Incoming => "incoming",
            PhoneEvent::Outgoing => "outgoing",
            PhoneEvent::Connected => "connected",
            PhoneEvent::Disconnected => "disconnected",
            PhoneEvent::Onhook => "onhook",
            PhoneEvent::Offhook => "offhook",
        }
    }

    /// Route served by the callback server for this event.
    pub fn path(&self) -> String {
        format!("/snom/{}", self.as_str())
    }

    /// Full Action URL handed to the phone. Every placeholder is requested
    /// as a `$variable` so the phone fills in whatever it knows.
    pub fn action_url(&self, callback_base: &str) -> String {
        let query = Placeholder::ALL
            .iter()
            .map(|p| format!("{}=${}", p.name(), p.name()))
            .collect::<Vec<_>>()
            .join("&");
        format!(
            "{}{}?{}",
            callback_base.trim_end_matches('/'),
            self.path(),
            query
        )
    }
}

impl fmt::Display for PhoneEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhoneEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhoneEvent::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown phone event: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    Remote,
    DisplayRemote,
    Local,
    CallId,
    DisplayLocal,
    ActiveUrl,
    ActiveUser,
    ActiveHost,
    CstaId,
    ExpansionModule,
    ActiveKey,
    PhoneIp,
    LocalIp,
    NrOngoingCalls,
    ContextUrl,
    CancelReason,
    LongpressKey,
    Timestamp,
}

impl Placeholder {
    pub const ALL: [Placeholder; 18] = [
        Placeholder::Remote,
        Placeholder::DisplayRemote,
        Placeholder::Local,
        Placeholder::CallId,
        Placeholder::DisplayLocal,
        Placeholder::ActiveUrl,
        Placeholder::ActiveUser,
        Placeholder::ActiveHost,
        Placeholder::CstaId,
        Placeholder::ExpansionModule,
        Placeholder::ActiveKey,
        Placeholder::PhoneIp,
        Placeholder::LocalIp,
        Placeholder::NrOngoingCalls,
        Placeholder::ContextUrl,
        Placeholder::CancelReason,
        Placeholder::LongpressKey,
        Placeholder::Timestamp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Placeholder::Remote => "remote",
            Placeholder::DisplayRemote => "display_remote",
            Placeholder::Local => "local",
            Placeholder::CallId => "call_id",
            Placeholder::DisplayLocal => "display_local",
            Placeholder::ActiveUrl => "active_url",
            Placeholder::ActiveUser => "active_user",
            Placeholder::ActiveHost => "active_host",
            Placeholder::CstaId => "csta_id",
            Placeholder::ExpansionModule => "expansion_module",
            Placeholder::ActiveKey => "active_key",
            Placeholder::PhoneIp => "phone_ip",
            Placeholder::LocalIp => "local_ip",
            Placeholder::NrOngoingCalls => "nr_ongoing_calls",
            Placeholder::ContextUrl => "context_url",
            Placeholder::CancelReason => "cancel_reason",
            Placeholder::LongpressKey => "longpress_key",
            Placeholder::Timestamp => "timestamp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Placeholder::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// Variables reported by the phone for a single callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventVariables {
    values: HashMap<Placeholder, String>,
}

impl EventVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps only recognised names. A value the phone left as its own
    /// `$name` marker means the variable was not available.
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let values = query
            .iter()
            .filter_map(|(name, value)| {
                let placeholder = Placeholder::from_name(name)?;
                if value.strip_prefix('$') == Some(name.as_str()) {
                    return None;
                }
                Some((placeholder, value.clone()))
            })
            .collect();
        Self { values }
    }

    pub fn with(mut self, placeholder: Placeholder, value: impl Into<String>) -> Self {
        self.values.insert(placeholder, value.into());
        self
    }

    pub fn get(&self, placeholder: Placeholder) -> Option<&str> {
        self.values.get(&placeholder).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EventNotification {
    pub event: PhoneEvent,
    pub variables: EventVariables,
    pub received_at: DateTime<Utc>,
}

impl EventNotification {
    pub fn new(event: PhoneEvent, variables: EventVariables) -> Self {
        Self {
            event,
            variables,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_paths() {
        let paths: Vec<String> = PhoneEvent::ALL.iter().map(|e| e.path()).collect();
        assert_eq!(
            paths,
            vec![
                "/snom/incoming",
                "/snom/outgoing",
                "/snom/connected",
                "/snom/disconnected",
                "/snom/onhook",
                "/snom/offhook"
            ]
        );
        assert_eq!("Connected".parse::<PhoneEvent>(), Ok(PhoneEvent::Connected));
        assert!("ringing".parse::<PhoneEvent>().is_err());
    }

    #[test]
    fn test_action_url_requests_every_variable() {
        let url = PhoneEvent::Incoming.action_url("http://10.0.0.5:18080/");
        assert!(url.starts_with("http://10.0.0.5:18080/snom/incoming?remote=$remote&"));
        for p in Placeholder::ALL {
            assert!(url.contains(&format!("{}=${}", p.name(), p.name())));
        }
    }

    #[test]
    fn test_variables_from_query() {
        let mut query = HashMap::new();
        query.insert("remote".to_string(), "+49301234".to_string());
        query.insert("display_remote".to_string(), "$display_remote".to_string());
        query.insert("something_else".to_string(), "x".to_string());
        query.insert("call_id".to_string(), "".to_string());

        let vars = EventVariables::from_query(&query);
        assert_eq!(vars.get(Placeholder::Remote), Some("+49301234"));
        assert_eq!(vars.get(Placeholder::DisplayRemote), None);
        assert_eq!(vars.get(Placeholder::CallId), Some(""));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_notification_is_stamped_on_receipt() {
        let before = Utc::now();
        let notification = EventNotification::new(PhoneEvent::Onhook, EventVariables::default());
        assert_eq!(notification.event, PhoneEvent::Onhook);
        assert!(notification.received_at >= before);
        assert!(notification.received_at <= Utc::now());
    }
}
