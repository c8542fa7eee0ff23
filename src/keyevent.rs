use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialMode {
    /// Plain phone number, keyed in digit by digit.
    Immediate,
    /// Semicolon-delimited key-event program typed by the user.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub digits: String,
    pub mode: DialMode,
}

impl DialRequest {
    pub fn immediate(digits: impl Into<String>) -> Self {
        Self {
            digits: digits.into(),
            mode: DialMode::Immediate,
        }
    }

    pub fn raw(program: impl Into<String>) -> Self {
        Self {
            digits: program.into(),
            mode: DialMode::Raw,
        }
    }
}

/// One key press sent to the phone. Timing fields left as `None` fall back
/// to the phone's built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEventToken {
    pub key: String,
    pub press_duration_ms: Option<u32>,
    pub inter_key_delay_ms: Option<u32>,
}

impl KeyEventToken {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            press_duration_ms: None,
            inter_key_delay_ms: None,
        }
    }

    pub fn with_press_duration(mut self, ms: u32) -> Self {
        self.press_duration_ms = Some(ms);
        self
    }

    pub fn with_inter_key_delay(mut self, ms: u32) -> Self {
        self.inter_key_delay_ms = Some(ms);
        self
    }

    /// Key plus hold duration, without the inter-key delay. Used when the
    /// client itself waits between requests.
    pub fn press_form(&self) -> String {
        match self.press_duration_ms {
            Some(press) => format!("{},{}", self.key, press),
            None => self.key.clone(),
        }
    }
}

impl fmt::Display for KeyEventToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.press_duration_ms, self.inter_key_delay_ms) {
            (None, None) => write!(f, "{}", self.key),
            (Some(press), None) => write!(f, "{},{}", self.key, press),
            (None, Some(delay)) => write!(f, "{},,{}", self.key, delay),
            (Some(press), Some(delay)) => write!(f, "{},{},{}", self.key, press, delay),
        }
    }
}

/// Renders a sequence back into the phone's `;`-joined key-event syntax.
pub fn render(tokens: &[KeyEventToken]) -> String {
    tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

pub fn compile(request: &DialRequest) -> Result<Vec<KeyEventToken>> {
    let input = request.digits.trim();
    if input.is_empty() {
        return Ok(Vec::new());
    }
    match request.mode {
        DialMode::Immediate => Ok(input
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| KeyEventToken::new(c.to_string()))
            .collect()),
        DialMode::Raw => input
            .split(';')
            .enumerate()
            .map(|(idx, segment)| parse_segment(idx + 1, segment))
            .collect(),
    }
}

fn parse_segment(index: usize, segment: &str) -> Result<KeyEventToken> {
    let segment = segment.trim();
    if segment.is_empty() {
        return Err(Error::malformed(index, segment, "empty segment"));
    }

    let fields: Vec<&str> = segment.split(',').map(str::trim).collect();
    if fields.len() > 3 {
        return Err(Error::malformed(
            index,
            segment,
            "expected KEY[,press_ms[,delay_ms]]",
        ));
    }
    let key = fields[0];
    if key.is_empty() {
        return Err(Error::malformed(index, segment, "missing key name"));
    }

    let mut token = KeyEventToken::new(key);
    token.press_duration_ms = parse_timing(index, segment, fields.get(1).copied())?;
    token.inter_key_delay_ms = parse_timing(index, segment, fields.get(2).copied())?;
    Ok(token)
}

fn parse_timing(index: usize, segment: &str, field: Option<&str>) -> Result<Option<u32>> {
    match field {
        None | Some("") => Ok(None),
        Some(value) => value.parse::<u32>().map(Some).map_err(|_| {
            Error::malformed(index, segment, format!("{:?} is not a millisecond value", value))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_splits_every_digit() {
        let tokens = compile(&DialRequest::immediate("0301234#")).unwrap();
        let keys: Vec<&str> = tokens.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["0", "3", "0", "1", "2", "3", "4", "#"]);
        assert!(tokens
            .iter()
            .all(|t| t.press_duration_ms.is_none() && t.inter_key_delay_ms.is_none()));
    }

    #[test]
    fn test_immediate_ignores_spaces() {
        let tokens = compile(&DialRequest::immediate("030 1234")).unwrap();
        assert_eq!(tokens.len(), 7);
    }

    #[test]
    fn test_raw_dtmf_program() {
        let tokens =
            compile(&DialRequest::raw("9;1;9;6;ENTER,,1000;*,1000,2000;#,,1000;9")).unwrap();
        assert_eq!(tokens.len(), 8);
        let keys: Vec<&str> = tokens[..4].iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["9", "1", "9", "6"]);
        assert_eq!(tokens[4], KeyEventToken::new("ENTER").with_inter_key_delay(1000));
        assert_eq!(
            tokens[5],
            KeyEventToken::new("*")
                .with_press_duration(1000)
                .with_inter_key_delay(2000)
        );
        assert_eq!(tokens[6], KeyEventToken::new("#").with_inter_key_delay(1000));
        assert_eq!(tokens[7], KeyEventToken::new("9"));
    }

    #[test]
    fn test_raw_single_segment_is_one_token() {
        let tokens = compile(&DialRequest::raw("F_REDIAL")).unwrap();
        assert_eq!(tokens, vec![KeyEventToken::new("F_REDIAL")]);
    }

    #[test]
    fn test_raw_press_only() {
        let tokens = compile(&DialRequest::raw("ENTER,500")).unwrap();
        assert_eq!(tokens[0].press_duration_ms, Some(500));
        assert_eq!(tokens[0].inter_key_delay_ms, None);
    }

    #[test]
    fn test_empty_input_is_noop() {
        assert!(compile(&DialRequest::raw("")).unwrap().is_empty());
        assert!(compile(&DialRequest::immediate("  ")).unwrap().is_empty());
    }

    #[test]
    fn test_raw_rejects_empty_segments() {
        for input in [";1;2", "1;2;", "1;;2", ";"] {
            match compile(&DialRequest::raw(input)) {
                Err(Error::MalformedSequence { .. }) => {}
                other => panic!("{:?} should be malformed, got {:?}", input, other),
            }
        }
    }

    #[test]
    fn test_raw_rejects_bad_timing() {
        let err = compile(&DialRequest::raw("1;ENTER,abc")).unwrap_err();
        match err {
            Error::MalformedSequence { segment, .. } => assert_eq!(segment, 2),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(compile(&DialRequest::raw("ENTER,1,2,3")).is_err());
        assert!(compile(&DialRequest::raw(",,100")).is_err());
    }

    #[test]
    fn test_render_matches_phone_syntax() {
        let program = "9;ENTER,,1000;*,1000,2000;#,300";
        let tokens = compile(&DialRequest::raw(program)).unwrap();
        assert_eq!(render(&tokens), program);
        assert_eq!(tokens[2].press_form(), "*,1000");
    }
}
