//! PMD wire protocol
//!
//! Requests are short ASCII strings addressed to axis `X`; replies echo the
//! request head, a colon and the payload (`X0E:-1234`). A trailing `!` marks
//! a request the controller refused.

use crate::{PmdError, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Requests understood by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `X0E`: read encoder position
    ReadEncoder,
    /// `X0U4`: read the four status columns
    ReadStatus,
    /// `X0T<n>`: move to absolute encoder count
    MoveTo(i64),
    /// `XY8=<n>`: waveform step rate parameter
    StepRateParameter(u32),
    /// `XH=<n>`: step rate used by open-loop moves
    StepRate(u32),
    /// `X0S`
    Stop,
    /// `XM4`
    Park,
    /// `XM2`
    Unpark,
    /// `XJ<n>` forwards, `XJ=-<n>` backwards
    Jog(i64),
    /// `XY2=2`: external limit input stops the motor instead of faulting
    SwitchExtLimit,
    /// Anything else, sent verbatim
    Raw(String),
}

impl Request {
    pub fn to_wire(&self) -> String {
        match self {
            Request::ReadEncoder => "X0E".to_string(),
            Request::ReadStatus => "X0U4".to_string(),
            Request::MoveTo(counts) => format!("X0T{}", counts),
            Request::StepRateParameter(rate) => format!("XY8={}", rate),
            Request::StepRate(rate) => format!("XH={}", rate),
            Request::Stop => "X0S".to_string(),
            Request::Park => "XM4".to_string(),
            Request::Unpark => "XM2".to_string(),
            Request::Jog(steps) if *steps < 0 => format!("XJ=-{}", steps.unsigned_abs()),
            Request::Jog(steps) => format!("XJ{}", steps),
            Request::SwitchExtLimit => "XY2=2".to_string(),
            Request::Raw(text) => text.clone(),
        }
    }

    /// Requests that start the motor moving
    pub fn commands_motion(&self) -> bool {
        matches!(self, Request::MoveTo(_) | Request::Jog(_))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// `<head>:<payload>`, split on the first colon
static REPLY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([^:]*):\s*(.*?)\s*$").expect("Invalid reply regex"));

/// True when the controller refused the request
pub fn is_rejected(reply: &str) -> bool {
    reply.trim_end().ends_with('!')
}

/// The segment after the first colon, trimmed
pub fn reply_payload(reply: &str) -> Result<&str> {
    REPLY_PATTERN
        .captures(reply)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str())
        .ok_or_else(|| PmdError::Decode(format!("reply '{}' has no payload", reply.trim())))
}

/// Encoder count from an `X0E` reply
pub fn parse_encoder_position(reply: &str) -> Result<i64> {
    let payload = reply_payload(reply)?;
    payload
        .parse::<i64>()
        .map_err(|e| PmdError::Decode(format!("encoder payload '{}': {}", payload, e)))
}

/// Raw status payload from an `X0U4` reply
pub fn parse_status_payload(reply: &str) -> Result<String> {
    let payload = reply_payload(reply)?;
    if payload.is_empty() {
        return Err(PmdError::Decode(format!("empty status in reply '{}'", reply.trim())));
    }
    Ok(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_forms() {
        assert_eq!(Request::ReadEncoder.to_wire(), "X0E");
        assert_eq!(Request::ReadStatus.to_wire(), "X0U4");
        assert_eq!(Request::MoveTo(-1500).to_wire(), "X0T-1500");
        assert_eq!(Request::StepRateParameter(972).to_wire(), "XY8=972");
        assert_eq!(Request::StepRate(972).to_wire(), "XH=972");
        assert_eq!(Request::Jog(32).to_wire(), "XJ32");
        assert_eq!(Request::Jog(-32).to_wire(), "XJ=-32");
        assert_eq!(Request::SwitchExtLimit.to_wire(), "XY2=2");
        assert_eq!(Request::Raw("XY11".into()).to_string(), "XY11");
    }

    #[test]
    fn test_encoder_reply_parsing() {
        assert_eq!(parse_encoder_position("X0E:12345").unwrap(), 12345);
        assert_eq!(parse_encoder_position("X0E: -77 \r").unwrap(), -77);
        assert!(matches!(parse_encoder_position("X0E:abc"), Err(PmdError::Decode(_))));
        assert!(matches!(parse_encoder_position("garbage"), Err(PmdError::Decode(_))));
    }

    #[test]
    fn test_status_reply_parsing() {
        assert_eq!(parse_status_payload("X0U4:0021,0000").unwrap(), "0021,0000");
        assert!(parse_status_payload("X0U4:").is_err());
        // Only the first colon splits
        assert_eq!(reply_payload("a:b:c").unwrap(), "b:c");
    }

    #[test]
    fn test_reply_pattern_compiles_and_trims() {
        assert_eq!(reply_payload("  X0U4:  0021  ").unwrap(), "0021");
        assert_eq!(reply_payload("XM4:").unwrap(), "");
    }

    #[test]
    fn test_rejection_marker() {
        assert!(is_rejected("X0T100!"));
        assert!(is_rejected("X0T100:!\r\n"));
        assert!(!is_rejected("X0E:100"));
        assert!(!is_rejected(""));
    }
}
