//! Session descriptions and ICE candidates

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RtcError, RtcErrorDetail, RtcErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    PrAnswer,
    Answer,
    Rollback,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::PrAnswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = RtcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "pranswer" => Ok(SdpType::PrAnswer),
            "answer" => Ok(SdpType::Answer),
            "rollback" => Ok(SdpType::Rollback),
            other => Err(RtcError::invalid_parameter(format!("unknown sdp type: {other}"))),
        }
    }
}

fn sdp_syntax_error(message: impl Into<String>) -> RtcError {
    RtcError::new(RtcErrorKind::SyntaxError, message).with_detail(RtcErrorDetail::SdpSyntaxError)
}

/// Typed SDP blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    sdp_type: SdpType,
    sdp: String,
}

impl SessionDescription {
    /// Build a description, checking that the SDP at least looks like one.
    /// Rollbacks carry no SDP and accept anything.
    pub fn parse(sdp_type: SdpType, sdp: impl Into<String>) -> Result<Self, RtcError> {
        let sdp = sdp.into();
        if sdp_type != SdpType::Rollback && !sdp.starts_with("v=") {
            return Err(sdp_syntax_error(format!(
                "{sdp_type} does not start with a version line"
            )));
        }
        Ok(Self { sdp_type, sdp })
    }

    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }

    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// Values of every `a=<name>:` attribute line
    pub fn attributes<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.sdp.lines().filter_map(move |line| {
            line.trim_end_matches('\r')
                .strip_prefix("a=")
                .and_then(|attr| attr.strip_prefix(name))
                .and_then(|rest| rest.strip_prefix(':'))
        })
    }

    /// Media sections (`m=` lines) in order
    pub fn media_sections(&self) -> impl Iterator<Item = &str> {
        self.sdp
            .lines()
            .filter_map(|line| line.trim_end_matches('\r').strip_prefix("m="))
    }
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    sdp_mid: String,
    sdp_mline_index: i32,
    candidate: String,
}

impl IceCandidate {
    /// Accepts `candidate:...` with or without the `a=` attribute prefix
    pub fn parse(
        sdp_mid: impl Into<String>,
        sdp_mline_index: i32,
        candidate: &str,
    ) -> Result<Self, RtcError> {
        let candidate = candidate.trim().strip_prefix("a=").unwrap_or(candidate.trim());
        let Some(body) = candidate.strip_prefix("candidate:") else {
            return Err(sdp_syntax_error(format!("not an ICE candidate: {candidate}")));
        };
        // foundation component transport priority address port "typ" type
        if body.split_whitespace().count() < 8 {
            return Err(sdp_syntax_error(format!("truncated ICE candidate: {candidate}")));
        }
        if sdp_mline_index < 0 {
            return Err(RtcError::new(
                RtcErrorKind::InvalidRange,
                format!("negative sdp_mline_index: {sdp_mline_index}"),
            ));
        }
        Ok(Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            candidate: candidate.to_string(),
        })
    }

    pub fn sdp_mid(&self) -> &str {
        &self.sdp_mid
    }

    pub fn sdp_mline_index(&self) -> i32 {
        self.sdp_mline_index
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n";

    #[test]
    fn test_parse_rejects_garbage() {
        let err = SessionDescription::parse(SdpType::Offer, "hello").unwrap_err();
        assert_eq!(err.kind(), RtcErrorKind::SyntaxError);
        assert_eq!(err.detail(), RtcErrorDetail::SdpSyntaxError);

        assert!(SessionDescription::parse(SdpType::Rollback, "").is_ok());
    }

    #[test]
    fn test_attributes_and_media() {
        let desc = SessionDescription::parse(SdpType::Offer, OFFER).unwrap();
        assert_eq!(desc.attributes("mid").collect::<Vec<_>>(), vec!["0"]);
        assert_eq!(desc.attributes("group").collect::<Vec<_>>(), vec!["BUNDLE 0"]);
        assert_eq!(desc.media_sections().count(), 1);
    }

    #[test]
    fn test_sdp_type_strings() {
        for ty in [SdpType::Offer, SdpType::PrAnswer, SdpType::Answer, SdpType::Rollback] {
            assert_eq!(ty.as_str().parse::<SdpType>().unwrap(), ty);
        }
        assert!("bogus".parse::<SdpType>().is_err());
    }

    #[test]
    fn test_ice_candidate_parse() {
        let line = "a=candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host";
        let candidate = IceCandidate::parse("0", 0, line).unwrap();
        assert_eq!(
            candidate.candidate(),
            "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host"
        );
        assert_eq!(candidate.sdp_mid(), "0");

        assert!(IceCandidate::parse("0", 0, "candidate:1 1 udp").is_err());
        assert!(IceCandidate::parse("0", 0, "v=0").is_err());
        assert_eq!(
            IceCandidate::parse("0", -1, line.trim_start_matches("a="))
                .unwrap_err()
                .kind(),
            RtcErrorKind::InvalidRange
        );
    }
}
