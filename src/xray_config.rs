//! The Xray configuration document
//!
//! Only the `inbounds` array is modelled; every other top-level section is
//! carried through as opaque JSON so templates can use any Xray feature.
//! Equality is structural, which is what the supervisor relies on to detect
//! that a restart would be a no-op.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tag of the inbound that exposes the stats API
pub const API_TAG: &str = "api";

/// A complete Xray configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XrayConfig {
    /// Inbound listeners, template entries first, then generated fragments
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,

    /// Every other top-level section (log, api, routing, outbounds, ...)
    #[serde(flatten)]
    pub sections: Map<String, Value>,
}

impl XrayConfig {
    /// Parse a template or config file
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Serialize in the pretty form written to disk for the binary
    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Port of the inbound tagged "api", or 0 when there is none
    pub fn api_port(&self) -> u16 {
        self.inbounds
            .iter()
            .find(|inbound| inbound.tag == API_TAG)
            .map(|inbound| inbound.port)
            .unwrap_or(0)
    }
}

/// One inbound entry of the document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<Value>,

    #[serde(default)]
    pub port: u16,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,

    #[serde(
        default,
        rename = "streamSettings",
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,

    /// Keys this model does not know about, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundConfig {
    /// A bare inbound with only a tag and port
    pub fn new(tag: &str, port: u16) -> Self {
        Self {
            tag: tag.to_string(),
            port,
            ..Default::default()
        }
    }
}
