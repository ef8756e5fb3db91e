// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

//! LEAP message envelopes and body definitions.
//!
//! # Framing
//!
//! Every message is a single JSON object terminated by `\r\n`. Requests
//! carry a `CommuniqueType`, a `Header` with the target `Url` and a
//! `ClientTag`, and an optional `Body`:
//!
//! ```text
//! {"CommuniqueType":"ReadRequest","Header":{"Url":"/area","ClientTag":"6f1c..."}}
//! ```
//!
//! Responses use the same envelope and add a `StatusCode` and
//! `MessageBodyType` to the header. A response echoes the `ClientTag` of the
//! request it answers. Pushes for a subscription echo the tag of the
//! `SubscribeRequest`; pushes with no tag are unsolicited.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{LeapError, Result};

/// Keepalive target.
pub const PING_URL: &str = "/server/1/status/ping";
/// Project descriptor.
pub const PROJECT_URL: &str = "/project";
/// All areas.
pub const AREA_URL: &str = "/area";
/// The controller's own device record.
pub const PROCESSOR_INFO_URL: &str = "/device?where=IsThisDevice:true";
/// Pushed when the controller hears a device it did not know about.
pub const DEVICE_HEARD_URL: &str = "/device/status/deviceheard";

/// `{area}/associatedcontrolstation`
pub fn control_stations_url(area_href: &str) -> String {
    format!("{area_href}/associatedcontrolstation")
}

/// `{device}/buttongroup`
pub fn button_groups_url(device_href: &str) -> String {
    format!("{device_href}/buttongroup")
}

/// `{button}/status/event`
pub fn button_events_url(button_href: &str) -> String {
    format!("{button_href}/status/event")
}

/// Message kinds. Unknown kinds are kept verbatim so they can still be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommuniqueType {
    ReadRequest,
    CreateRequest,
    UpdateRequest,
    SubscribeRequest,
    ReadResponse,
    CreateResponse,
    UpdateResponse,
    SubscribeResponse,
    ExceptionResponse,
    Other(String),
}

impl CommuniqueType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ReadRequest => "ReadRequest",
            Self::CreateRequest => "CreateRequest",
            Self::UpdateRequest => "UpdateRequest",
            Self::SubscribeRequest => "SubscribeRequest",
            Self::ReadResponse => "ReadResponse",
            Self::CreateResponse => "CreateResponse",
            Self::UpdateResponse => "UpdateResponse",
            Self::SubscribeResponse => "SubscribeResponse",
            Self::ExceptionResponse => "ExceptionResponse",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for CommuniqueType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ReadRequest" => Self::ReadRequest,
            "CreateRequest" => Self::CreateRequest,
            "UpdateRequest" => Self::UpdateRequest,
            "SubscribeRequest" => Self::SubscribeRequest,
            "ReadResponse" => Self::ReadResponse,
            "CreateResponse" => Self::CreateResponse,
            "UpdateResponse" => Self::UpdateResponse,
            "SubscribeResponse" => Self::SubscribeResponse,
            "ExceptionResponse" => Self::ExceptionResponse,
            _ => Self::Other(s),
        }
    }
}

impl From<CommuniqueType> for String {
    fn from(c: CommuniqueType) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for CommuniqueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response status such as `200 OK` or `404 Not Found`.
///
/// A status without a leading number is kept verbatim as the message with
/// code 0, which is never a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct StatusCode {
    pub code: u16,
    pub message: String,
}

impl StatusCode {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl From<String> for StatusCode {
    fn from(s: String) -> Self {
        let (code, message) = s.split_once(' ').unwrap_or((s.as_str(), ""));
        match code.parse::<u16>() {
            Ok(code) => Self::new(code, message),
            Err(_) => Self::new(0, s),
        }
    }
}

impl From<StatusCode> for String {
    fn from(s: StatusCode) -> Self {
        s.to_string()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            write!(f, "{}", self.message)
        } else if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.message)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<StatusCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_body_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
}

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    pub communique_type: CommuniqueType,
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Request {
    pub fn new(communique_type: CommuniqueType, url: &str, tag: &str, body: Option<Value>) -> Self {
        Self {
            communique_type,
            header: Header {
                url: Some(url.to_string()),
                client_tag: Some(tag.to_string()),
                ..Header::default()
            },
            body,
        }
    }

    pub fn url(&self) -> &str {
        self.header.url.as_deref().unwrap_or_default()
    }

    pub fn tag(&self) -> Option<&str> {
        self.header.client_tag.as_deref()
    }

    /// Serialize to a single `\r\n`-terminated line.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.extend_from_slice(b"\r\n");
        Ok(line)
    }
}

/// An inbound message: an answer, a subscription push, or an unsolicited update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub communique_type: CommuniqueType,
    #[serde(default)]
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    /// Parse one line received from the controller.
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }

    pub fn url(&self) -> Option<&str> {
        self.header.url.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.header.client_tag.as_deref()
    }

    pub fn message_body_type(&self) -> Option<&str> {
        self.header.message_body_type.as_deref()
    }

    /// Whether the controller reported success. A missing status counts as success.
    pub fn is_success(&self) -> bool {
        self.communique_type != CommuniqueType::ExceptionResponse
            && self.header.status_code.as_ref().is_none_or(StatusCode::is_success)
    }

    /// Turn an exception or error status into `LeapError::Exception`.
    pub fn ensure_success(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self
            .header
            .status_code
            .clone()
            .unwrap_or_else(|| StatusCode::new(500, "Exception"));
        let message = self
            .body
            .as_ref()
            .and_then(|b| serde_json::from_value::<ExceptionDetail>(b.clone()).ok())
            .map(|d| d.message)
            .unwrap_or_default();
        Err(LeapError::Exception { status, message })
    }

    /// Deserialize the body into one of the definition types below.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self.body.as_ref().ok_or_else(|| LeapError::InvalidResponse {
            details: format!("missing body in response to {}", self.url().unwrap_or("?")),
        })?;
        serde_json::from_value(body.clone()).map_err(|e| LeapError::InvalidResponse {
            details: format!(
                "unexpected {} body for {}: {e}",
                self.message_body_type().unwrap_or("untyped"),
                self.url().unwrap_or("?")
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Body definitions
// ---------------------------------------------------------------------------

/// A reference to another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Href {
    pub href: String,
}

impl Href {
    pub fn new(href: impl Into<String>) -> Self {
        Self { href: href.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExceptionDetail {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjectDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub product_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OneProjectDefinition {
    pub project: ProjectDefinition,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AreaDefinition {
    #[serde(rename = "href")]
    pub href: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent: Option<Href>,
    #[serde(default)]
    pub is_leaf: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MultipleAreaDefinition {
    pub areas: Vec<AreaDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControlStationDefinition {
    #[serde(rename = "href")]
    pub href: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub associated_ganged_devices: Option<Vec<GangedDevice>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MultipleControlStationDefinition {
    pub control_stations: Vec<ControlStationDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GangedDevice {
    pub device: Href,
    #[serde(default)]
    pub gang_position: Option<u32>,
}

/// Whether the controller has an address for a device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum AddressedState {
    Addressed,
    Unaddressed,
    #[default]
    Unknown,
}

impl From<String> for AddressedState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Addressed" => Self::Addressed,
            "Unaddressed" => Self::Unaddressed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Firmware {
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FirmwareImage {
    pub firmware: Firmware,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceDefinition {
    #[serde(rename = "href")]
    pub href: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fully_qualified_name: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_serial")]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub button_groups: Vec<Href>,
    #[serde(default)]
    pub addressed_state: AddressedState,
    #[serde(default)]
    pub firmware_image: Option<FirmwareImage>,
}

impl DeviceDefinition {
    pub fn is_addressed(&self) -> bool {
        self.addressed_state == AddressedState::Addressed
    }

    /// Stable identity used to deduplicate accessories. Falls back to the href.
    pub fn identity(&self) -> &str {
        self.serial_number.as_deref().unwrap_or(&self.href)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OneDeviceDefinition {
    pub device: DeviceDefinition,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ButtonGroupDefinition {
    #[serde(rename = "href")]
    pub href: String,
    #[serde(default)]
    pub parent: Option<Href>,
    #[serde(default)]
    pub buttons: Vec<Href>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MultipleButtonGroupDefinition {
    pub button_groups: Vec<ButtonGroupDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Engraving {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ButtonDefinition {
    #[serde(rename = "href")]
    pub href: String,
    #[serde(default)]
    pub name: String,
    pub button_number: u32,
    #[serde(default)]
    pub engraving: Option<Engraving>,
}

impl ButtonDefinition {
    /// Engraved text if present, otherwise the programmed name.
    pub fn label(&self) -> &str {
        self.engraving
            .as_ref()
            .and_then(|e| e.text.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OneButtonDefinition {
    pub button: ButtonDefinition,
}

/// Raw hardware signal reported for one button.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ButtonEventType {
    Press,
    Release,
    Other(String),
}

impl From<String> for ButtonEventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Press" => Self::Press,
            "Release" => Self::Release,
            _ => Self::Other(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ButtonEvent {
    pub event_type: ButtonEventType,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ButtonStatus {
    pub button: Href,
    pub button_event: ButtonEvent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OneButtonStatusEvent {
    pub button_status: ButtonStatus,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceHeard {
    #[serde(default, deserialize_with = "deserialize_serial")]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub device_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceStatus {
    #[serde(default)]
    pub device_heard: Option<DeviceHeard>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OneDeviceStatus {
    pub device_status: DeviceStatus,
}

/// Serial numbers show up as JSON numbers on some firmware and strings on others.
fn deserialize_serial<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    Ok(
        Option::<NumberOrString>::deserialize(deserializer)?.map(|v| match v {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::String(s) => s,
        }),
    )
}
