//! CloudEvents 1.0 over HTTP, binary and structured content modes.

use std::collections::BTreeMap;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SPEC_VERSION: &str = "1.0";
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Extension attribute carrying the barrier run id.
pub const RUN_ID_EXTENSION: &str = "runid";

const HEADER_PREFIX: &str = "ce-";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("missing required attribute {0}")]
    MissingAttribute(&'static str),

    #[error("unsupported specversion {0:?}")]
    UnsupportedSpecVersion(String),

    #[error("invalid time attribute: {0}")]
    InvalidTime(#[from] chrono::ParseError),

    #[error("header {0} is not valid")]
    InvalidHeader(String),

    #[error("malformed event: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unsupported data: {0}")]
    UnsupportedData(&'static str),

    #[error("event has no data")]
    MissingData,

    #[error("data does not match expected shape: {0}")]
    Data(#[source] serde_json::Error),
}

/// How an event was carried over HTTP. Replies use the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Binary,
    Structured,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl CloudEvent {
    pub fn new(id: impl Into<String>, source: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            specversion: SPEC_VERSION.to_string(),
            ty: ty.into(),
            time: None,
            subject: None,
            dataschema: None,
            datacontenttype: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.datacontenttype = Some(JSON_CONTENT_TYPE.to_string());
        self.data = Some(data);
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), Value::String(value.into()));
        self
    }

    /// String-valued extension attribute.
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).and_then(Value::as_str)
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        let data = self.data.clone().ok_or(EventError::MissingData)?;
        serde_json::from_value(data).map_err(EventError::Data)
    }

    /// Reply event: same context, new JSON data, `type` replaced when an
    /// override is given.
    pub fn respond_with(&self, data: Value, type_override: Option<&str>) -> CloudEvent {
        let mut out = self.clone().with_data(data);
        if let Some(ty) = type_override {
            out.ty = ty.to_string();
        }
        out
    }

    /// Decode an event from an HTTP request, detecting the content mode.
    pub fn from_http(headers: &HeaderMap, body: &[u8]) -> Result<(Self, Mode), EventError> {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with(STRUCTURED_CONTENT_TYPE))
        {
            let event: CloudEvent = serde_json::from_slice(body).map_err(EventError::Malformed)?;
            if event.extensions.contains_key("data_base64") {
                return Err(EventError::UnsupportedData("data_base64"));
            }
            event.check_version()?;
            return Ok((event, Mode::Structured));
        }

        let event = Self::from_binary(headers, content_type, body)?;
        event.check_version()?;
        Ok((event, Mode::Binary))
    }

    fn from_binary(
        headers: &HeaderMap,
        content_type: Option<String>,
        body: &[u8],
    ) -> Result<Self, EventError> {
        let mut attrs: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            if let Some(attr) = name.as_str().strip_prefix(HEADER_PREFIX) {
                let value = value
                    .to_str()
                    .map_err(|_| EventError::InvalidHeader(name.to_string()))?;
                attrs.insert(attr.to_string(), value.to_string());
            }
        }

        let mut take = |key: &'static str| attrs.remove(key);
        let id = take("id").ok_or(EventError::MissingAttribute("id"))?;
        let source = take("source").ok_or(EventError::MissingAttribute("source"))?;
        let ty = take("type").ok_or(EventError::MissingAttribute("type"))?;
        let specversion = take("specversion").ok_or(EventError::MissingAttribute("specversion"))?;
        let time = take("time")
            .map(|t| DateTime::parse_from_rfc3339(&t).map(|t| t.with_timezone(&Utc)))
            .transpose()?;
        let subject = take("subject");
        let dataschema = take("dataschema");

        let data = if body.is_empty() {
            None
        } else if content_type.as_deref().map_or(true, |ct| ct.contains("json")) {
            Some(serde_json::from_slice(body).map_err(EventError::Data)?)
        } else {
            return Err(EventError::UnsupportedData("non-JSON data"));
        };

        Ok(Self {
            id,
            source,
            specversion,
            ty,
            time,
            subject,
            dataschema,
            datacontenttype: content_type,
            data,
            extensions: attrs
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        })
    }

    fn check_version(&self) -> Result<(), EventError> {
        if self.specversion == SPEC_VERSION {
            Ok(())
        } else {
            Err(EventError::UnsupportedSpecVersion(self.specversion.clone()))
        }
    }

    /// Encode as a 200 response in the given mode.
    pub fn to_http(&self, mode: Mode) -> Result<Response, EventError> {
        match mode {
            Mode::Structured => {
                let body = serde_json::to_vec(self).map_err(EventError::Malformed)?;
                Ok((
                    StatusCode::OK,
                    [(CONTENT_TYPE, HeaderValue::from_static(STRUCTURED_CONTENT_TYPE))],
                    body,
                )
                    .into_response())
            }
            Mode::Binary => {
                let mut headers = HeaderMap::new();
                put_header(&mut headers, "id", &self.id)?;
                put_header(&mut headers, "source", &self.source)?;
                put_header(&mut headers, "type", &self.ty)?;
                put_header(&mut headers, "specversion", &self.specversion)?;
                if let Some(time) = self.time {
                    put_header(&mut headers, "time", &time.to_rfc3339())?;
                }
                if let Some(subject) = &self.subject {
                    put_header(&mut headers, "subject", subject)?;
                }
                if let Some(schema) = &self.dataschema {
                    put_header(&mut headers, "dataschema", schema)?;
                }
                for (name, value) in &self.extensions {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    put_header(&mut headers, name, &value)?;
                }

                let content_type = self
                    .datacontenttype
                    .as_deref()
                    .unwrap_or(JSON_CONTENT_TYPE);
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_str(content_type)
                        .map_err(|_| EventError::InvalidHeader("content-type".into()))?,
                );

                let body = match &self.data {
                    Some(data) => serde_json::to_vec(data).map_err(EventError::Malformed)?,
                    None => Vec::new(),
                };
                Ok((StatusCode::OK, headers, body).into_response())
            }
        }
    }
}

fn put_header(headers: &mut HeaderMap, attr: &str, value: &str) -> Result<(), EventError> {
    let name = format!("{HEADER_PREFIX}{attr}");
    let header = HeaderName::try_from(name.as_str())
        .map_err(|_| EventError::InvalidHeader(name.clone()))?;
    let value = HeaderValue::from_str(value).map_err(|_| EventError::InvalidHeader(name))?;
    headers.insert(header, value);
    Ok(())
}
