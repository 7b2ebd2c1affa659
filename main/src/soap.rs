use crate::http::HttpError;
use crate::http::SharedHttpClient;
use quick_xml::escape::escape;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;
use xmltree::Element;

const ENVELOPE_NAMESPACE: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const ENCODING_STYLE: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// Output arguments of a successful action, keyed by argument name.
pub type ActionResponse = HashMap<String, String>;

/// An input argument of an action. `None` sends an empty element.
pub type Argument<'a> = (&'a str, Option<String>);

/// UPnP error returned by a gateway inside a SOAP fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub error_code: String,
    pub error_description: String,

    /// Envelope that was sent.
    pub request: String,

    /// Body that was received.
    pub response: String,
}

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("UPnP error {}: {}", .0.error_code, .0.error_description)]
    Fault(SoapFault),

    #[error("Action failed with HTTP status {status}")]
    Http { status: u16, body: String },

    #[error("Failed to send the action")]
    Transport(#[from] HttpError),

    #[error("Invalid XML in the action response")]
    Xml(#[from] xmltree::ParseError),

    #[error("Action response has no `{0}` element")]
    MissingResponse(String),
}

impl ActionError {
    /// UPnP error code if the gateway answered with a fault.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Fault(fault) => Some(&fault.error_code),
            _ => None,
        }
    }
}

/// Invokes actions of one service through its control URL.
#[derive(Clone)]
pub struct ActionInvoker {
    http: SharedHttpClient,
    control_url: Url,
    service_type: String,
}

impl ActionInvoker {
    pub fn new(http: SharedHttpClient, control_url: Url, service_type: String) -> Self {
        Self {
            http,
            control_url,
            service_type,
        }
    }

    pub fn control_url(&self) -> &Url {
        &self.control_url
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Sends `action` with `arguments` in the given order.
    pub async fn call(
        &self,
        action: &str,
        arguments: &[Argument<'_>],
    ) -> Result<ActionResponse, ActionError> {
        let request = envelope(&self.service_type, action, arguments);
        let headers = vec![
            ("Content-Type".into(), r#"text/xml; charset="utf-8""#.into()),
            ("Content-Length".into(), request.len().to_string()),
            (
                "SOAPAction".into(),
                format!(r#""{}#{}""#, self.service_type, action),
            ),
        ];
        log::debug!("Invoking {} at {}", action, self.control_url);
        let response = self
            .http
            .post(self.control_url.as_str(), request.clone(), headers)
            .await?;

        if !(200..300).contains(&response.status) {
            return Err(match parse_fault(&response.body) {
                Some((error_code, error_description)) => {
                    log::debug!(
                        "{} failed with UPnP error {}: {}",
                        action,
                        error_code,
                        error_description
                    );
                    ActionError::Fault(SoapFault {
                        error_code,
                        error_description,
                        request,
                        response: response.body,
                    })
                }
                None => ActionError::Http {
                    status: response.status,
                    body: response.body,
                },
            });
        }
        parse_response(&response.body, action)
    }
}

/// Builds the SOAP 1.1 envelope of an action.
pub fn envelope(service_type: &str, action: &str, arguments: &[Argument<'_>]) -> String {
    let arguments: String = arguments
        .iter()
        .map(|(name, value)| match value {
            Some(value) => format!("<{0}>{1}</{0}>", name, escape(value.as_str())),
            None => format!("<{0}></{0}>", name),
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><s:Envelope xmlns:s="{}" s:encodingStyle="{}"><s:Body><u:{action} xmlns:u="{}">{}</u:{action}></s:Body></s:Envelope>"#,
        ENVELOPE_NAMESPACE,
        ENCODING_STYLE,
        escape(service_type),
        arguments,
        action = action,
    )
}

/// Extracts `errorCode` and `errorDescription` out of `Envelope/Body/Fault/detail/UPnPError`.
fn parse_fault(body: &str) -> Option<(String, String)> {
    let envelope = Element::parse(body.as_bytes()).ok()?;
    let error = envelope
        .get_child("Body")?
        .get_child("Fault")?
        .get_child("detail")?
        .get_child("UPnPError")?;
    let error_code = error.get_child("errorCode")?.get_text()?.trim().to_owned();
    let error_description = error
        .get_child("errorDescription")
        .and_then(|e| e.get_text())
        .map(|t| t.trim().to_owned())
        .unwrap_or_default();
    Some((error_code, error_description))
}

fn parse_response(body: &str, action: &str) -> Result<ActionResponse, ActionError> {
    let envelope = Element::parse(body.as_bytes())?;
    let response_name = format!("{}Response", action);
    let response = envelope
        .get_child("Body")
        .and_then(|b| b.get_child(response_name.as_str()))
        .ok_or_else(|| ActionError::MissingResponse(response_name.clone()))?;
    Ok(response
        .children
        .iter()
        .filter_map(|n| n.as_element())
        .map(|e| {
            let value = e.get_text().map(|t| t.into_owned()).unwrap_or_default();
            (e.name.clone(), value)
        })
        .collect())
}
