use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::access_key::AccessKeyError;
use super::assemble::AssembleError;
use super::credential_cache::CacheError;
use super::forwarder::ForwardError;
use super::upstream::UpstreamError;

/// S3-style `<Error>` document returned to callers.
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename = "Error")]
pub struct S3Error {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Resource")]
    pub resource: String,
    #[serde(rename = "RequestId")]
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    AccessDenied,
    InvalidAccessKeyId,
    InvalidRequest,
    InvalidArgument,
    IncompleteBody,
    EntityTooLarge,
    BadGateway,
    InternalError,
}

impl ProxyErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyErrorCode::AccessDenied => "AccessDenied",
            ProxyErrorCode::InvalidAccessKeyId => "InvalidAccessKeyId",
            ProxyErrorCode::InvalidRequest => "InvalidRequest",
            ProxyErrorCode::InvalidArgument => "InvalidArgument",
            ProxyErrorCode::IncompleteBody => "IncompleteBody",
            ProxyErrorCode::EntityTooLarge => "EntityTooLarge",
            ProxyErrorCode::BadGateway => "BadGateway",
            ProxyErrorCode::InternalError => "InternalError",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ProxyErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            ProxyErrorCode::InvalidAccessKeyId => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ProxyErrorCode::IncompleteBody => StatusCode::BAD_REQUEST,
            ProxyErrorCode::EntityTooLarge => StatusCode::BAD_REQUEST,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ProxyErrorCode::AccessDenied => "Access Denied",
            ProxyErrorCode::InvalidAccessKeyId => {
                "The access key Id you provided does not exist in our records."
            }
            ProxyErrorCode::InvalidRequest => "Invalid Request",
            ProxyErrorCode::InvalidArgument => "Invalid Argument",
            ProxyErrorCode::IncompleteBody => "The request body could not be read.",
            ProxyErrorCode::EntityTooLarge => {
                "Your proposed upload exceeds the maximum allowed object size."
            }
            ProxyErrorCode::BadGateway => "The upstream storage service could not be reached.",
            ProxyErrorCode::InternalError => "We encountered an internal error. Please try again.",
        }
    }
}

/// Terminal rejection of one proxied request.
#[derive(Debug)]
pub struct ProxyError {
    pub code: ProxyErrorCode,
    pub message: Option<String>,
    pub resource: Option<String>,
}

impl ProxyError {
    pub fn new(code: ProxyErrorCode) -> Self {
        Self {
            code,
            message: None,
            resource: None,
        }
    }

    pub fn with_message(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            resource: None,
        }
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::with_message(ProxyErrorCode::AccessDenied, message)
    }

    pub fn status(&self) -> StatusCode {
        self.code.http_status()
    }
}

impl From<AccessKeyError> for ProxyError {
    fn from(err: AccessKeyError) -> Self {
        Self::with_message(ProxyErrorCode::InvalidRequest, err.to_string())
    }
}

impl From<CacheError> for ProxyError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound => Self::new(ProxyErrorCode::InvalidAccessKeyId),
            CacheError::Source(e) => Self::with_message(ProxyErrorCode::InternalError, e.to_string()),
        }
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        Self::with_message(ProxyErrorCode::InvalidRequest, err.to_string())
    }
}

impl From<AssembleError> for ProxyError {
    fn from(err: AssembleError) -> Self {
        match err {
            AssembleError::BodyRead(e) => {
                Self::with_message(ProxyErrorCode::IncompleteBody, e.to_string())
            }
            too_large @ AssembleError::BodyTooLarge { .. } => {
                Self::with_message(ProxyErrorCode::EntityTooLarge, too_large.to_string())
            }
            other => Self::with_message(ProxyErrorCode::InvalidArgument, other.to_string()),
        }
    }
}

impl From<ForwardError> for ProxyError {
    fn from(err: ForwardError) -> Self {
        Self::with_message(ProxyErrorCode::BadGateway, err.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();

        let err = S3Error {
            code: self.code.as_str().to_string(),
            message: self
                .message
                .unwrap_or_else(|| self.code.default_message().to_string()),
            resource: self.resource.unwrap_or_else(|| "/".to_string()),
            request_id,
        };

        let xml_body = to_string(&err).unwrap_or_else(|_| {
            format!(
                r#"<Error><Code>{}</Code><Message>{}</Message><Resource>{}</Resource><RequestId>{}</RequestId></Error>"#,
                err.code, err.message, err.resource, err.request_id
            )
        });

        let mut response = (self.code.http_status(), xml_body).into_response();
        response.headers_mut().insert(
            "content-type",
            HeaderValue::from_static("application/xml"),
        );
        if let Ok(value) = HeaderValue::from_str(&err.request_id) {
            response.headers_mut().insert("x-amz-request-id", value);
        }

        response
    }
}
