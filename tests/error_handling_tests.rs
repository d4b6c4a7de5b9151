use axum::http::StatusCode;
use axum::response::IntoResponse;
use http_body_util::BodyExt;
use s3resign::proxy::access_key::AccessKeyError;
use s3resign::proxy::assemble::AssembleError;
use s3resign::proxy::credential_cache::CacheError;
use s3resign::proxy::identity_source::IdentitySourceError;
use s3resign::proxy::proxy_error::{ProxyError, ProxyErrorCode, S3Error};
use s3resign::proxy::upstream::UpstreamError;

async fn body_of(error: ProxyError) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = error.into_response();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

#[test]
fn test_s3_error_serialization() {
    let error = S3Error {
        code: "InvalidAccessKeyId".to_string(),
        message: "unknown key".to_string(),
        resource: "/bucket/key".to_string(),
        request_id: "req-123".to_string(),
    };

    let xml = quick_xml::se::to_string(&error).unwrap();

    assert!(xml.starts_with("<Error>"));
    assert!(xml.contains("<Code>InvalidAccessKeyId</Code>"));
    assert!(xml.contains("<Message>unknown key</Message>"));
    assert!(xml.contains("<Resource>/bucket/key</Resource>"));
    assert!(xml.contains("<RequestId>req-123</RequestId>"));
}

#[test]
fn test_status_mapping() {
    let cases = [
        (ProxyErrorCode::AccessDenied, StatusCode::FORBIDDEN),
        (ProxyErrorCode::InvalidAccessKeyId, StatusCode::BAD_REQUEST),
        (ProxyErrorCode::InvalidRequest, StatusCode::BAD_REQUEST),
        (ProxyErrorCode::InvalidArgument, StatusCode::BAD_REQUEST),
        (ProxyErrorCode::IncompleteBody, StatusCode::BAD_REQUEST),
        (ProxyErrorCode::EntityTooLarge, StatusCode::BAD_REQUEST),
        (ProxyErrorCode::BadGateway, StatusCode::BAD_GATEWAY),
        (ProxyErrorCode::InternalError, StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (code, status) in cases {
        assert_eq!(ProxyError::new(code).status(), status, "{}", code.as_str());
    }
}

#[test]
fn test_component_errors_convert() {
    assert_eq!(
        ProxyError::from(AccessKeyError::NoAccessKeyFound).code,
        ProxyErrorCode::InvalidRequest
    );
    assert_eq!(
        ProxyError::from(CacheError::NotFound).code,
        ProxyErrorCode::InvalidAccessKeyId
    );
    assert_eq!(
        ProxyError::from(CacheError::Source(IdentitySourceError::Unavailable(
            "down".to_string()
        )))
        .code,
        ProxyErrorCode::InternalError
    );
    assert_eq!(
        ProxyError::from(UpstreamError::NoHostMatch).code,
        ProxyErrorCode::InvalidRequest
    );
    assert_eq!(
        ProxyError::from(AssembleError::BodyTooLarge { limit: 16 }).code,
        ProxyErrorCode::EntityTooLarge
    );
    assert_eq!(
        ProxyError::from(AssembleError::BodyRead("connection reset".into())).code,
        ProxyErrorCode::IncompleteBody
    );
}

#[tokio::test]
async fn test_response_body_and_headers() {
    let error = ProxyError::from(CacheError::NotFound).resource("/bucket/key");

    let (status, headers, body) = body_of(error).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(headers.get("content-type").unwrap(), "application/xml");
    let request_id = headers.get("x-amz-request-id").unwrap().to_str().unwrap();
    assert!(body.contains(&format!("<RequestId>{}</RequestId>", request_id)));
    assert!(body.contains("<Code>InvalidAccessKeyId</Code>"));
    assert!(body.contains("<Resource>/bucket/key</Resource>"));
    assert!(body.contains(ProxyErrorCode::InvalidAccessKeyId.default_message()));
}

#[tokio::test]
async fn test_custom_message_and_default_resource() {
    let (status, _, body) = body_of(ProxyError::access_denied("source IP not allowed")).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("<Message>source IP not allowed</Message>"));
    assert!(body.contains("<Resource>/</Resource>"));
}

#[tokio::test]
async fn test_message_is_xml_escaped() {
    let error = ProxyError::with_message(ProxyErrorCode::InvalidArgument, "a < b & c");

    let (_, _, body) = body_of(error).await;

    assert!(body.contains("a &lt; b &amp; c"));
}
