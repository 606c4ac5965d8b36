//! Request normalization
//!
//! Turns whatever shape the page passed into one [`LiteRequest`]. Inputs are
//! only borrowed; a stream body is the one thing reading consumes.

use crate::request::{header_get, merge_headers, resolve_url, FetchInput, RequestInit};
use crate::signal::AbortSignal;
use bridge_common::codec::encode_body_source;
use bridge_common::{BridgeError, BridgeOptions, HeaderList, LiteRequest};
use url::Url;

/// A call ready for the bridge
#[derive(Debug, Clone)]
pub struct NormalizedCall {
    pub request: LiteRequest,
    pub url: Url,
    pub signal: Option<AbortSignal>,
    pub options: BridgeOptions,
}

pub async fn normalize_request(
    input: &FetchInput,
    init: &RequestInit,
    location: &Url,
    max_body_bytes: usize,
) -> Result<NormalizedCall, BridgeError> {
    let url = resolve_url(input, location)?;
    let from_request = match input {
        FetchInput::Request(request) => Some(request),
        _ => None,
    };

    let method = init
        .method
        .clone()
        .or_else(|| from_request.map(|r| r.method.clone()))
        .unwrap_or_else(|| "GET".to_string())
        .trim()
        .to_ascii_uppercase();

    let base_headers = from_request.map(|r| r.headers.clone()).unwrap_or_default();
    let mut headers: HeaderList = match &init.headers {
        Some(overrides) => merge_headers(&base_headers, overrides),
        None => base_headers,
    };

    let body_source = init.body.as_ref().or_else(|| from_request.and_then(|r| r.body.as_ref()));
    if body_source.is_some() && (method == "GET" || method == "HEAD") {
        return Err(BridgeError::invalid_request(format!("{} request cannot have a body", method)));
    }

    let body = match body_source {
        Some(source) => {
            let declared = header_get(&headers, "content-type").map(str::to_string);
            let encoded = encode_body_source(source, declared.as_deref(), max_body_bytes).await?;
            if declared.is_none() {
                if let Some(implied) = encoded.implied_content_type {
                    headers.push(("Content-Type".to_string(), implied));
                }
            }
            Some(encoded.body)
        }
        None => None,
    };

    let options = init.bridge_options.clone().unwrap_or_default();
    let signal = init
        .signal
        .clone()
        .or_else(|| from_request.and_then(|r| r.signal.clone()));

    Ok(NormalizedCall {
        request: LiteRequest {
            url: url.to_string(),
            method: Some(method),
            headers,
            body,
            options: (options != BridgeOptions::default()).then(|| options.clone()),
        },
        url,
        signal,
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PageRequest;
    use bridge_common::{BodySource, FormField, FormValue, WireBody};

    fn location() -> Url {
        Url::parse("http://localhost:5173/app/").unwrap()
    }

    #[tokio::test]
    async fn test_relative_url_and_method() {
        let call = normalize_request(&"../api?q=1".into(), &RequestInit::new().method("post").body("x"), &location(), 1024)
            .await
            .unwrap();
        assert_eq!(call.request.url, "http://localhost:5173/api?q=1");
        assert_eq!(call.request.method.as_deref(), Some("POST"));
        assert_eq!(call.request.body, Some(WireBody::Text("x".to_string())));
        assert_eq!(call.request.header("content-type"), Some("text/plain;charset=UTF-8"));
    }

    #[tokio::test]
    async fn test_declared_content_type_is_kept() {
        let init = RequestInit::new()
            .method("POST")
            .header("Content-Type", "application/json")
            .body(r#"{"a":1}"#);
        let call = normalize_request(&"https://api.test/".into(), &init, &location(), 1024).await.unwrap();
        let content_types: Vec<_> = call
            .request
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(content_types[0].1, "application/json");
    }

    #[tokio::test]
    async fn test_body_on_get_is_rejected() {
        let err = normalize_request(&"/x".into(), &RequestInit::new().body("no"), &location(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_request_input_with_init_overrides() {
        let mut request = PageRequest::new("https://api.test/v1");
        request.method = "PUT".to_string();
        request.headers.push(("Authorization".to_string(), "Bearer a".to_string()));
        request.body = Some(BodySource::Bytes(vec![1u8, 2, 3].into()));

        let input = FetchInput::Request(request);
        let init = RequestInit::new().header("authorization", "Bearer b");
        let call = normalize_request(&input, &init, &location(), 1024).await.unwrap();
        assert_eq!(call.request.method(), "PUT");
        assert_eq!(call.request.header("Authorization"), Some("Bearer b"));
        assert!(matches!(call.request.body, Some(WireBody::Binary(_))));

        // The input itself is untouched
        let FetchInput::Request(original) = &input else { unreachable!() };
        assert_eq!(original.headers[0].1, "Bearer a");
    }

    #[tokio::test]
    async fn test_form_data_sets_boundary_content_type() {
        let form = BodySource::FormData(vec![FormField {
            name: "a".to_string(),
            value: FormValue::Text("1".to_string()),
        }]);
        let init = RequestInit {
            method: Some("POST".to_string()),
            body: Some(form),
            ..Default::default()
        };
        let call = normalize_request(&"https://api.test/upload".into(), &init, &location(), 4096).await.unwrap();
        assert!(call
            .request
            .header("content-type")
            .unwrap()
            .starts_with("multipart/form-data; boundary="));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let init = RequestInit::new().method("POST").body("x".repeat(11));
        let err = normalize_request(&"/x".into(), &init, &location(), 10).await.unwrap_err();
        assert_eq!(err, BridgeError::BodyTooLarge { size: 11, limit: 10 });
    }
}
