use std::time::Instant;

use axum::{
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, info};

use crate::context::OperatorContext;

const MAX_OPERATOR_LEN: usize = 128;

/// Attach an [`OperatorContext`] to every request.
pub async fn operator_middleware(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let operator = extract_operator(req.headers())?;
    req.extensions_mut().insert(operator);
    Ok(next.run(req).await)
}

fn extract_operator(headers: &HeaderMap) -> Result<OperatorContext, StatusCode> {
    let Some(header) = headers.get(OperatorContext::HEADER) else {
        return Ok(OperatorContext::anonymous());
    };

    let value = header.to_str().map_err(|_| StatusCode::BAD_REQUEST)?.trim();
    if value.is_empty() {
        return Ok(OperatorContext::anonymous());
    }
    if value.len() > MAX_OPERATOR_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(OperatorContext::new(value))
}

/// One log line per request.
pub async fn request_log(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if path == "/health" {
        debug!(%method, %path, status = status.as_u16(), elapsed_ms, "request");
    } else {
        info!(%method, %path, status = status.as_u16(), elapsed_ms, "request");
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_or_blank_header_is_anonymous() {
        let headers = HeaderMap::new();
        assert_eq!(extract_operator(&headers).unwrap(), OperatorContext::anonymous());

        let mut headers = HeaderMap::new();
        headers.insert(OperatorContext::HEADER, HeaderValue::from_static("   "));
        assert_eq!(extract_operator(&headers).unwrap(), OperatorContext::anonymous());
    }

    #[test]
    fn header_value_is_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(OperatorContext::HEADER, HeaderValue::from_static(" warehouse-7 "));
        assert_eq!(extract_operator(&headers).unwrap().operator(), "warehouse-7");
    }

    #[test]
    fn overlong_operator_is_rejected() {
        let mut headers = HeaderMap::new();
        let long = "x".repeat(MAX_OPERATOR_LEN + 1);
        headers.insert(OperatorContext::HEADER, HeaderValue::from_str(&long).unwrap());
        assert_eq!(extract_operator(&headers).unwrap_err(), StatusCode::BAD_REQUEST);
    }
}
