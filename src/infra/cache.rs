use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;

use crate::cache::ApproxSize;

const ENTRY_OVERHEAD: usize = 64;

/// A fully buffered origin response, as stored in the render cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut stored_headers = Vec::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            stored_headers.push((name.clone(), value.clone()));
        }

        Self {
            status,
            headers: stored_headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn header(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(stored, _)| stored == name)
            .map(|(_, value)| value)
    }

    /// Whether this response may be stored and served to other requesters.
    pub fn is_storable(&self) -> bool {
        should_store_response(self.status, &self.header_map())
    }

    /// Whether this response belongs to its requester alone.
    pub fn is_private(&self) -> bool {
        is_private_response(&self.header_map())
    }

    fn header_map(&self) -> HeaderMap {
        self.headers.iter().cloned().collect()
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        headers.clear();
        for (name, value) in self.headers {
            headers.append(name, value);
        }

        response
    }
}

impl ApproxSize for CachedResponse {
    fn approx_size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        ENTRY_OVERHEAD + headers + self.body.len()
    }
}

pub fn should_store_response(status: StatusCode, headers: &HeaderMap) -> bool {
    if !status.is_success() || is_private_response(headers) {
        return false;
    }

    !headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

/// Sets cookies or is marked `private`/`no-store`: only its requester may see it.
pub fn is_private_response(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::SET_COOKIE) {
        return true;
    }

    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|directive| {
            directive.eq_ignore_ascii_case("private") || directive.eq_ignore_ascii_case("no-store")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).expect("header"));
        }
        map
    }

    #[test]
    fn plain_success_is_storable() {
        let map = headers(&[(header::CONTENT_TYPE, "text/html; charset=utf-8")]);
        assert!(should_store_response(StatusCode::OK, &map));
    }

    #[test]
    fn errors_and_cookies_are_not_storable() {
        assert!(!should_store_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &HeaderMap::new()
        ));
        let map = headers(&[(header::SET_COOKIE, "session=1")]);
        assert!(!should_store_response(StatusCode::OK, &map));
    }

    #[test]
    fn streams_and_private_responses_are_not_storable() {
        let map = headers(&[(header::CONTENT_TYPE, "text/event-stream")]);
        assert!(!should_store_response(StatusCode::OK, &map));

        let map = headers(&[(header::CACHE_CONTROL, "max-age=60, Private")]);
        assert!(!should_store_response(StatusCode::OK, &map));

        let map = headers(&[(header::CACHE_CONTROL, "no-store")]);
        assert!(!should_store_response(StatusCode::OK, &map));

        let map = headers(&[(header::CACHE_CONTROL, "public, max-age=60")]);
        assert!(should_store_response(StatusCode::OK, &map));
    }

    #[test]
    fn cookies_and_private_directives_mark_responses_private() {
        assert!(is_private_response(&headers(&[(header::SET_COOKIE, "session=1")])));
        assert!(is_private_response(&headers(&[(
            header::CACHE_CONTROL,
            "no-store"
        )])));
        assert!(!is_private_response(&headers(&[(
            header::CONTENT_TYPE,
            "text/event-stream"
        )])));

        let not_found = CachedResponse::new(StatusCode::NOT_FOUND, &HeaderMap::new(), Bytes::new());
        assert!(!not_found.is_storable());
        assert!(!not_found.is_private());
    }

    #[test]
    fn size_counts_body_and_headers() {
        let map = headers(&[(header::CONTENT_TYPE, "text/html")]);
        let cached = CachedResponse::new(StatusCode::OK, &map, Bytes::from_static(b"hello"));
        assert_eq!(
            cached.approx_size(),
            ENTRY_OVERHEAD + "content-type".len() + "text/html".len() + 5
        );
    }

    #[test]
    fn round_trips_into_response() {
        let map = headers(&[(header::CONTENT_TYPE, "text/html")]);
        let cached = CachedResponse::new(StatusCode::CREATED, &map, Bytes::from_static(b"hi"));
        let response = cached.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"text/html"[..])
        );
    }
}
