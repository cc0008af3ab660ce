use axum::{
    body::to_bytes,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode, Uri, header, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::cache::{CacheOutcome, PageRequest, RenderFailure};
use crate::error::HttpError;

use super::ProxyState;
use super::origin::{OriginError, OriginRequest};

pub const CLIENT_ID_COOKIE: &str = "clientId";
pub const TIMEZONE_COOKIE: &str = "timezone";
pub const THEME_COOKIE: &str = "theme";
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-render-cache");

const SOURCE: &str = "infra::http::proxy";

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub(super) async fn proxy(
    State(state): State<ProxyState>,
    jar: CookieJar,
    request: Request,
) -> Response {
    if request.method() == Method::GET {
        serve_page(state, jar, request).await
    } else {
        forward(state, request).await
    }
}

/// GET requests go through the render cache.
async fn serve_page(state: ProxyState, jar: CookieJar, request: Request) -> Response {
    let (parts, _body) = request.into_parts();

    let existing = jar
        .get(CLIENT_ID_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty());
    let (identity, jar) = match existing {
        Some(identity) => (identity, jar),
        None => {
            let identity = Uuid::new_v4().to_string();
            let jar = jar.add(client_id_cookie(identity.clone()));
            (identity, jar)
        }
    };

    let page = page_request(&parts, &jar, &state.auth_cookie);
    let origin = state.origin.clone();
    let origin_request = OriginRequest::get(page.path.clone(), parts.headers);

    let result = state
        .cache
        .get(&page, &identity, move |allocation| async move {
            origin.render(origin_request, &allocation).await
        })
        .await;

    let response = match result {
        Ok(served) => {
            debug!(outcome = ?served.outcome, "Page served");
            with_cache_status(
                served.output.into_response(),
                served.outcome.cache_outcome(),
            )
        }
        Err(failure) => render_failure(&failure),
    };

    (jar, response).into_response()
}

/// Everything except GET is passed through untouched and never recorded.
async fn forward(state: ProxyState, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_request_bytes).await {
        Ok(body) => body,
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                &err,
            )
            .into_response();
        }
    };

    let request = OriginRequest {
        method: parts.method,
        path_and_query: path_and_query(&parts.uri),
        headers: parts.headers,
        body,
    };

    match state.origin.send(request).await {
        Ok(response) => with_cache_status(response.into_response(), CacheOutcome::Bypass),
        Err(err) => bad_gateway(&err),
    }
}

fn page_request(parts: &Parts, jar: &CookieJar, auth_cookie: &str) -> PageRequest {
    let authenticated =
        jar.get(auth_cookie).is_some() || parts.headers.contains_key(header::AUTHORIZATION);
    let mut page = PageRequest::new(path_and_query(&parts.uri)).authenticated(authenticated);

    if let Some(timezone) = jar.get(TIMEZONE_COOKIE) {
        page = page.with_timezone(timezone.value());
    }
    if let Some(theme) = jar.get(THEME_COOKIE) {
        page = page.with_theme(theme.value());
    }
    if let Some(agent) = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        page = page.with_user_agent(agent);
    }

    page
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn client_id_cookie(identity: String) -> Cookie<'static> {
    Cookie::build((CLIENT_ID_COOKIE, identity))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .permanent()
        .build()
}

fn with_cache_status(mut response: Response, outcome: CacheOutcome) -> Response {
    response.headers_mut().insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(outcome.as_str()),
    );
    response
}

fn render_failure(failure: &RenderFailure<OriginError>) -> Response {
    with_cache_status(bad_gateway(failure), CacheOutcome::Miss)
}

fn bad_gateway(error: &dyn std::error::Error) -> Response {
    HttpError::from_error(SOURCE, StatusCode::BAD_GATEWAY, "Bad gateway", error).into_response()
}
