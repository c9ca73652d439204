//! Forwarding of authenticated requests to upstream services.

use std::fmt;

use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use tracing::{error, info, warn};

use crate::auth::Authenticated;
use crate::gateway::routes::{Route, has_dot_segment};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USERNAME_HEADER: &str = "x-username";
/// Set on responses whose declared length exceeded the route's cap.
pub const TRUNCATED_HEADER: &str = "x-gateway-truncated";

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Forwarding errors.
#[derive(Debug)]
pub enum ProxyError {
    /// The upstream could not be reached or did not answer in time
    Upstream { upstream: String, source: reqwest::Error },
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream { upstream, source } => {
                write!(f, "Failed to forward request to {}: {}", upstream, source)
            }
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upstream { source, .. } => Some(source),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_GATEWAY, self.to_string()).into_response()
    }
}

/// Builds and executes outbound calls.
///
/// The client has no global timeout; each call uses its route's timeout.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Forward `req` along `route`, attaching identity headers when `auth` names a subject.
    pub async fn forward(
        &self,
        route: &Route,
        auth: Option<&Authenticated>,
        req: Request,
    ) -> Response {
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        if has_dot_segment(&path) {
            warn!(method = %method, path = %path, "Refusing to forward a path with dot segments");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
        let target = route.target_url(&path, parts.uri.query());

        let headers = outbound_headers(&parts.headers, auth);

        let mut outbound = self
            .client
            .request(method.clone(), &target)
            .headers(headers)
            .timeout(route.timeout());
        if body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream_response = match outbound.send().await {
            Ok(resp) => resp,
            Err(source) => {
                error!(
                    method = %method,
                    target = %target,
                    error = %source,
                    "Upstream request failed"
                );
                return ProxyError::Upstream {
                    upstream: route.upstream().as_str().trim_end_matches('/').to_string(),
                    source,
                }
                .into_response();
            }
        };

        let status = upstream_response.status();
        info!(
            method = %method,
            path = %path,
            target = %target,
            status = status.as_u16(),
            "Proxied request"
        );

        let cap = route.body_cap();
        let mut headers = inbound_headers(upstream_response.headers());
        if response_has_body(&method, status)
            && let Some(declared) = upstream_response.content_length()
            && declared > cap
        {
            headers.remove(header::CONTENT_LENGTH);
            headers.insert(TRUNCATED_HEADER, HeaderValue::from_static("true"));
            warn!(
                method = %method,
                target = %target,
                declared,
                cap,
                "Upstream declared a body larger than the cap"
            );
        }

        let capped = cap_body(
            Box::pin(upstream_response.bytes_stream()),
            cap,
            method,
            target,
        );

        let mut response = Response::new(Body::from_stream(capped));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// HEAD, 1xx, 204 and 304 responses carry no body whatever `Content-Length` says.
fn response_has_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// Copy inbound request headers for the upstream call.
///
/// Drops `Host`, hop-by-hop headers and any caller-supplied identity headers,
/// then sets identity headers from the verified subject.
fn outbound_headers(inbound: &HeaderMap, auth: Option<&Authenticated>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        if name == header::HOST
            || is_hop_by_hop(name)
            || name == USER_ID_HEADER
            || name == USERNAME_HEADER
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(identity) = auth.and_then(|a| a.identity()) {
        match (
            HeaderValue::from_str(identity.subject_id().as_str()),
            HeaderValue::from_str(identity.display_name().as_str()),
        ) {
            (Ok(id), Ok(name)) => {
                headers.insert(USER_ID_HEADER, id);
                headers.insert(USERNAME_HEADER, name);
            }
            _ => warn!(
                subject_id = %identity.subject_id(),
                "Identity is not representable as header values; not forwarding it"
            ),
        }
    }

    headers
}

/// Copy upstream response headers back to the caller, minus hop-by-hop headers.
fn inbound_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

struct CapState<S> {
    upstream: S,
    remaining: u64,
    cap: u64,
    method: Method,
    target: String,
    done: bool,
}

/// Pass through at most `cap` bytes of `upstream`, logging when anything is cut.
fn cap_body<S, E>(
    upstream: S,
    cap: u64,
    method: Method,
    target: String,
) -> impl Stream<Item = Result<Bytes, E>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = CapState {
        upstream,
        remaining: cap,
        cap,
        method,
        target,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }

        match st.upstream.next().await {
            None => None,
            Some(Err(e)) => {
                warn!(
                    method = %st.method,
                    target = %st.target,
                    error = %e,
                    "Upstream body stream failed"
                );
                st.done = true;
                Some((Err(e), st))
            }
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                if len <= st.remaining {
                    st.remaining -= len;
                    return Some((Ok(chunk), st));
                }

                let keep = st.remaining as usize;
                warn!(
                    method = %st.method,
                    target = %st.target,
                    cap = st.cap,
                    truncated = true,
                    "Upstream response truncated at body cap"
                );
                st.done = true;
                if keep == 0 {
                    None
                } else {
                    let head = chunk.slice(..keep);
                    st.remaining = 0;
                    Some((Ok(head), st))
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::gateway::test_support::LogCapture;
    use crate::gateway::routes::RouteClass;
    use crate::types::{SubjectId, Username};
    use std::time::Duration;
    use wiremock::matchers::{header as header_is, method as method_is, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alice() -> Authenticated {
        Authenticated::Subject(Identity::new(
            SubjectId::new("u-1"),
            Username::new("alice"),
            true,
        ))
    }

    fn route_to(server_uri: &str, prefix: &str, cap: u64) -> Route {
        Route::new(prefix, server_uri, RouteClass::Metadata, Duration::from_secs(5), cap).unwrap()
    }

    async fn collect(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cap_body_truncates_at_exact_boundary() {
        let capture = LogCapture::new();
        let _guard = capture.set_default();

        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"abcdefghij")),
            Ok(Bytes::from_static(b"KLMNOP")),
        ];
        let capped = cap_body(
            stream::iter(chunks),
            15,
            Method::GET,
            "http://upstream/x".to_string(),
        );
        let out: Vec<Bytes> = capped.map(|c| c.unwrap()).collect().await;
        let joined: Vec<u8> = out.concat();

        assert_eq!(joined, b"0123456789abcde");
        let logs = capture.contents();
        assert!(logs.contains("truncated=true"));
        assert!(logs.contains("cap=15"));
    }

    #[tokio::test]
    async fn test_cap_body_exactly_at_cap_is_not_truncation() {
        let capture = LogCapture::new();
        let _guard = capture.set_default();

        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"01234")), Ok(Bytes::from_static(b"56789"))];
        let capped = cap_body(stream::iter(chunks), 10, Method::GET, "t".to_string());
        let out: Vec<Bytes> = capped.map(|c| c.unwrap()).collect().await;

        assert_eq!(out.concat(), b"0123456789");
        assert!(!capture.contents().contains("truncated"));
    }

    #[tokio::test]
    async fn test_forward_copies_request_and_response() {
        let server = MockServer::start().await;
        Mock::given(method_is("POST"))
            .and(path("/api/v1/completions/run"))
            .and(query_param("model", "small"))
            .and(header_is("x-user-id", "u-1"))
            .and(header_is("x-username", "alice"))
            .and(header_is("x-trace", "abc"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("created"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = Forwarder::new().unwrap();
        let route = route_to(&server.uri(), "/api/v1/completions", 1024);
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/completions/run?model=small")
            .header("x-trace", "abc")
            // Forged identity must be replaced
            .header("x-user-id", "admin")
            .body(Body::from("{\"prompt\":\"hi\"}"))
            .unwrap();

        let response = forwarder.forward(&route, Some(&alice()), req).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
        assert_eq!(collect(response).await, Bytes::from_static(b"created"));

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].body, b"{\"prompt\":\"hi\"}");
        assert_eq!(received[0].headers.get_all("x-user-id").iter().count(), 1);
    }

    #[tokio::test]
    async fn test_forward_strips_forged_identity_for_shared_secret() {
        let server = MockServer::start().await;
        Mock::given(method_is("GET"))
            .and(path("/api/v1/stats"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let forwarder = Forwarder::new().unwrap();
        let route = route_to(&server.uri(), "/api/v1/stats", 1024);
        let req = Request::builder()
            .uri("/api/v1/stats")
            .header("x-user-id", "forged")
            .header("x-username", "forged")
            .body(Body::empty())
            .unwrap();

        let response = forwarder
            .forward(&route, Some(&Authenticated::SharedSecret), req)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let received = server.received_requests().await.unwrap();
        assert!(received[0].headers.get("x-user-id").is_none());
        assert!(received[0].headers.get("x-username").is_none());
    }

    #[tokio::test]
    async fn test_upstream_status_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method_is("GET"))
            .respond_with(ResponseTemplate::new(422).set_body_string("{\"error\":\"bad input\"}"))
            .mount(&server)
            .await;

        let forwarder = Forwarder::new().unwrap();
        let route = route_to(&server.uri(), "/api/v1/embeddings", 1024);
        let req = Request::builder()
            .uri("/api/v1/embeddings")
            .body(Body::empty())
            .unwrap();

        let response = forwarder.forward(&route, None, req).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            collect(response).await,
            Bytes::from_static(b"{\"error\":\"bad input\"}")
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = Forwarder::new().unwrap();
        let route = route_to(&format!("http://{}", addr), "/api/v1/stats", 1024);
        let req = Request::builder()
            .uri("/api/v1/stats")
            .body(Body::empty())
            .unwrap();

        let response = forwarder.forward(&route, None, req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = String::from_utf8(collect(response).await.to_vec()).unwrap();
        assert!(body.starts_with(&format!("Failed to forward request to http://{}: ", addr)));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out_as_502() {
        let server = MockServer::start().await;
        Mock::given(method_is("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let forwarder = Forwarder::new().unwrap();
        let route = Route::new(
            "/api/v1/stats",
            &server.uri(),
            RouteClass::Metadata,
            Duration::from_millis(200),
            1024,
        )
        .unwrap();
        let req = Request::builder()
            .uri("/api/v1/stats")
            .body(Body::empty())
            .unwrap();

        let response = forwarder.forward(&route, None, req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_oversized_response_is_truncated_and_flagged() {
        let capture = LogCapture::new();
        let _guard = capture.set_default();

        let server = MockServer::start().await;
        Mock::given(method_is("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&server)
            .await;

        let forwarder = Forwarder::new().unwrap();
        let route = route_to(&server.uri(), "/api/v1/images", 1000);
        let req = Request::builder()
            .uri("/api/v1/images/big.png")
            .body(Body::empty())
            .unwrap();

        let response = forwarder.forward(&route, None, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(TRUNCATED_HEADER).unwrap(), "true");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

        let body = collect(response).await;
        assert_eq!(body.len(), 1000);
        assert!(capture.contents().contains("truncated=true"));
    }

    #[tokio::test]
    async fn test_dot_segments_never_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method_is("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let forwarder = Forwarder::new().unwrap();
        let route = route_to(&server.uri(), "/api/v1/stats", 1024);

        for uri in [
            "/api/v1/stats/../../internal/validate-key",
            "/api/v1/stats/%2e%2e/%2e%2e/internal/validate-key",
        ] {
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = forwarder.forward(&route, Some(&alice()), req).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_head_response_is_not_flagged_as_truncated() {
        let capture = LogCapture::new();
        let _guard = capture.set_default();

        let server = MockServer::start().await;
        Mock::given(method_is("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&server)
            .await;

        let forwarder = Forwarder::new().unwrap();
        let route = route_to(&server.uri(), "/api/v1/images", 1000);
        let req = Request::builder()
            .method("HEAD")
            .uri("/api/v1/images/big.png")
            .body(Body::empty())
            .unwrap();

        let response = forwarder.forward(&route, None, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(TRUNCATED_HEADER).is_none());
        assert!(collect(response).await.is_empty());
        assert!(!capture.contents().contains("larger than the cap"));
    }

    #[test]
    fn test_bodyless_responses() {
        assert!(response_has_body(&Method::GET, StatusCode::OK));
        assert!(!response_has_body(&Method::HEAD, StatusCode::OK));
        assert!(!response_has_body(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(!response_has_body(&Method::GET, StatusCode::NO_CONTENT));
        assert!(!response_has_body(&Method::GET, StatusCode::CONTINUE));
    }

    #[test]
    fn test_hop_by_hop_headers_dropped() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("gateway:8080"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        inbound.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let out = outbound_headers(&inbound, None);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(out.get(header::ACCEPT).unwrap(), "application/json");
    }
}
