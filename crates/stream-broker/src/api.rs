use crate::{Creation, Error, Store};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use proto_streams::{
    AppendResponse, ErrorBody, ErrorCode, Offset, ReadMode, ReadParams, StreamName,
};
use std::sync::Arc;
use std::time::Duration;

const STREAM_OFFSET: HeaderName = HeaderName::from_static(proto_streams::STREAM_OFFSET);
const STREAM_NEXT_OFFSET: HeaderName = HeaderName::from_static(proto_streams::STREAM_NEXT_OFFSET);
const STREAM_UP_TO_DATE: HeaderName = HeaderName::from_static(proto_streams::STREAM_UP_TO_DATE);

/// Content-type of streams created without one.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// App is the shared state of the broker's HTTP API.
pub struct App {
    pub store: Store,
    /// Maximum duration of a long-poll read which finds no records.
    pub long_poll_timeout: Duration,
    /// Upper bound on the body of a read response.
    pub max_read_bytes: u64,
    /// Renders metrics for the `/metrics` endpoint, if installed.
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

pub fn build_router(app: Arc<App>) -> axum::Router {
    axum::Router::new()
        .route(
            "/v1/stream/{*path}",
            axum::routing::post(handle_post)
                .get(handle_read)
                .head(handle_head)
                .delete(handle_delete),
        )
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/metrics", axum::routing::get(handle_metrics))
        .with_state(app)
}

// POST of a stream path either creates the stream,
// or appends to it if the path ends with the reserved `append` segment.
async fn handle_post(
    state: State<Arc<App>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    match path.strip_suffix(proto_streams::APPEND_SEGMENT) {
        Some(prefix) if prefix.ends_with('/') => {
            let name = StreamName::new(&prefix[..prefix.len() - 1])?;
            handle_append(state, name, headers, body).await
        }
        _ => handle_create(state, StreamName::new(path)?, headers).await,
    }
}

#[tracing::instrument(skip(app, headers), err(level = tracing::Level::WARN))]
async fn handle_create(
    State(app): State<Arc<App>>,
    name: StreamName,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let content_type = match headers.get(header::CONTENT_TYPE) {
        Some(_) => content_type(&headers)?,
        None => DEFAULT_CONTENT_TYPE.to_string(),
    };
    let (metadata, creation) = app.store.create(&name, &content_type).await?;

    let status = match creation {
        Creation::Created => StatusCode::CREATED,
        Creation::AlreadyExists => StatusCode::OK,
    };
    Ok((
        status,
        [(STREAM_NEXT_OFFSET, metadata.write_head.to_string())],
        axum::Json(metadata),
    )
        .into_response())
}

#[tracing::instrument(skip(app, headers, body), fields(body_len = body.len()), err(level = tracing::Level::WARN))]
async fn handle_append(
    State(app): State<Arc<App>>,
    name: StreamName,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let content_type = content_type(&headers)?;
    let appended = app.store.append(&name, &content_type, &body, true).await?;

    Ok((
        [(STREAM_NEXT_OFFSET, appended.next.to_string())],
        axum::Json(AppendResponse {
            offset: appended.last,
            next_offset: appended.next,
            records: appended.records,
        }),
    )
        .into_response())
}

#[tracing::instrument(skip(app), err(level = tracing::Level::WARN))]
async fn handle_read(
    State(app): State<Arc<App>>,
    Path(path): Path<String>,
    params: Result<Query<ReadParams>, QueryRejection>,
) -> Result<Response, Error> {
    let name = StreamName::new(path)?;
    let Query(params) = params.map_err(|rejection| Error::InvalidQuery(rejection.body_text()))?;
    let from = params.offset.unwrap_or(Offset::ZERO);
    let max_bytes = params
        .max_bytes
        .unwrap_or(app.max_read_bytes)
        .clamp(1, app.max_read_bytes);

    metrics::counter!("stream_reads_total", "mode" => params.live.as_str()).increment(1);

    // If the client disconnects, this future is dropped, which releases a pending wait.
    let batch = match params.live {
        ReadMode::Immediate => app.store.read(&name, from, max_bytes).await?,
        ReadMode::LongPoll => {
            let deadline = tokio::time::Instant::now() + app.long_poll_timeout;
            app.store.wait(&name, from, max_bytes, deadline).await?
        }
    };
    let content_type = app.store.metadata(&name)?.content_type;

    let status = if batch.content.is_empty() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };
    tracing::debug!(
        offset = %batch.offset,
        next_offset = %batch.next_offset,
        records = batch.records.len(),
        "served read"
    );

    Ok((
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (STREAM_OFFSET, batch.offset.to_string()),
            (STREAM_NEXT_OFFSET, batch.next_offset.to_string()),
            (STREAM_UP_TO_DATE, (!batch.has_more()).to_string()),
        ],
        batch.content,
    )
        .into_response())
}

async fn handle_head(
    State(app): State<Arc<App>>,
    Path(path): Path<String>,
) -> Result<Response, Error> {
    let metadata = app.store.metadata(&StreamName::new(path)?)?;

    Ok([
        (header::CONTENT_TYPE, metadata.content_type),
        (STREAM_NEXT_OFFSET, metadata.write_head.to_string()),
    ]
    .into_response())
}

#[tracing::instrument(skip(app), err(level = tracing::Level::WARN))]
async fn handle_delete(
    State(app): State<Arc<App>>,
    Path(path): Path<String>,
) -> Result<StatusCode, Error> {
    app.store.delete(&StreamName::new(path)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_metrics(State(app): State<Arc<App>>) -> Response {
    match &app.prometheus {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// Parse the request Content-Type into its normalized essence,
// such that "Application/JSON; charset=utf-8" is "application/json".
fn content_type(headers: &HeaderMap) -> Result<String, Error> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .map(|mime| mime.essence_str().to_ascii_lowercase())
        .ok_or(Error::MissingContentType)
}

impl Error {
    pub fn code(&self) -> (StatusCode, ErrorCode) {
        match self {
            Error::StreamNotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::StreamNotFound),
            Error::StreamUnavailable { .. } | Error::Open { .. } | Error::Task(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::StreamUnavailable,
            ),
            Error::ContentTypeMismatch { .. } => {
                (StatusCode::CONFLICT, ErrorCode::ContentTypeMismatch)
            }
            Error::InvalidOffset { .. } | Error::InvalidQuery(_) => {
                (StatusCode::BAD_REQUEST, ErrorCode::InvalidOffset)
            }
            Error::InvalidName(_) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidName),
            Error::EmptyAppend(_) => (StatusCode::BAD_REQUEST, ErrorCode::EmptyAppend),
            Error::MissingContentType => (StatusCode::BAD_REQUEST, ErrorCode::MissingContentType),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error) = self.code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(error = ?anyhow::Error::new(self), "request failed");
        }
        (status, axum::Json(ErrorBody { error, message })).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(tmp: &tempfile::TempDir, long_poll_timeout: Duration) -> axum::Router {
        build_router(Arc::new(App {
            store: Store::open(tmp.path()).unwrap(),
            long_poll_timeout,
            max_read_bytes: 1 << 20,
            prometheus: None,
        }))
    }

    fn post(uri: &str, content_type: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(resp: Response) -> Bytes {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    fn header_str<'r>(resp: &'r Response, name: &str) -> &'r str {
        resp.headers().get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn test_create_then_reuse() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp, Duration::from_secs(1));
        let uri = "/v1/stream/conversations/c1/prompts";

        let resp = app
            .clone()
            .oneshot(post(uri, Some("application/json"), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        insta::assert_json_snapshot!(body_json(resp).await, @r###"
        {
          "contentType": "application/json",
          "name": "conversations/c1/prompts",
          "writeHead": "00000000000000000000"
        }
        "###);

        let resp = app
            .clone()
            .oneshot(post(uri, Some("application/json; charset=utf-8"), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(post(uri, Some("text/plain"), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"], "ContentTypeMismatch");
    }

    #[tokio::test]
    async fn test_append_then_immediate_read() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp, Duration::from_secs(1));

        let resp = app
            .clone()
            .oneshot(post(
                "/v1/stream/conversations/c1/responses/append",
                Some("application/json"),
                "{\"content\":\"hi\",\"isComplete\":false}\n{\"content\":\"\",\"isComplete\":true}\n",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            header_str(&resp, proto_streams::STREAM_NEXT_OFFSET),
            "00000000000000000069"
        );
        insta::assert_json_snapshot!(body_json(resp).await, @r###"
        {
          "nextOffset": "00000000000000000069",
          "offset": "00000000000000000036",
          "records": 2
        }
        "###);

        let resp = app
            .clone()
            .oneshot(get("/v1/stream/conversations/c1/responses?offset=0"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, "content-type"), "application/json");
        assert_eq!(
            header_str(&resp, proto_streams::STREAM_OFFSET),
            "00000000000000000000"
        );
        assert_eq!(
            header_str(&resp, proto_streams::STREAM_NEXT_OFFSET),
            "00000000000000000069"
        );
        assert_eq!(header_str(&resp, proto_streams::STREAM_UP_TO_DATE), "true");
        assert_eq!(
            body_bytes(resp).await,
            "{\"content\":\"hi\",\"isComplete\":false}\n{\"content\":\"\",\"isComplete\":true}\n"
        );

        // Caught up at the tail.
        let resp = app
            .clone()
            .oneshot(get(
                "/v1/stream/conversations/c1/responses?offset=00000000000000000069&live=immediate",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(header_str(&resp, proto_streams::STREAM_UP_TO_DATE), "true");
    }

    #[tokio::test]
    async fn test_paged_reads_report_more() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp, Duration::from_secs(1));

        app.clone()
            .oneshot(post(
                "/v1/stream/paged/append",
                Some("application/json"),
                "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n",
            ))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(get("/v1/stream/paged?offset=8&maxBytes=8"))
            .await
            .unwrap();
        assert_eq!(header_str(&resp, proto_streams::STREAM_UP_TO_DATE), "false");
        assert_eq!(
            header_str(&resp, proto_streams::STREAM_NEXT_OFFSET),
            "00000000000000000016"
        );
        assert_eq!(body_bytes(resp).await, "{\"n\":2}\n");
    }

    #[tokio::test]
    async fn test_long_poll_times_out_with_no_content() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp, Duration::from_millis(150));

        app.clone()
            .oneshot(post("/v1/stream/idle", Some("application/json"), ""))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let resp = app
            .clone()
            .oneshot(get("/v1/stream/idle?offset=0&live=long-poll"))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            header_str(&resp, proto_streams::STREAM_NEXT_OFFSET),
            "00000000000000000000"
        );
    }

    #[tokio::test]
    async fn test_request_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp, Duration::from_secs(1));

        app.clone()
            .oneshot(post("/v1/stream/s/append", Some("application/json"), "{}"))
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        for req in [
            get("/v1/stream/missing?offset=0"),
            post("/v1/stream/bad%20name", None, ""),
            post("/v1/stream/s/append", None, "{}"),
            post("/v1/stream/s/append", Some("application/json"), "\n\n"),
            get("/v1/stream/s?offset=1"),
            get("/v1/stream/s?offset=abc"),
            get("/v1/stream/s?maxBytes=-1"),
        ] {
            let resp = app.clone().oneshot(req).await.unwrap();
            let status = resp.status().as_u16();
            let body = body_json(resp).await;
            outcomes.push(json!([status, body["error"]]));
        }

        insta::assert_json_snapshot!(outcomes, @r###"
        [
          [
            404,
            "StreamNotFound"
          ],
          [
            400,
            "InvalidName"
          ],
          [
            400,
            "MissingContentType"
          ],
          [
            400,
            "EmptyAppend"
          ],
          [
            400,
            "InvalidOffset"
          ],
          [
            400,
            "InvalidOffset"
          ],
          [
            400,
            "InvalidOffset"
          ]
        ]
        "###);
    }

    #[tokio::test]
    async fn test_head_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp, Duration::from_secs(1));

        app.clone()
            .oneshot(post("/v1/stream/a/b/append", Some("text/plain"), "hello\n"))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("HEAD")
                    .uri("/v1/stream/a/b")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, "content-type"), "text/plain");
        assert_eq!(
            header_str(&resp, proto_streams::STREAM_NEXT_OFFSET),
            "00000000000000000006"
        );

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri("/v1/stream/a/b")
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
