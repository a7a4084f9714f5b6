use crate::bridge::{PageId, PageLink, Report};
use crate::error::ConnectError;
use crate::flow::ConnectForm;
use crate::server::AppState;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: PageId,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub page: Option<PageId>,
}

pub async fn serve_page() -> Html<String> {
    Html(crate::sdk::connect_page())
}

/// Serves `assets/connect.js` when present so the bridge can be iterated on without a rebuild.
pub async fn serve_script() -> impl IntoResponse {
    let script = match tokio::fs::read_to_string("assets/connect.js").await {
        Ok(script) => script,
        Err(_) => crate::sdk::bridge_script(),
    };
    let mut resp = Response::new(script);
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript"),
    );
    resp
}

/// Attaches the caller as a page. The first event tells it the id to tag reports with.
pub async fn directives(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let PageLink { id, directives } = state.bridge.attach();
    let hello = Event::default()
        .event("hello")
        .json_data(json!({ "page": id }))
        .ok();
    let stream = tokio_stream::iter(hello)
        .chain(ReceiverStream::new(directives).filter_map(|directive| {
            match Event::default().event("directive").json_data(&directive) {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::warn!(%err, directive = directive.name(), "unencodable directive");
                    None
                }
            }
        }))
        .map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn post_report(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
    Json(report): Json<Report>,
) -> impl IntoResponse {
    state.bridge.handle_report(query.page, report);
    StatusCode::ACCEPTED
}

pub async fn start_connect(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
    Json(form): Json<ConnectForm>,
) -> impl IntoResponse {
    let Some(guard) = state.flow.try_begin() else {
        state
            .log
            .warning("Connection already in progress; request ignored");
        let err = ConnectError::Busy;
        return (
            StatusCode::CONFLICT,
            Json(json!({ "kind": err.kind(), "error": err.user_label() })),
        )
            .into_response();
    };
    // the submitting page hosts the widget
    if let Some(page) = query.page
        && !state.bridge.focus(page)
    {
        state
            .log
            .warning("The submitting page is no longer attached; using the latest page");
    }
    let flow = state.flow.clone();
    tokio::spawn(async move {
        if let Err(err) = flow.run(guard, form).await {
            tracing::debug!(%err, "connect attempt ended with an error");
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "started": true }))).into_response()
}

pub async fn get_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": state.status.snapshot(),
        "log": state.log.snapshot(),
        "loader": state.loader.state(),
        "inProgress": state.flow.in_progress(),
        "session": state.widgets.current().map(|session| json!({
            "id": session.id(),
            "state": session.state(),
            "result": session.result(),
        })),
        "attachedPages": state.bridge.attached_pages(),
    }))
}
