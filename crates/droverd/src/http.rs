//! The HTTP control plane.
//!
//! Two surfaces, both answered by the engine:
//!
//! - `GET /status` - fleet overview, HTML table or JSON (`?json` or
//!   `Accept: application/json`).
//! - `GET|POST /ctrl/{client}/{action}` - run an exported action on a
//!   device. Query-string pairs and a JSON object body merge into the
//!   parameter map handed to the action; the action's result becomes the
//!   response.
//!
//! Engine calls are synchronous (they hold the client's lock and sleep
//! between coroutine steps), so every one runs on the blocking pool.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use drovercore::{ClientStatus, Engine};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/status/{*rest}", get(status_trailing))
        .route("/ctrl/{client}", get(ctrl_bare).post(ctrl_bare))
        .route("/ctrl/{client}/", get(ctrl_default).post(ctrl_default))
        .route("/ctrl/{client}/{action}", get(ctrl_action).post(ctrl_action))
        .with_state(engine)
}

fn moved_permanently(to: String) -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, to)]).into_response()
}

// ---- /status --------------------------------------------------------

async fn status(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let rows = match task::spawn_blocking(move || engine.status_rows()).await {
        Ok(rows) => rows,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let wants_json = query.contains_key("json")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|a| a.contains("application/json"));

    if wants_json {
        Json(rows).into_response()
    } else {
        Html(render_status_html(&rows)).into_response()
    }
}

async fn status_trailing(Path(_rest): Path<String>) -> Response {
    moved_permanently("/status".to_string())
}

fn render_status_html(rows: &[ClientStatus]) -> String {
    let mut out = String::from("<html><body>\n");
    out.push_str("(This page is also available as <a href=\"?json\">JSON</a>)<br />\n");
    out.push_str(&format!("{} clients configured:<br />\n", rows.len()));
    out.push_str("<table border=\"1\"><tr>");
    for h in [
        "Name",
        "Host",
        "Port",
        "Connection state",
        "Time in state",
        "Device status",
        "Link",
    ] {
        out.push_str(&format!("<th>{h}</th>"));
    }
    out.push_str("</tr>\n");
    for row in rows {
        out.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td><a href=\"{}\">Go</a></td></tr>\n",
            row.name, row.host, row.port, row.cstate, row.cstate_time, row.status, row.link
        ));
    }
    out.push_str("</table></body></html>\n");
    out
}

// ---- /ctrl ----------------------------------------------------------

async fn ctrl_bare(Path(client): Path<String>) -> Response {
    moved_permanently(format!("/ctrl/{client}/"))
}

async fn ctrl_default(
    state: State<Arc<Engine>>,
    Path(client): Path<String>,
    query: Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_ctrl(state.0, client, "detail".to_string(), query.0, headers, &body).await
}

async fn ctrl_action(
    state: State<Arc<Engine>>,
    Path((client, action)): Path<(String, String)>,
    query: Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_ctrl(state.0, client, action, query.0, headers, &body).await
}

async fn run_ctrl(
    engine: Arc<Engine>,
    client: String,
    action: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: &[u8],
) -> Response {
    let body_is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("application/json"));

    let params = match merge_params(query, body, body_is_json) {
        Ok(p) => p,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    let outcome =
        task::spawn_blocking(move || engine.query(&client, &action, params.as_ref())).await;
    let result = match outcome {
        Ok(r) => r,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    match result {
        Err(e) => {
            let code = StatusCode::from_u16(e.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (code, e.to_string()).into_response()
        }
        Ok(res) => {
            let code = StatusCode::from_u16(res.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if res.error || code.as_u16() >= 400 {
                (code, res.text).into_response()
            } else {
                let content_type = if res.content_type.is_empty() {
                    "text/plain; charset=utf-8".to_string()
                } else {
                    res.content_type
                };
                (code, [(header::CONTENT_TYPE, content_type)], res.text).into_response()
            }
        }
    }
}

/// Merge query-string pairs and a JSON object body into one parameter
/// map; query pairs win. `None` when there are no parameters at all.
fn merge_params(
    query: HashMap<String, String>,
    body: &[u8],
    body_is_json: bool,
) -> Result<Option<Value>, &'static str> {
    let mut map = serde_json::Map::new();

    if body_is_json && !body.is_empty() {
        let parsed: Value = serde_json::from_slice(body).map_err(|_| "Bad JSON")?;
        match parsed {
            Value::Object(obj) => map.extend(obj),
            _ => return Err("Expected a JSON object"),
        }
    }

    for (k, v) in query {
        map.insert(k, Value::String(v));
    }

    if map.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Value::Object(map)))
    }
}
