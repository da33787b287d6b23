use crate::pipeline::Pipeline;
use clap::ValueEnum;
use log::{error, info, warn};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Route and field names of the JSON endpoint. Two client integrations exist
/// and neither can be changed, so both shapes are kept.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiProfile {
    /// `POST /extract_plate {"url"}` -> `{"plate_text"}`
    Standard,
    /// `POST /extractNumber {"imageUrl"}` -> `{"numberPlate"}`
    Express,
}

impl ApiProfile {
    pub fn path(self) -> &'static str {
        match self {
            ApiProfile::Standard => "extract_plate",
            ApiProfile::Express => "extractNumber",
        }
    }

    pub fn request_field(self) -> &'static str {
        match self {
            ApiProfile::Standard => "url",
            ApiProfile::Express => "imageUrl",
        }
    }

    pub fn response_field(self) -> &'static str {
        match self {
            ApiProfile::Standard => "plate_text",
            ApiProfile::Express => "numberPlate",
        }
    }
}

const TEST_FORM: &str = r#"<html>
    <head>
        <title>License Plate Extractor Test</title>
    </head>
    <body>
        <h2>Enter an Image URL to Extract License Plate</h2>
        <form action="/test" method="post">
            <input type="text" name="url" style="width:400px;" placeholder="Enter image URL here" required>
            <input type="submit" value="Extract">
        </form>
    </body>
</html>
"#;

pub async fn run(
    addr: SocketAddr,
    profile: ApiProfile,
    pipeline: Arc<Pipeline>,
) -> Result<(), failure::Error> {
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
    };
    let (bound, server) =
        warp::serve(routes(profile, pipeline)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!("Listening on {} (POST /{}, GET /test)", bound, profile.path());
    server.await;
    Ok(())
}

pub fn routes(
    profile: ApiProfile,
    pipeline: Arc<Pipeline>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let with_pipeline = warp::any().map(move || pipeline.clone());

    let extract = warp::post()
        .and(warp::path(profile.path()))
        .and(warp::path::end())
        .and(warp::body::json::<Value>())
        .and(warp::any().map(move || profile))
        .and(with_pipeline.clone())
        .and_then(handle_extract);

    let form = warp::path!("test").and(warp::get()).map(|| warp::reply::html(TEST_FORM));

    let submit = warp::path!("test")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(with_pipeline)
        .and_then(handle_submit);

    extract.or(form).or(submit).recover(handle_rejection)
}

async fn handle_extract(
    body: Value,
    profile: ApiProfile,
    pipeline: Arc<Pipeline>,
) -> Result<Response, Infallible> {
    let field = profile.request_field();
    let url = match body[field].as_str() {
        Some(url) => url,
        None => {
            warn!("Request body has no string field {}", field);
            return Ok(detail(
                &format!("Missing string field '{}' in request body", field),
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    match pipeline.process(url).await {
        Ok(text) => {
            let mut reply = Map::new();
            reply.insert(profile.response_field().to_string(), Value::String(text));
            Ok(warp::reply::json(&reply).into_response())
        }
        Err(e) => Ok(detail(&e.to_string(), StatusCode::BAD_REQUEST)),
    }
}

async fn handle_submit(
    form: HashMap<String, String>,
    pipeline: Arc<Pipeline>,
) -> Result<Response, Infallible> {
    let result = match form.get("url") {
        Some(url) => pipeline.process(url.trim()).await.map_err(|e| e.to_string()),
        None => Err("Missing form field 'url'".to_string()),
    };
    let reply = match result {
        Ok(text) => warp::reply::html(result_page(&text)).into_response(),
        Err(message) => {
            let page = warp::reply::html(error_page(&message));
            warp::reply::with_status(page, StatusCode::BAD_REQUEST).into_response()
        }
    };
    Ok(reply)
}

async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    if rejection.is_not_found() {
        return Ok(detail("Not Found", StatusCode::NOT_FOUND));
    }
    if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(detail(&format!("Invalid request body: {}", e), StatusCode::BAD_REQUEST));
    }
    if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(detail("Method Not Allowed", StatusCode::METHOD_NOT_ALLOWED));
    }
    warn!("Unhandled rejection: {:?}", rejection);
    Ok(detail("Bad Request", StatusCode::BAD_REQUEST))
}

fn detail(message: &str, status: StatusCode) -> Response {
    let body = warp::reply::json(&json!({ "detail": message }));
    warp::reply::with_status(body, status).into_response()
}

fn result_page(text: &str) -> String {
    format!(
        r#"<html>
    <head>
        <title>Extraction Result</title>
    </head>
    <body>
        <h2>Extraction Result</h2>
        <p><strong>License Plate Text:</strong> {}</p>
        <a href="/test">Try another image</a>
    </body>
</html>
"#,
        escape_html(text)
    )
}

fn error_page(message: &str) -> String {
    format!(
        r#"<html>
    <head>
        <title>Error</title>
    </head>
    <body>
        <h2>Error Occurred</h2>
        <p>{}</p>
        <a href="/test">Go Back</a>
    </body>
</html>
"#,
        escape_html(message)
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
