// outpost: Built-in HTTP endpoint handlers

use crate::httpd::{HttpState, HTTP_COMMAND_TIMEOUT_SEC};
use crate::pipeline::Command;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Router};
use chrono::SecondsFormat;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Placeholders substituted into the index template at serve time
pub const INDEX_PLACEHOLDER_CLIENT_ADDR: &str = "#LAITOS_CLIENTADDR";
pub const INDEX_PLACEHOLDER_RFC3339_TIME: &str = "#LAITOS_3339TIME";

pub fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Static index: the template file is re-read on every request so edits show
/// up without a restart.
pub async fn handle_index(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let template_path = &state.handlers.index_endpoint_config.html_file_path;
    match tokio::fs::read_to_string(template_path).await {
        Ok(template) => {
            let page = template
                .replace(INDEX_PLACEHOLDER_CLIENT_ADDR, &addr.ip().to_string())
                .replace(
                    INDEX_PLACEHOLDER_RFC3339_TIME,
                    &chrono::Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
                );
            ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], page).into_response()
        }
        Err(err) => {
            state
                .logger
                .warning("handle_index", template_path, &format!("cannot read template - {}", err));
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Mount a directory at a URL prefix: the prefix itself lists the directory,
/// anything below it serves files (or nested listings).
pub fn directory_routes(router: Router<HttpState>, url_prefix: &str, fs_path: &str) -> Router<HttpState> {
    let root = PathBuf::from(fs_path);
    let listing_root = root.clone();
    router
        .route(
            url_prefix,
            get(move || {
                let dir = listing_root.clone();
                async move { render_directory(&dir).await }
            }),
        )
        .route(
            &format!("{}/*path", url_prefix),
            get(move |Path(rest): Path<String>| {
                let dir = root.clone();
                async move { serve_directory_entry(&dir, &rest).await }
            }),
        )
}

async fn render_directory(dir: &PathBuf) -> Response {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        entries.push(name);
    }
    entries.sort();
    let mut page = String::from("<pre>\n");
    for name in entries {
        page.push_str(&format!("<a href=\"{0}\">{0}</a>\n", name));
    }
    page.push_str("</pre>\n");
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], page).into_response()
}

fn content_type_by_extension(path: &PathBuf) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

async fn serve_directory_entry(root: &PathBuf, rest: &str) -> Response {
    // Keep requests inside the mounted directory
    if rest.split('/').any(|part| part == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let full = root.join(rest.trim_start_matches('/'));
    if full.is_dir() {
        return render_directory(&full).await;
    }
    match tokio::fs::read(&full).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type_by_extension(&full))],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn command_form_page(output: &str) -> Html<String> {
    Html(format!(
        r##"<html>
<head><title>outpost command form</title></head>
<body>
    <form action="#" method="post">
        <p><input type="password" name="cmd" size="80" /></p>
        <p><input type="submit" value="submit" /></p>
        <pre>{}</pre>
    </form>
</body>
</html>
"##,
        html_escape(output)
    ))
}

pub async fn handle_command_form(State(_state): State<HttpState>) -> Html<String> {
    command_form_page("")
}

#[derive(Deserialize)]
pub struct CommandFormSubmission {
    #[serde(default)]
    pub cmd: String,
}

pub async fn handle_command_form_submit(
    State(state): State<HttpState>,
    Form(submission): Form<CommandFormSubmission>,
) -> Response {
    if submission.cmd.is_empty() {
        return command_form_page("").into_response();
    }
    let Some(pipeline) = &state.pipeline else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let (_, result) = pipeline
        .transform(Command::new(
            submission.cmd,
            HTTP_COMMAND_TIMEOUT_SEC,
            "httpd",
        ))
        .await;
    command_form_page(&result.combined_text).into_response()
}

fn mail_me_page(status: &str) -> Html<String> {
    Html(format!(
        r##"<html>
<head><title>outpost mail me</title></head>
<body>
    <form action="#" method="post">
        <p><textarea name="msg" rows="6" cols="60"></textarea></p>
        <p><input type="submit" value="submit" /></p>
        <p>{}</p>
    </form>
</body>
</html>
"##,
        html_escape(status)
    ))
}

pub async fn handle_mail_me(State(_state): State<HttpState>) -> Html<String> {
    mail_me_page("")
}

#[derive(Deserialize)]
pub struct MailMeSubmission {
    #[serde(default)]
    pub msg: String,
}

pub async fn handle_mail_me_submit(
    State(state): State<HttpState>,
    Form(submission): Form<MailMeSubmission>,
) -> Html<String> {
    if submission.msg.is_empty() {
        return mail_me_page("");
    }
    let recipients = &state.handlers.mail_me_endpoint_config.recipients;
    match state
        .mailer
        .send("Mail me on outpost", &submission.msg, recipients)
        .await
    {
        Ok(()) => mail_me_page("Message has been sent"),
        Err(err) => {
            state
                .logger
                .warning("handle_mail_me", "", &format!("failed to send - {}", err));
            mail_me_page("Message could not be sent")
        }
    }
}

#[derive(Deserialize)]
pub struct WebProxyRequest {
    pub u: String,
}

/// Fetch the named page and return it; an HTML payload gets a base tag so
/// that relative links keep working from behind the proxy.
pub async fn handle_web_proxy(
    State(state): State<HttpState>,
    Query(request): Query<WebProxyRequest>,
) -> Response {
    let upstream = match state.http_client.get(request.u.as_str()).send().await {
        Ok(response) => response,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error: {}", err),
            )
                .into_response();
        }
    };
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    // reqwest and axum disagree on http crate versions, so go through &str
    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error: {}", err),
            )
                .into_response();
        }
    };
    if content_type.starts_with("text/html") {
        let page = String::from_utf8_lossy(&body);
        let base_tag = format!("<base href=\"{}\"/>", html_escape(&request.u));
        let rewritten = match page.find("<head>") {
            Some(position) => {
                let mut page = page.into_owned();
                page.insert_str(position + "<head>".len(), &base_tag);
                page
            }
            None => page.into_owned(),
        };
        return (status, [(header::CONTENT_TYPE, content_type)], rewritten).into_response();
    }
    (status, [(header::CONTENT_TYPE, content_type)], body.to_vec()).into_response()
}

/// Run every feature's self test; success is an empty 200.
pub async fn handle_self_test(State(state): State<HttpState>) -> Response {
    let failures = state.features.self_test_all().await;
    if failures.is_empty() {
        return StatusCode::OK.into_response();
    }
    let mut page = String::new();
    for (trigger, err) in failures {
        page.push_str(&format!("{}: {}<br/>\n", trigger, err));
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        page,
    )
        .into_response()
}

/// Runtime diagnostics in plain text.
pub async fn handle_info(State(state): State<HttpState>) -> Response {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let page = format!(
        "Clock: {}\nUptime: {}s\nHostname: {}\nCPUs: {}\nPID: {}\nFeatures: {}\n",
        chrono::Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        state.started_at.elapsed().as_secs(),
        host,
        num_cpus::get(),
        std::process::id(),
        state.features.triggers().join(" "),
    );
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], page).into_response()
}
