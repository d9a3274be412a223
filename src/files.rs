// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Static file responses for a mocked host: GET/HEAD only, index.html for
//! directories, no listings.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.html";

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"Internal Server Error"))))
}

/// Resolve a request target to a path relative to the served root.
/// Traversal components and anything path-separator-shaped are rejected.
fn sanitize_target(target: &str) -> Option<PathBuf> {
    if target.contains('\0') || target.contains('%') || target.contains('\\') {
        return None;
    }

    let mut clean = PathBuf::new();
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => return None,
            component => clean.push(component),
        }
    }
    Some(clean)
}

/// Answer one request against the directory mapped for the host.
pub async fn respond(root: &Path, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let head_only = match *req.method() {
        Method::GET => false,
        Method::HEAD => true,
        _ => {
            let mut resp = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            if let Ok(allow) = "GET, HEAD".parse() {
                resp.headers_mut().insert(ALLOW, allow);
            }
            return resp;
        }
    };

    let Some(relative) = sanitize_target(req.uri().path()) else {
        return text_response(StatusCode::BAD_REQUEST, "invalid request path");
    };

    let mut full_path = root.join(relative);

    let metadata = match tokio::fs::metadata(&full_path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return text_response(StatusCode::NOT_FOUND, "not found");
        }
        Err(e) => {
            tracing::error!(path = %full_path.display(), error = %e, "failed to stat file");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };

    if metadata.is_dir() {
        full_path = full_path.join(INDEX_FILE);
    }

    let body = match tokio::fs::read(&full_path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return text_response(StatusCode::NOT_FOUND, "not found");
        }
        Err(e) => {
            tracing::error!(path = %full_path.display(), error = %e, "failed to read file");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };

    let mime = mime_guess::from_path(&full_path).first_or_octet_stream();
    let body = if head_only { Vec::new() } else { body };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime.as_ref())
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_target() {
        assert_eq!(sanitize_target("/"), Some(PathBuf::new()));
        assert_eq!(
            sanitize_target("/css/site.css"),
            Some(PathBuf::from("css/site.css"))
        );
        assert_eq!(sanitize_target("//a///b"), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize_target("/./a"), Some(PathBuf::from("a")));

        assert_eq!(sanitize_target("/../etc/passwd"), None);
        assert_eq!(sanitize_target("/a/../../b"), None);
        assert_eq!(sanitize_target("/%2e%2e/x"), None);
        assert_eq!(sanitize_target("/a\\b"), None);
    }
}
