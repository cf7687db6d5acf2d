//! Static files served next to the relay on the same port.
//!
//! Request paths are percent-decoded and normalized lexically before they
//! touch the filesystem; any path that climbs above the public root is
//! refused. The resolved file is then canonicalized and checked against the
//! canonical root, which also catches symlinks pointing outside it.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};
use wsrelay_settings::PreviewSettings;

/// Cache policy for the default document.
pub const NO_CACHE: &str = "no-cache";
/// Cache policy for every other asset.
pub const LONG_CACHE: &str = "public, max-age=604800";

/// Why a request path was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathRejection {
    /// Not valid UTF-8 after percent-decoding.
    #[error("path is not valid UTF-8")]
    NotUtf8,
    /// Contains a NUL byte or a backslash.
    #[error("path contains a forbidden character")]
    ForbiddenCharacter,
    /// `..` segments climb above the root.
    #[error("path escapes the public root")]
    Escape,
}

/// Normalize a URL path into a relative filesystem path under the root.
///
/// An empty result means the root itself.
pub fn sanitize(request_path: &str) -> Result<PathBuf, PathRejection> {
    let decoded = percent_decode_str(request_path)
        .decode_utf8()
        .map_err(|_| PathRejection::NotUtf8)?;
    if decoded.contains('\0') || decoded.contains('\\') {
        return Err(PathRejection::ForbiddenCharacter);
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathRejection::Escape);
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.iter().collect())
}

/// Content type for a file, by extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("wasm") => "application/wasm",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Meta tags for a link preview card.
pub fn preview_tags(preview: &PreviewSettings) -> String {
    let mut tags = Vec::new();
    let mut meta = |attr: &str, key: &str, value: &str| {
        tags.push(format!(r#"<meta {attr}="{key}" content="{}">"#, escape_attr(value)));
    };
    if let Some(title) = &preview.title {
        meta("property", "og:title", title);
        meta("name", "twitter:title", title);
    }
    if let Some(description) = &preview.description {
        meta("name", "description", description);
        meta("property", "og:description", description);
        meta("name", "twitter:description", description);
    }
    if let Some(image) = &preview.image {
        meta("property", "og:image", image);
        meta("name", "twitter:image", image);
        meta("name", "twitter:card", "summary_large_image");
    }
    if let Some(url) = &preview.url {
        meta("property", "og:url", url);
    }
    if !tags.is_empty() {
        tags.push(r#"<meta property="og:type" content="website">"#.to_string());
    }
    tags.join("\n")
}

/// Insert preview tags right before `</head>`. Documents without a head
/// element are returned unchanged.
pub fn inject_preview(html: &str, preview: &PreviewSettings) -> String {
    let tags = preview_tags(preview);
    if tags.is_empty() {
        return html.to_string();
    }
    // ASCII lowercasing keeps byte offsets intact.
    let Some(at) = html.to_ascii_lowercase().find("</head>") else {
        return html.to_string();
    };
    let mut out = String::with_capacity(html.len() + tags.len() + 1);
    out.push_str(&html[..at]);
    out.push_str(&tags);
    out.push('\n');
    out.push_str(&html[at..]);
    out
}

/// File server rooted at the public directory.
#[derive(Clone, Debug)]
pub struct StaticFiles {
    root: PathBuf,
    default_document: String,
    preview: Option<PreviewSettings>,
}

/// A request path mapped onto the filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// Canonical path of the file to serve.
    pub path: PathBuf,
    /// Whether this is the default document.
    pub is_default: bool,
}

impl StaticFiles {
    /// Serve files under `root`, falling back to `default_document`.
    pub fn new(
        root: impl Into<PathBuf>,
        default_document: impl Into<String>,
        preview: Option<PreviewSettings>,
    ) -> Self {
        Self {
            root: root.into(),
            default_document: default_document.into(),
            preview,
        }
    }

    /// Map a request path to a file, or `Ok(None)` when even the default
    /// document is missing.
    pub async fn resolve(&self, request_path: &str) -> Result<Option<Resolved>, PathRejection> {
        let relative = sanitize(request_path)?;
        let Ok(root) = tokio::fs::canonicalize(&self.root).await else {
            return Ok(None);
        };

        if !relative.as_os_str().is_empty() {
            let candidate = root.join(&relative);
            if let Ok(path) = tokio::fs::canonicalize(&candidate).await {
                if !path.starts_with(&root) {
                    return Err(PathRejection::Escape);
                }
                if is_file(&path).await {
                    let is_default = path == root.join(&self.default_document);
                    return Ok(Some(Resolved { path, is_default }));
                }
            }
        }

        let fallback = root.join(&self.default_document);
        match tokio::fs::canonicalize(&fallback).await {
            Ok(path) if path.starts_with(&root) && is_file(&path).await => Ok(Some(Resolved {
                path,
                is_default: true,
            })),
            _ => Ok(None),
        }
    }

    /// Answer a GET or HEAD for `request_path`.
    pub async fn serve(&self, method: &Method, request_path: &str) -> Response {
        if method != Method::GET && method != Method::HEAD {
            return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
        }
        let resolved = match self.resolve(request_path).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return (StatusCode::NOT_FOUND, "Not Found").into_response(),
            Err(rejection) => {
                warn!(path = request_path, %rejection, "rejected static path");
                return (StatusCode::FORBIDDEN, "Forbidden").into_response();
            }
        };

        let contents = match tokio::fs::read(&resolved.path).await {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %resolved.path.display(), error = %err, "failed to read static file");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
            }
        };
        let mime = content_type(&resolved.path);
        let contents = match (&self.preview, mime.starts_with("text/html")) {
            (Some(preview), true) => {
                inject_preview(&String::from_utf8_lossy(&contents), preview).into_bytes()
            }
            _ => contents,
        };
        debug!(path = %resolved.path.display(), bytes = contents.len(), "static file");

        let cache = if resolved.is_default { NO_CACHE } else { LONG_CACHE };
        let length = contents.len();
        let body = if method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(contents)
        };
        let mut response = Response::new(body);
        let headers = response.headers_mut();
        let _ = headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
        let _ = headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache));
        let _ = headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        response
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::to_bytes;

    fn public_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.html"),
            "<html><head><title>t</title></head><body>home</body></html>",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/app.js"), "console.log(1)").unwrap();
        dir
    }

    #[test]
    fn sanitize_normalizes_dots() {
        assert_eq!(sanitize("/").unwrap(), PathBuf::new());
        assert_eq!(sanitize("/a/./b/../c.js").unwrap(), PathBuf::from("a/c.js"));
        assert_eq!(sanitize("//assets//app.js").unwrap(), PathBuf::from("assets/app.js"));
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(sanitize("/../../etc/passwd"), Err(PathRejection::Escape));
        assert_eq!(sanitize("/a/../../etc/passwd"), Err(PathRejection::Escape));
        assert_eq!(sanitize("/..%2f..%2fetc%2fpasswd"), Err(PathRejection::Escape));
        assert_eq!(sanitize("/%2e%2e/%2e%2e/etc/passwd"), Err(PathRejection::Escape));
    }

    #[test]
    fn sanitize_rejects_backslash_and_nul() {
        assert_eq!(sanitize("/..\\..\\etc"), Err(PathRejection::ForbiddenCharacter));
        assert_eq!(sanitize("/a%00.html"), Err(PathRejection::ForbiddenCharacter));
        assert_eq!(sanitize("/%ff"), Err(PathRejection::NotUtf8));
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type(Path::new("index.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("a/app.js")), "text/javascript; charset=utf-8");
        assert_eq!(content_type(Path::new("game.wasm")), "application/wasm");
        assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn preview_is_injected_before_head_close() {
        let preview = PreviewSettings {
            title: Some("Relay \"Arena\"".into()),
            image: Some("https://cdn.example/card.png".into()),
            ..PreviewSettings::default()
        };
        let html = inject_preview("<html><HEAD><title>x</title></HEAD><body></body></html>", &preview);
        let head_close = html.find("</HEAD>").unwrap();
        let og_title = html.find(r#"<meta property="og:title" content="Relay &quot;Arena&quot;">"#).unwrap();
        assert!(og_title < head_close);
        assert!(html.contains(r#"<meta name="twitter:card" content="summary_large_image">"#));
    }

    #[test]
    fn preview_without_head_is_unchanged() {
        let preview = PreviewSettings {
            title: Some("t".into()),
            ..PreviewSettings::default()
        };
        assert_eq!(inject_preview("<p>fragment</p>", &preview), "<p>fragment</p>");
        assert_eq!(
            inject_preview("<head></head>", &PreviewSettings::default()),
            "<head></head>"
        );
    }

    #[tokio::test]
    async fn traversal_never_leaves_root() {
        let dir = public_dir();
        let files = StaticFiles::new(dir.path(), "index.html", None);
        assert_eq!(
            files.resolve("/../../etc/passwd").await,
            Err(PathRejection::Escape)
        );
        // A path that normalizes inside the root but names nothing falls back.
        let resolved = files.resolve("/assets/../etc/passwd").await.unwrap().unwrap();
        assert!(resolved.is_default);
        assert!(resolved.path.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_root_is_rejected() {
        let dir = public_dir();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("leak.txt")).unwrap();

        let files = StaticFiles::new(dir.path(), "index.html", None);
        assert_eq!(files.resolve("/leak.txt").await, Err(PathRejection::Escape));
    }

    #[tokio::test]
    async fn assets_get_long_cache_and_default_gets_no_cache() {
        let dir = public_dir();
        let files = StaticFiles::new(dir.path(), "index.html", None);

        let asset = files.serve(&Method::GET, "/assets/app.js").await;
        assert_eq!(asset.status(), StatusCode::OK);
        assert_eq!(asset.headers()[header::CACHE_CONTROL], LONG_CACHE);
        assert_eq!(asset.headers()[header::CONTENT_TYPE], "text/javascript; charset=utf-8");

        let unknown = files.serve(&Method::GET, "/no/such/page").await;
        assert_eq!(unknown.status(), StatusCode::OK);
        assert_eq!(unknown.headers()[header::CACHE_CONTROL], NO_CACHE);
        let body = to_bytes(unknown.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("home"));
    }

    #[tokio::test]
    async fn head_has_headers_but_no_body() {
        let dir = public_dir();
        let files = StaticFiles::new(dir.path(), "index.html", None);
        let response = files.serve(&Method::HEAD, "/assets/app.js").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "14");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn traversal_request_is_forbidden() {
        let dir = public_dir();
        let files = StaticFiles::new(dir.path(), "index.html", None);
        let response = files.serve(&Method::GET, "/..%2f..%2fetc%2fpasswd").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let files = StaticFiles::new("/definitely/not/here", "index.html", None);
        let response = files.serve(&Method::GET, "/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn post_is_not_allowed() {
        let dir = public_dir();
        let files = StaticFiles::new(dir.path(), "index.html", None);
        let response = files.serve(&Method::POST, "/").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn served_html_carries_preview() {
        let dir = public_dir();
        let preview = PreviewSettings {
            description: Some("Play now".into()),
            ..PreviewSettings::default()
        };
        let files = StaticFiles::new(dir.path(), "index.html", Some(preview));
        let response = files.serve(&Method::GET, "/").await;
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains(r#"<meta name="description" content="Play now">"#));
    }
}
