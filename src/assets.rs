//! Static file resolution.
//!
//! Maps a cleaned request path onto the configured `{URL prefix → directory}`
//! rules and probes an ordered candidate list: the literal file, `try_files`
//! suffixes for extensionless paths, then the directory index. The first
//! candidate that exists on disk wins; if none do, the dispatcher moves on to
//! the next handler.
//!
//! Responses (content-type, `If-Modified-Since`, byte ranges) are produced by
//! `tower-http`'s `ServeFile`, driven once per resolved file.

use crate::config::{Config, StaticRule};
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::warn;

pub struct StaticResolver {
    rules: Vec<StaticRule>,
    try_files: Vec<String>,
    allowed_extensions: HashSet<String>,
}

impl StaticResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            rules: config.static_rules.clone(),
            try_files: config.try_files.clone(),
            allowed_extensions: config.allowed_extensions.clone(),
        }
    }

    /// Resolve `path` to an on-disk file, or `None` ("not found here").
    pub async fn resolve(&self, path: &str) -> Option<PathBuf> {
        for candidate in self.candidates(path) {
            match tokio::fs::metadata(&candidate).await {
                Ok(meta) if meta.is_file() => return Some(candidate),
                _ => continue,
            }
        }
        None
    }

    /// Compute the ordered candidate list without touching the filesystem.
    fn candidates(&self, path: &str) -> Vec<PathBuf> {
        if has_dotdot(path) {
            return Vec::new();
        }

        // Longest matching rule wins.
        let Some(rule) = self
            .rules
            .iter()
            .filter(|r| path.starts_with(r.prefix.as_str()))
            .max_by_key(|r| r.prefix.len())
        else {
            return Vec::new();
        };
        let relative = path[rule.prefix.len()..].trim_start_matches('/');

        let extension = Path::new(relative)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let mut out = Vec::new();
        let mut push = |p: PathBuf| {
            if self.extension_allowed(&p) {
                out.push(p);
            }
        };

        if !relative.is_empty() && !path.ends_with('/') {
            push(rule.root.join(relative));
        }

        if extension.is_none() && !relative.is_empty() && !path.ends_with('/') {
            for suffix in &self.try_files {
                push(rule.root.join(format!("{relative}{suffix}")));
            }
        }

        if path.ends_with('/') || extension.is_none() {
            let dir = if relative.is_empty() {
                rule.root.clone()
            } else {
                rule.root.join(relative)
            };
            push(dir.join("index.html"));
        }

        out
    }

    fn extension_allowed(&self, candidate: &Path) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        candidate
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.allowed_extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

fn has_dotdot(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

/// Serve a resolved file, honouring the request's conditional and range
/// headers. `file` must exist (the resolver checked); I/O races degrade to
/// 404, which is what the file genuinely is by then.
pub async fn serve_file(file: &Path, req: Request<Body>) -> Response<Body> {
    match ServeFile::new(file).oneshot(req).await {
        Ok(resp) => resp.map(Body::new),
        Err(e) => {
            warn!(file = %file.display(), err = %e, "static file serve failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(rules: Vec<StaticRule>, try_files: &[&str], exts: &[&str]) -> StaticResolver {
        StaticResolver {
            rules,
            try_files: try_files.iter().map(|s| s.to_string()).collect(),
            allowed_extensions: exts.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn rule(prefix: &str, root: &str) -> StaticRule {
        StaticRule {
            prefix: prefix.to_string(),
            root: PathBuf::from(root),
        }
    }

    #[test]
    fn literal_candidate_under_longest_rule() {
        let r = resolver(
            vec![rule("/", "/srv/root"), rule("/assets/", "/srv/assets")],
            &[],
            &[],
        );
        let c = r.candidates("/assets/app.js");
        assert_eq!(c, vec![PathBuf::from("/srv/assets/app.js")]);
    }

    #[test]
    fn try_files_suffixes_for_extensionless_paths() {
        let r = resolver(vec![rule("/", "/srv")], &[".html", ".htm"], &[]);
        let c = r.candidates("/about");
        assert_eq!(
            c,
            vec![
                PathBuf::from("/srv/about"),
                PathBuf::from("/srv/about.html"),
                PathBuf::from("/srv/about.htm"),
                PathBuf::from("/srv/about/index.html"),
            ]
        );
    }

    #[test]
    fn directory_requests_get_the_index() {
        let r = resolver(vec![rule("/", "/srv")], &[".html"], &[]);
        assert_eq!(
            r.candidates("/docs/"),
            vec![PathBuf::from("/srv/docs/index.html")]
        );
        assert_eq!(r.candidates("/"), vec![PathBuf::from("/srv/index.html")]);
    }

    #[test]
    fn dotdot_is_rejected() {
        let r = resolver(vec![rule("/", "/srv")], &[".html"], &[]);
        assert!(r.candidates("/../etc/passwd").is_empty());
        assert!(r.candidates("/a/../../etc/passwd").is_empty());
    }

    #[test]
    fn unmatched_prefix_yields_nothing() {
        let r = resolver(vec![rule("/assets/", "/srv/assets")], &[".html"], &[]);
        assert!(r.candidates("/api/data").is_empty());
    }

    #[test]
    fn extension_filter_skips_candidates() {
        let r = resolver(vec![rule("/", "/srv")], &[".html"], &["html", "css"]);
        // `.js` is outside the allow list; the extensionless fallbacks survive.
        assert!(r.candidates("/app.js").is_empty());
        assert_eq!(
            r.candidates("/about"),
            vec![
                PathBuf::from("/srv/about.html"),
                PathBuf::from("/srv/about/index.html"),
            ]
        );
    }

    #[tokio::test]
    async fn resolve_returns_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("about.html"), "<h1>hi</h1>").unwrap();
        let r = resolver(
            vec![rule("/", dir.path().to_str().unwrap())],
            &[".html"],
            &[],
        );
        let resolved = r.resolve("/about").await.unwrap();
        assert_eq!(resolved, dir.path().join("about.html"));
        assert!(r.resolve("/missing").await.is_none());
    }
}
