//! Serving of source images and diff images.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Response, StatusCode, header};

use pixeldiff_service::metric;

use crate::service::Service;

/// How long clients may cache a served image. Images are content-addressed,
/// so they never change for a given URL.
const CACHE_CONTROL_MAX_AGE: &str = "public, max-age=43200";

/// Serves images and diffs under the configured prefix.
///
/// The path has the shape `{images|diffs}/{id}.png`. Anything that cannot be
/// served, from a malformed path to a failed remote fetch, turns into a 404
/// that downstream caches are told not to hold on to, so a digest that
/// becomes available later is not shadowed by a stale negative response.
pub async fn serve_image(
    State(service): State<Service>,
    Path(path): Path<String>,
) -> Response<Body> {
    let Some((kind, id)) = parse_path(&path) else {
        return not_found();
    };

    let result = match kind {
        "images" => service.image_png(id).await,
        "diffs" => service.diff_png(id).await,
        _ => return not_found(),
    };

    match result {
        Ok(bytes) => png_response(bytes),
        Err(err) => {
            metric!(counter("serve.miss") += 1, "kind" => kind);
            tracing::debug!(path, error = %err, "failed to serve image");
            not_found()
        }
    }
}

/// Splits a request path into its kind and the id, accepting only the
/// two-segment `{kind}/{id}.png` shape.
fn parse_path(path: &str) -> Option<(&str, &str)> {
    let (kind, file) = path.split_once('/')?;
    if file.contains('/') {
        return None;
    }
    let id = file.strip_suffix(".png")?;
    if id.is_empty() {
        return None;
    }
    Some((kind, id))
}

fn png_response(bytes: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_MAX_AGE),
    );
    response
}

/// A 404 response that instructs clients not to cache the miss.
fn not_found() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_FOUND;
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}
