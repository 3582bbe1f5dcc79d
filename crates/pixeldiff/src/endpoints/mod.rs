use axum::Router;
use axum::routing::get;

use pixeldiff_service::metric;

use crate::service::Service;

mod images;
mod metrics;

use images::serve_image;
use metrics::MetricsLayer;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: Service) -> Router {
    let prefix = service.config().url_prefix.trim_end_matches('/').to_owned();

    Router::new()
        .route(&format!("{prefix}/{{*path}}"), get(serve_image))
        .with_state(service)
        .layer(MetricsLayer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use pixeldiff_service::caching::{PRIORITY_NOW, Priority};
    use pixeldiff_service::config::Config;
    use pixeldiff_service::mapper::{DiffMapper, PixelDiffMapper};

    use pixeldiff_test as test;

    use super::*;

    const CACHE_FOREVER: &str = "public, max-age=43200";
    const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

    /// Spawns a full service stack with a stand-in bucket server behind it.
    async fn serve(
        base_dir: &std::path::Path,
        bucket_dir: &std::path::Path,
    ) -> (test::Server, test::Server, Service) {
        let bucket = test::Server::files(bucket_dir).await;
        let config = Config {
            base_dir: base_dir.to_path_buf(),
            image_base_url: bucket.url("/"),
            buckets: vec!["test-bucket".to_owned()],
            remote_image_dir: "dm-images-v1".to_owned(),
            budget_gigs: 1.0,
            concurrency: Some(2),
            ..Config::default()
        };
        let service = Service::create(config).unwrap();
        let app = test::Server::with_router(create_app(service.clone())).await;
        (app, bucket, service)
    }

    fn put_bucket_image(bucket_dir: &std::path::Path, digest: &str, color: [u8; 4]) {
        let dir = bucket_dir.join("test-bucket/dm-images-v1");
        std::fs::create_dir_all(&dir).unwrap();
        let png = test::png_bytes(&test::solid_image(4, 4, color));
        std::fs::write(dir.join(format!("{digest}.png")), png).unwrap();
    }

    #[tokio::test]
    async fn test_healthcheck() {
        test::setup();
        let base_dir = test::tempdir();
        let bucket_dir = test::tempdir();
        let (app, _bucket, _service) = serve(base_dir.path(), bucket_dir.path()).await;

        let response = reqwest::get(app.url("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_serve_images() {
        test::setup();
        let base_dir = test::tempdir();
        let bucket_dir = test::tempdir();
        let digest = test::digest(0x10);
        put_bucket_image(bucket_dir.path(), &digest, [9, 9, 9, 255]);

        let (app, _bucket, _service) = serve(base_dir.path(), bucket_dir.path()).await;

        let response = reqwest::get(app.url(&format!("/img/images/{digest}.png")))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.headers()["cache-control"], CACHE_FOREVER);
        assert_eq!(response.headers()["content-type"], "image/png");
        let body = response.bytes().await.unwrap();
        assert_eq!(
            body.as_ref(),
            test::png_bytes(&test::solid_image(4, 4, [9, 9, 9, 255]))
        );
    }

    #[tokio::test]
    async fn test_serve_diffs() {
        test::setup();
        let base_dir = test::tempdir();
        let bucket_dir = test::tempdir();
        let left = test::digest(0x20);
        let right = test::digest(0x30);
        put_bucket_image(bucket_dir.path(), &left, [0, 0, 0, 255]);
        put_bucket_image(bucket_dir.path(), &right, [255, 255, 255, 255]);

        let (app, _bucket, service) = serve(base_dir.path(), bucket_dir.path()).await;

        // Compute the diff so its image lands on disk.
        let mapper = PixelDiffMapper::new("dm-images-v1");
        let id = mapper.diff_id(&left, &right);
        service
            .store()
            .get(Priority::new(PRIORITY_NOW), &left, &[right.clone()])
            .await
            .unwrap();
        service.store().sync_writes().await;

        let response = reqwest::get(app.url(&format!("/img/diffs/{id}.png")))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.headers()["cache-control"], CACHE_FOREVER);
        assert_eq!(response.headers()["content-type"], "image/png");

        // Only the canonical (sorted) id form is served; the mirrored form
        // of the same pair is rejected.
        let (first, second) = id.split_once('-').unwrap();
        let response = reqwest::get(app.url(&format!("/img/diffs/{second}-{first}.png")))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["cache-control"], NO_CACHE);
    }

    #[tokio::test]
    async fn test_not_found() {
        test::setup();
        let base_dir = test::tempdir();
        let bucket_dir = test::tempdir();
        let (app, _bucket, _service) = serve(base_dir.path(), bucket_dir.path()).await;

        // A missing image is a 404 that must not be cached downstream.
        let digest = test::digest(0x42);
        let response = reqwest::get(app.url(&format!("/img/images/{digest}.png")))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["cache-control"], NO_CACHE);

        for path in [
            // unknown kind
            "/img/movies/abc.png",
            // nested path
            "/img/images/extra/abc.png",
            // wrong extension
            "/img/images/abc.jpg",
            // malformed digest
            "/img/images/not-a-digest.png",
        ] {
            let response = reqwest::get(app.url(path)).await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn test_image_download_is_shared() {
        test::setup();
        let base_dir = test::tempdir();
        let bucket_dir = test::tempdir();
        let digest = test::digest(0x55);
        put_bucket_image(bucket_dir.path(), &digest, [1, 1, 1, 255]);

        let (app, _bucket, _service) = serve(base_dir.path(), bucket_dir.path()).await;

        let url = app.url(&format!("/img/images/{digest}.png"));
        let requests = (0..4).map(|_| reqwest::get(url.clone()));
        for response in futures::future::join_all(requests).await {
            assert_eq!(response.unwrap().status(), reqwest::StatusCode::OK);
        }
    }
}
