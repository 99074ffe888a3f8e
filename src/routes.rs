use crate::captioner::Captioner;
use crate::error::CaptionError;
use crate::load_image::decode_image;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::response::{Html, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, info};

/// Name of the multipart field holding the upload.
const FILE_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
    pub captioner: Arc<dyn Captioner>,
    pub device: String,
}

#[derive(Debug, Serialize)]
pub struct CaptionResponse {
    pub caption: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub device: String,
}

pub fn router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/", get(show_form))
        .route("/caption", post(create_caption))
        .route("/health", get(health))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

async fn show_form() -> Html<&'static str> {
    Html(
        r#"
        <!doctype html>
        <html>
            <head></head>
            <body>
                <form action="/caption" method="post" enctype="multipart/form-data">
                    <label>
                        Upload image:
                        <input type="file" name="file" accept="image/*">
                    </label>

                    <input type="submit" value="Caption">
                </form>
            </body>
        </html>
        "#,
    )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: true,
        device: state.device,
    })
}

async fn create_caption(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CaptionResponse>, CaptionError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(CaptionError::Multipart)?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        if !content_type.starts_with("image/") {
            return Err(CaptionError::NotAnImage);
        }

        let data = field.bytes().await.map_err(CaptionError::Upload)?;
        debug!(
            "Length of `{file_name}` (`{content_type}`) is {} bytes",
            data.len()
        );

        // decoding and generation are compute bound, keep them off the async workers
        let captioner = state.captioner.clone();
        let caption = tokio::task::spawn_blocking(move || -> Result<String, CaptionError> {
            let image = decode_image(&data)?;
            captioner.caption(&image).map_err(CaptionError::Inference)
        })
        .await
        .map_err(|err| CaptionError::Inference(err.into()))??;

        info!("Generated caption: {caption}");
        return Ok(Json(CaptionResponse { caption }));
    }

    Err(CaptionError::MissingFile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use image::{ImageFormat, RgbImage};
    use serde_json::Value;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const BOUNDARY: &str = "caption-test-boundary";

    struct FakeCaptioner {
        calls: AtomicUsize,
        reply: Result<&'static str, &'static str>,
    }

    impl FakeCaptioner {
        fn new(reply: Result<&'static str, &'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Captioner for FakeCaptioner {
        fn caption(&self, _image: &RgbImage) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Ok(caption) => Ok(caption.to_string()),
                Err(message) => Err(anyhow::anyhow!(message)),
            }
        }
    }

    fn app(captioner: Arc<FakeCaptioner>) -> Router {
        let state = AppState {
            captioner,
            device: "cpu".to_string(),
        };
        router(state, 1024 * 1024)
    }

    fn encode(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(64, 48, |x, y| image::Rgb([x as u8 * 4, y as u8 * 5, 128]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        bytes
    }

    fn upload(field: &str, file_name: &str, content_type: Option<&str>, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
        )
        .into_bytes();
        if let Some(content_type) = content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/caption")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test_log::test(tokio::test)]
    async fn test_caption_for_jpeg() {
        let captioner = FakeCaptioner::new(Ok("a cat sitting on a couch"));
        let request = upload("file", "cat.jpg", Some("image/jpeg"), &encode(ImageFormat::Jpeg));
        let (status, body) = send(app(captioner.clone()), request).await;

        assert_eq!(status, StatusCode::OK);
        let caption = body["caption"].as_str().unwrap();
        assert!(!caption.is_empty());
        assert!(caption.contains("cat"));
        assert_eq!(captioner.calls(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_format_is_sniffed_from_bytes() {
        // declared jpeg, actually png
        let captioner = FakeCaptioner::new(Ok("a colorful gradient"));
        let request = upload("file", "photo.jpg", Some("image/jpeg"), &encode(ImageFormat::Png));
        let (status, body) = send(app(captioner.clone()), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "caption": "a colorful gradient" }));
    }

    #[test_log::test(tokio::test)]
    async fn test_non_image_is_rejected_without_inference() {
        let captioner = FakeCaptioner::new(Ok("unused"));
        let request = upload("file", "notes.txt", Some("text/plain"), b"buy milk");
        let (status, body) = send(app(captioner.clone()), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, serde_json::json!({ "detail": "File must be an image" }));
        assert_eq!(captioner.calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_content_type_is_rejected() {
        let captioner = FakeCaptioner::new(Ok("unused"));
        let request = upload("file", "cat.jpg", None, &encode(ImageFormat::Jpeg));
        let (status, body) = send(app(captioner.clone()), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "File must be an image");
        assert_eq!(captioner.calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_undecodable_image_is_server_error() {
        let captioner = FakeCaptioner::new(Ok("unused"));
        let garbage: Vec<u8> = (0..2048u32).map(|i| (i * 97 % 253) as u8).collect();
        let request = upload("file", "broken.jpg", Some("image/jpeg"), &garbage);
        let (status, body) = send(app(captioner.clone()), request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.get("caption").is_none());
        assert!(!body["detail"].as_str().unwrap().is_empty());
        assert_eq!(captioner.calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_inference_failure_reports_message() {
        let captioner = FakeCaptioner::new(Err("CUDA out of memory"));
        let request = upload("file", "cat.png", Some("image/png"), &encode(ImageFormat::Png));
        let (status, body) = send(app(captioner.clone()), request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, serde_json::json!({ "detail": "CUDA out of memory" }));
        assert_eq!(captioner.calls(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_file_field() {
        let captioner = FakeCaptioner::new(Ok("unused"));
        let request = upload("picture", "cat.png", Some("image/png"), &encode(ImageFormat::Png));
        let (status, body) = send(app(captioner.clone()), request).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["detail"], "Field required: file");
        assert_eq!(captioner.calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_repeated_requests_are_independent() {
        let captioner = FakeCaptioner::new(Ok("a red square"));
        let bytes = encode(ImageFormat::Png);
        for _ in 0..2 {
            let request = upload("file", "square.png", Some("image/png"), &bytes);
            let (status, body) = send(app(captioner.clone()), request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["caption"], "a red square");
        }
        assert_eq!(captioner.calls(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_health() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(FakeCaptioner::new(Ok("unused"))), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["device"], "cpu");
    }

    #[test_log::test(tokio::test)]
    async fn test_form_posts_to_caption() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app(FakeCaptioner::new(Ok("unused")))
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains(r#"action="/caption""#));
        assert!(html.contains(r#"name="file""#));
    }
}
