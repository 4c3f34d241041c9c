//! HTTP surface of the waste classifier.
//!
//! A single route, `POST /classify`, takes a multipart upload under the
//! `image` field and answers with the predicted label.

use crate::error::ClassifyError;
use crate::predict::ImageClassifier;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::{Buf, Filter, Rejection, Reply};

/// Multipart field carrying the uploaded file.
pub const IMAGE_FIELD: &str = "image";
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 16 * 1024 * 1024;

const NO_FILE: &str = "No file uploaded";
const UNREADABLE: &str = "Could not read image";

pub type SharedClassifier = Arc<dyn ImageClassifier>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ClassificationResponse {
    pub classification: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub max_upload_bytes: u64,
    /// Uploads are copied here before classification, for debugging.
    pub stage_uploads: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 5000).into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            stage_uploads: None,
        }
    }
}

/// A file taken from the multipart body.
#[derive(Debug)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct MalformedUpload(String);

impl warp::reject::Reject for MalformedUpload {}

// =============================================================================
// Routes
// =============================================================================

/// Builds the route tree, rejections included.
pub fn routes(
    classifier: SharedClassifier,
    config: &ServerConfig,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let classify = warp::path("classify")
        .and(warp::path::end())
        .and(warp::post())
        .and(upload(config.max_upload_bytes))
        .and(with_classifier(classifier))
        .and(with_staging(config.stage_uploads.clone()))
        .and_then(handle_classify);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["POST", "OPTIONS"])
        .allow_headers(vec!["content-type"]);

    classify
        .with(cors)
        .with(warp::trace::request())
        .recover(handle_rejection)
}

/// Binds `config.addr` and serves until the process ends.
pub async fn serve(classifier: SharedClassifier, config: ServerConfig) {
    info!("Listening on http://{}", config.addr);
    warp::serve(routes(classifier, &config)).run(config.addr).await;
}

// =============================================================================
// Filters
// =============================================================================

fn with_classifier(
    classifier: SharedClassifier,
) -> impl Filter<Extract = (SharedClassifier,), Error = Infallible> + Clone {
    warp::any().map(move || classifier.clone())
}

fn with_staging(
    dir: Option<PathBuf>,
) -> impl Filter<Extract = (Option<PathBuf>,), Error = Infallible> + Clone {
    warp::any().map(move || dir.clone())
}

fn upload(limit: u64) -> impl Filter<Extract = (Option<Upload>,), Error = Rejection> + Clone {
    warp::multipart::form()
        .max_length(limit)
        .and_then(|form: FormData| async move {
            find_upload(form)
                .await
                .map_err(|e| warp::reject::custom(MalformedUpload(e.to_string())))
        })
}

/// Returns the first part named [`IMAGE_FIELD`] that carries a filename.
async fn find_upload(form: FormData) -> Result<Option<Upload>, warp::Error> {
    let mut form = std::pin::pin!(form);
    while let Some(part) = form.try_next().await? {
        if part.name() != IMAGE_FIELD {
            continue;
        }
        let Some(filename) = part.filename().map(str::to_owned) else {
            continue;
        };
        let bytes = read_part(part).await?;
        return Ok(Some(Upload { filename, bytes }));
    }
    Ok(None)
}

async fn read_part(part: Part) -> Result<Vec<u8>, warp::Error> {
    part.stream()
        .try_fold(Vec::new(), |mut acc, mut buf| async move {
            while buf.has_remaining() {
                let chunk = buf.chunk();
                let len = chunk.len();
                acc.extend_from_slice(chunk);
                buf.advance(len);
            }
            Ok(acc)
        })
        .await
}

// =============================================================================
// Handlers
// =============================================================================

async fn handle_classify(
    upload: Option<Upload>,
    classifier: SharedClassifier,
    staging: Option<PathBuf>,
) -> Result<warp::reply::Response, Infallible> {
    let Some(upload) = upload else {
        debug!("Request without an image file");
        return Ok(error_response(StatusCode::BAD_REQUEST, NO_FILE));
    };
    debug!(filename = %upload.filename, bytes = upload.bytes.len(), "Received upload");

    if let Some(dir) = staging {
        stage_upload(&dir, &upload).await;
    }

    let bytes = upload.bytes;
    let result = tokio::task::spawn_blocking(move || classifier.classify_bytes(&bytes)).await;

    let resp = match result {
        Ok(Ok(label)) => {
            info!(label, "Classified upload");
            warp::reply::with_status(
                warp::reply::json(&ClassificationResponse {
                    classification: label.to_string(),
                }),
                StatusCode::OK,
            )
            .into_response()
        }
        Ok(Err(e @ (ClassifyError::Decode(_) | ClassifyError::Empty))) => {
            error!("Image could not be decoded: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, UNREADABLE)
        }
        Ok(Err(e)) => {
            error!("Classification failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Classification failed")
        }
        Err(e) => {
            error!("Classification task failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Classification failed")
        }
    };
    Ok(resp)
}

async fn stage_upload(dir: &Path, upload: &Upload) {
    // Only the final path component is kept so uploads cannot escape `dir`.
    let name = Path::new(&upload.filename)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "upload".into());
    let path = dir.join(name);
    let res = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, &upload.bytes).await
    }
    .await;
    match res {
        Ok(()) => debug!("Staged upload at {}", path.display()),
        Err(e) => warn!("Failed to stage upload at {}: {e}", path.display()),
    }
}

fn error_response(status: StatusCode, message: &str) -> warp::reply::Response {
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: message.to_string(),
        }),
        status,
    )
    .into_response()
}

pub async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    if err.is_not_found() {
        Ok(error_response(StatusCode::NOT_FOUND, "Not found"))
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        Ok(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Upload too large",
        ))
    } else if let Some(MalformedUpload(e)) = err.find::<MalformedUpload>() {
        debug!("Malformed multipart body: {e}");
        Ok(error_response(StatusCode::BAD_REQUEST, NO_FILE))
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        // Chunked bodies cannot be checked against the upload limit.
        Ok(error_response(
            StatusCode::LENGTH_REQUIRED,
            "Content-Length required",
        ))
    } else if err.find::<warp::reject::MissingHeader>().is_some()
        || err.find::<warp::reject::InvalidHeader>().is_some()
        || err.find::<warp::reject::UnsupportedMediaType>().is_some()
    {
        Ok(error_response(StatusCode::BAD_REQUEST, NO_FILE))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        Ok(error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
        ))
    } else {
        error!("Unhandled rejection: {:?}", err);
        Ok(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LABELS;
    use crate::model::ClassifierConfig;
    use crate::predict::Classifier;
    use burn::backend::NdArray;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    const BOUNDARY: &str = "----binvision-test-boundary";

    /// Always answers with the same label, skipping the network.
    struct FixedClassifier(&'static str);

    impl ImageClassifier for FixedClassifier {
        fn classify(&self, _image: &DynamicImage) -> Result<&'static str, ClassifyError> {
            Ok(self.0)
        }
    }

    fn fixed() -> SharedClassifier {
        Arc::new(FixedClassifier("glass"))
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([30, 60, 90]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// (field name, optional filename, content)
    fn multipart(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(f) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post(body: Vec<u8>) -> warp::test::RequestBuilder {
        warp::test::request()
            .method("POST")
            .path("/classify")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(body)
    }

    fn error_of(body: &[u8]) -> String {
        serde_json::from_slice::<ErrorResponse>(body).unwrap().error
    }

    #[tokio::test]
    async fn test_classify_returns_label() {
        let routes = routes(fixed(), &ServerConfig::default());
        let resp = post(multipart(&[("image", Some("bottle.png"), &png(40, 30))]))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body: ClassificationResponse = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body.classification, "glass");
    }

    #[tokio::test]
    async fn test_missing_image_field() {
        let routes = routes(fixed(), &ServerConfig::default());
        let bodies = [
            multipart(&[]),
            multipart(&[("photo", Some("a.png"), &png(4, 4))]),
            // a plain form field is not a file
            multipart(&[("image", None, &png(4, 4))]),
        ];
        for body in bodies {
            let resp = post(body).reply(&routes).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(error_of(resp.body()), "No file uploaded");
        }
    }

    #[tokio::test]
    async fn test_not_multipart_is_missing_file() {
        let routes = routes(fixed(), &ServerConfig::default());
        let resp = warp::test::request()
            .method("POST")
            .path("/classify")
            .header("content-type", "application/json")
            .body(r#"{"image": "x"}"#)
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(resp.body()), "No file uploaded");

        let resp = warp::test::request()
            .method("POST")
            .path("/classify")
            .body("")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_without_length_is_rejected() {
        let routes = routes(fixed(), &ServerConfig::default());
        // no body set, so no Content-Length header either
        let resp = warp::test::request()
            .method("POST")
            .path("/classify")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header("transfer-encoding", "chunked")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::LENGTH_REQUIRED);
        assert_eq!(error_of(resp.body()), "Content-Length required");
    }

    #[tokio::test]
    async fn test_undecodable_image() {
        let routes = routes(fixed(), &ServerConfig::default());
        for content in [&b"not an image at all"[..], &b""[..]] {
            let resp = post(multipart(&[("image", Some("junk.jpg"), content)]))
                .reply(&routes)
                .await;
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(error_of(resp.body()), "Could not read image");
        }
    }

    #[tokio::test]
    async fn test_upload_too_large() {
        let config = ServerConfig {
            max_upload_bytes: 64,
            ..Default::default()
        };
        let routes = routes(fixed(), &config);
        let resp = post(multipart(&[("image", Some("big.png"), &png(64, 64))]))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_unknown_route_and_method() {
        let routes = routes(fixed(), &ServerConfig::default());
        let resp = warp::test::request().path("/nope").reply(&routes).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = warp::test::request()
            .method("GET")
            .path("/classify")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_staging_keeps_file_name_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            stage_uploads: Some(dir.path().join("uploads")),
            ..Default::default()
        };
        let routes = routes(fixed(), &config);
        let content = png(8, 8);
        let resp = post(multipart(&[("image", Some("../../can.png"), &content)]))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let staged = std::fs::read(dir.path().join("uploads").join("can.png")).unwrap();
        assert_eq!(staged, content);
    }

    #[tokio::test]
    async fn test_real_model_answers_with_known_label() {
        let device = Default::default();
        let model = ClassifierConfig::new(LABELS.len()).init::<NdArray<f32>>(&device);
        let classifier: SharedClassifier = Arc::new(Classifier::new(model, device).unwrap());
        let routes = routes(classifier, &ServerConfig::default());

        for (w, h) in [(224, 224), (17, 301)] {
            let resp = post(multipart(&[("image", Some("item.png"), &png(w, h))]))
                .reply(&routes)
                .await;
            assert_eq!(resp.status(), StatusCode::OK);
            let body: ClassificationResponse = serde_json::from_slice(resp.body()).unwrap();
            assert!(LABELS.contains(&body.classification.as_str()));
        }
    }
}
