use super::session::UploadSession;
use super::UploadResponse;
use crate::error::{Result, UploadError};
use crate::etag::etag_of_bytes;
use crate::http::{Body, FormFile, MultipartForm, RequestTemplate};
use crate::region::UpPurpose;
use crate::uplog::UpType;
use tracing::debug;

pub(crate) const DEFAULT_MIME: &str = "application/octet-stream";

/// The multipart form for a direct upload
pub(crate) fn build_form(session: &UploadSession<'_>, data: bytes::Bytes) -> MultipartForm {
    let params = session.params;
    let mut form = MultipartForm::new().text("token", session.token.as_str());
    if let Some(key) = &params.key {
        form = form.text("key", key.clone());
    }
    for (name, value) in &params.vars {
        form = form.text(format!("x:{}", name), value.clone());
    }
    for (name, value) in &params.metadata {
        form = form.text(format!("x-qn-meta-{}", name), value.clone());
    }
    form.file(FormFile {
        field_name: "file".to_string(),
        file_name: params.file_name_for(session.source),
        mime_type: params.mime.clone().unwrap_or_else(|| DEFAULT_MIME.to_string()),
        data,
    })
}

/// Uploads the whole object in one multipart POST
pub(crate) async fn upload(session: &UploadSession<'_>) -> Result<UploadResponse> {
    session.progress.report(0);
    let data = session.source.read_all().await?;
    let size = data.len() as u64;
    let expected_hash = session.checksum.then(|| etag_of_bytes(&data));

    let template = RequestTemplate::post("/", UpPurpose::Direct, UpType::Form)
        .body(Body::Form(build_form(session, data)))
        .total_size(size);
    let delivery = session
        .manager
        .transport()
        .send(session.regions, &template, Some(session.token))
        .await?;

    debug!(host = %delivery.endpoint, size = size, "Form upload accepted");
    let response = UploadResponse::from_slice(&delivery.response.body)?;
    if let (Some(expected), Some(remote)) = (&expected_hash, response.hash()) {
        if expected != remote {
            return Err(UploadError::Integrity(format!(
                "Content hash mismatch: local {}, remote {}",
                expected, remote
            )));
        }
    }
    Ok(response)
}
