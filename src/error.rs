use failure::Fail;

/// Failures raised by a single extraction. "No plate" is not one of these;
/// it is reported as a sentinel result instead.
#[derive(Debug, Fail)]
pub enum PlateError {
    #[fail(display = "{}", _0)]
    Download(String),
    #[fail(display = "Failed to decode image: {}", _0)]
    Decode(String),
    #[fail(display = "Plate detection failed: {}", _0)]
    Detection(String),
    #[fail(display = "OCR failed: {}", _0)]
    Ocr(String),
    #[fail(display = "Recognition API returned status {}: {}", status, body)]
    RemoteApi { status: u16, body: String },
    #[fail(display = "Recognition API request failed: {}", _0)]
    RemoteRequest(String),
    #[fail(display = "Worker task failed: {}", _0)]
    Worker(String),
}

impl From<tokio::task::JoinError> for PlateError {
    fn from(e: tokio::task::JoinError) -> Self {
        PlateError::Worker(e.to_string())
    }
}
