use crate::error::PlateError;
use crate::locator::PlateLocator;
use crate::types::{Located, REMOTE_NOT_FOUND};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::Value;
use std::path::Path;
use url::Url;

/// Delegates both locating and reading to a remote ANPR service.
pub struct AnprLocator {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
}

impl AnprLocator {
    pub fn new(endpoint: Url, api_key: String) -> Self {
        AnprLocator {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }

    fn upload_form(&self, image: Vec<u8>) -> Result<Form, PlateError> {
        // The service expects the key in the uploaded file name as well as the header.
        let part = Part::bytes(image)
            .file_name(format!("{}.jpg", self.api_key))
            .mime_str("image/jpeg")
            .map_err(|e| PlateError::RemoteRequest(e.to_string()))?;
        Ok(Form::new().part("imageFile", part))
    }
}

#[async_trait]
impl PlateLocator for AnprLocator {
    async fn locate(&self, image: &Path) -> Result<Option<Located>, PlateError> {
        let data = tokio::fs::read(image).await.map_err(|e| {
            PlateError::RemoteRequest(format!("Failed to read {}: {}", image.display(), e))
        })?;
        info!("Sending {} bytes to {}", data.len(), self.endpoint);

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Authorization", &self.api_key)
            .multipart(self.upload_form(data)?)
            .send()
            .await
            .map_err(|e| PlateError::RemoteRequest(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PlateError::RemoteRequest(e.to_string()))?;
        debug!("Recognition API replied {}: {}", status, body);

        if status != StatusCode::OK {
            return Err(PlateError::RemoteApi {
                status: status.as_u16(),
                body,
            });
        }
        let json: Value = serde_json::from_str(&body).map_err(|_| PlateError::RemoteApi {
            status: status.as_u16(),
            body: body.clone(),
        })?;
        let plate = json["data"]["number_plate"]
            .as_str()
            .unwrap_or(REMOTE_NOT_FOUND)
            .to_string();
        info!("Recognition API read plate: {}", plate);
        Ok(Some(Located::Text(plate)))
    }
}
