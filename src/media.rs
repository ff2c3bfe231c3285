use std::path::PathBuf;
use anyhow::{bail, Context};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use url::Url;
use crate::config::CloudinaryConfig;
use crate::make_client;

const UPLOAD_API_BASE: &str = "https://api.cloudinary.com/v1_1";
const FALLBACK_MIME_TYPE: &str = "image/jpeg";
const FALLBACK_EXTENSION: &str = "jpg";

static EXTENSION_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.([A-Za-z0-9]+)$").unwrap());

/// Gets the file extension of a local file uri or path, in its original case. \
/// Query and fragment of an uri are ignored.
pub fn file_extension(file_uri: &str) -> Option<&str> {
    let without_suffix = file_uri.split(['?', '#']).next().unwrap_or(file_uri);
    let file_name = without_suffix.rsplit('/').next().unwrap_or(without_suffix);
    EXTENSION_REGEX.captures(file_name)
        .and_then(|captures| captures.get(1))
        .map(|extension| extension.as_str())
}

/// Infers the MIME type of an image from its extension. Unknown or missing extensions are treated as JPEG.
pub fn mime_type_for(file_uri: &str) -> &'static str {
    let extension = file_extension(file_uri).map(|e| e.to_lowercase());
    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        _ => FALLBACK_MIME_TYPE,
    }
}

/// The file name the image is sent as: `image.<ext>`
pub fn upload_file_name(file_uri: &str) -> String {
    format!("image.{}", file_extension(file_uri).unwrap_or(FALLBACK_EXTENSION))
}

/// Resolves a `file://` uri to a path. Anything else is taken as a plain path.
pub fn local_path(file_uri: &str) -> PathBuf {
    Url::parse(file_uri).ok()
        .filter(|url| url.scheme() == "file")
        .and_then(|url| url.to_file_path().ok())
        .unwrap_or_else(|| PathBuf::from(file_uri))
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    error: Option<serde_json::Value>,
}

/// Extracts the `secure_url` of an upload response body
pub fn parse_upload_response(body: &str) -> anyhow::Result<String> {
    let response: UploadResponse = serde_json::from_str(body)
        .context("Upload response was not JSON")?;
    match response.secure_url {
        Some(url) if !url.is_empty() => Ok(url),
        _ => {
            // Cloudinary sends either {"error": "..."} or {"error": {"message": "..."}}
            let reason = match response.error {
                Some(serde_json::Value::String(message)) => message,
                Some(error) => error.get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
                None => "no error given".to_string(),
            };
            bail!("Upload response did not contain a secure_url ({})", reason)
        }
    }
}

/// Uploads images into folders of the image host.
///
/// Uploading never fails loudly: any problem is logged and results in `None`.
pub trait ImageUploader {

    /// Uploads the image at `file_uri` into `folder` and returns its secure url
    fn upload_image(&self, file_uri: &str, folder: &str) -> Option<String>;

    /// The folder, that all uploaded images are placed in
    fn folder_base(&self) -> &str;

    /// The folder of a users avatar images: `<base>/<user_id>`
    fn avatar_folder(&self, user_id: &str) -> String {
        format!("{}/{}", self.folder_base(), user_id)
    }

    /// The folder of post images: `<base>/post`
    fn post_folder(&self) -> String {
        format!("{}/post", self.folder_base())
    }

    fn upload_avatar(&self, file_uri: &str, user_id: &str) -> Option<String> {
        self.upload_image(file_uri, &self.avatar_folder(user_id))
    }

    fn upload_post_image(&self, file_uri: &str) -> Option<String> {
        self.upload_image(file_uri, &self.post_folder())
    }

}

/// Unsigned uploads to Cloudinary, authorized through an upload preset
#[derive(Debug)]
pub struct CloudinaryUploader {
    client: Client,
    cloud_name: String,
    upload_preset: String,
    folder_base: String,
    api_base: String,
}

impl CloudinaryUploader {

    pub fn new(config: &CloudinaryConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: make_client()?,
            cloud_name: config.cloud_name.clone(),
            upload_preset: config.upload_preset.clone(),
            folder_base: config.folder.clone(),
            api_base: UPLOAD_API_BASE.to_string(),
        })
    }

    /// Sends uploads through `client` instead of the default https only client
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Sends uploads to another api base instead of `https://api.cloudinary.com/v1_1`
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// The endpoint uploads are posted to
    pub fn upload_url(&self) -> String {
        format!("{}/{}/upload", self.api_base.trim_end_matches('/'), self.cloud_name)
    }

    fn build_form(&self, file_uri: &str, folder: &str) -> anyhow::Result<Form> {
        let path = local_path(file_uri);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Could not read image at {}", path.display()))?;
        let file_part = Part::bytes(bytes)
            .file_name(upload_file_name(file_uri))
            .mime_str(mime_type_for(file_uri))?;
        Ok(Form::new()
            .part("file", file_part)
            .text("upload_preset", self.upload_preset.clone())
            .text("folder", folder.to_string()))
    }

    fn try_upload(&self, file_uri: &str, folder: &str) -> anyhow::Result<String> {
        let form = self.build_form(file_uri, folder)?;
        let response = self.client.post(self.upload_url())
            .header(ACCEPT, "application/json")
            .multipart(form)
            .send()
            .context("Could not send upload request")?;
        let status = response.status();
        let body = response.text().context("Could not read upload response")?;
        if !status.is_success() {
            bail!("Upload request had status code: {} ({})", status, body.trim());
        }
        parse_upload_response(&body)
    }

}

impl ImageUploader for CloudinaryUploader {

    fn upload_image(&self, file_uri: &str, folder: &str) -> Option<String> {
        match self.try_upload(file_uri, folder) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("Image upload to {} failed: {:#}", folder, err);
                None
            }
        }
    }

    fn folder_base(&self) -> &str {
        &self.folder_base
    }

}

/// Lets the user choose an image from the device library.
pub trait ImagePicker {

    /// Returns the uri of the chosen image, or `None` if the user cancelled. \
    /// Errors, like a denied library permission, are returned as `Err`.
    fn pick_image(&mut self) -> anyhow::Result<Option<String>>;

}

/// A picker that always "chooses" the same file. Useful when there is no device to ask.
#[derive(Debug, Clone, Default)]
pub struct FixedImagePicker {
    pub file_uri: Option<String>,
}

impl FixedImagePicker {
    pub fn new(file_uri: impl Into<String>) -> Self {
        Self { file_uri: Some(file_uri.into()) }
    }
}

impl ImagePicker for FixedImagePicker {
    fn pick_image(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.file_uri.clone())
    }
}

/// What came out of [`pick_and_upload()`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickAndUpload {
    /// Nothing was chosen, or the picker could not be used
    Cancelled,
    /// The image was uploaded to this secure url
    Uploaded(String),
    /// An image was chosen, but uploading it failed
    Failed,
}

impl PickAndUpload {
    /// The secure url, collapsing cancellation and failure into `None`
    pub fn secure_url(self) -> Option<String> {
        match self {
            PickAndUpload::Uploaded(url) => Some(url),
            PickAndUpload::Cancelled | PickAndUpload::Failed => None,
        }
    }
}

/// Asks `picker` for an image. \
/// A picker error (e.g. permission denial) is logged and treated like a cancellation.
pub fn pick_file(picker: &mut impl ImagePicker) -> Option<String> {
    match picker.pick_image() {
        Ok(file_uri) => file_uri,
        Err(err) => {
            warn!("Could not pick an image: {:#}", err);
            None
        }
    }
}

/// Asks `picker` for an image (see [`pick_file()`]) and uploads it into `folder`.
pub fn pick_and_upload(picker: &mut impl ImagePicker, uploader: &impl ImageUploader, folder: &str) -> PickAndUpload {
    let Some(file_uri) = pick_file(picker) else { return PickAndUpload::Cancelled };
    match uploader.upload_image(&file_uri, folder) {
        Some(url) => PickAndUpload::Uploaded(url),
        None => PickAndUpload::Failed,
    }
}
