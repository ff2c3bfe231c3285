pub mod config;
pub mod media;
pub mod models;
pub mod profile;
pub mod store;
#[cfg(test)]
mod test_server;

#[cfg(feature = "rate_limiting")]
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "rate_limiting")]
use std::time::SystemTime;
use anyhow::{bail, Context};
use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::IntoUrl;
use serde::de::DeserializeOwned;
use url::Url;
use crate::config::Config;
use crate::media::{CloudinaryUploader, ImagePicker};
use crate::profile::ProfileController;
use crate::store::{RemotePostStore, RemoteUserStore, Session};

#[cfg(feature = "rate_limiting")]
const REQUEST_MAX_SPEED: Duration = Duration::from_millis(150);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// The profile screen, wired against the backend and Cloudinary
pub type RemoteProfile<I> = ProfileController<Session, RemoteUserStore<CloudinaryUploader>, RemotePostStore, I>;

/// Builds a [`RemoteProfile`] for the backend at `api_url`. \
/// `token` is the session token, if the user is already signed in.
/// Nothing is fetched yet, call [`ProfileController::load()`] for that.
pub fn remote_profile<I: ImagePicker>(api_url: impl IntoUrl, config: &Config, token: Option<String>, picker: I) -> anyhow::Result<RemoteProfile<I>> {
    let api = Arc::new(ApiClient::new(api_url)?);
    let uploader = CloudinaryUploader::new(&config.cloudinary)?;
    Ok(ProfileController::new(
        Session::new(token),
        RemoteUserStore::new(api.clone(), uploader),
        RemotePostStore::new(api),
        picker,
    ))
}

pub(crate) fn make_client() -> anyhow::Result<Client> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    ClientBuilder::new()
        .https_only(true)
        .timeout(REQUEST_TIMEOUT)
        .default_headers(default_headers)
        .gzip(true)
        .build()
        .context("Could not build reqwest client")
}

/// A wrapped reqwest [`Client`], that resolves every request path against the backends base url and authenticates it
#[derive(Debug)]
pub struct ApiClient {
    pub client: Client,
    pub base_url: Url,
    #[cfg(feature = "rate_limiting")]
    last_request_time: RefCell<SystemTime>,
}

impl ApiClient {

    /// Creates a client for the backend at `base_url` (e.g. `https://api.momentshare.app/api`)
    pub fn new(base_url: impl IntoUrl) -> anyhow::Result<Self> {
        Self::with_client(base_url, make_client()?)
    }

    /// Like [`ApiClient::new()`], but sends requests through `client`
    pub fn with_client(base_url: impl IntoUrl, client: Client) -> anyhow::Result<Self> {
        let mut base_url = base_url.into_url().context("Invalid backend url")?;
        // Without a trailing slash, joining would replace the last path segment
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            base_url,
            #[cfg(feature = "rate_limiting")]
            last_request_time: RefCell::new(SystemTime::UNIX_EPOCH),
        })
    }

    /// Resolves an endpoint path against the base url
    pub fn url(&self, path: &str) -> anyhow::Result<Url> {
        self.base_url.join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid endpoint path: {}", path))
    }

    #[cfg(feature = "rate_limiting")]
    fn before_request(&self) {
        // Rate limits on request creation
        // Any requests that are created, but not sent, will still be rate limited
        let mut last_request_time = self.last_request_time.borrow_mut();
        let elapsed = last_request_time.elapsed().unwrap_or(Duration::from_secs(0));
        if elapsed > REQUEST_MAX_SPEED {
            *last_request_time = SystemTime::now();
            return;
        }
        let wait_time = REQUEST_MAX_SPEED - elapsed;
        std::thread::sleep(wait_time);
        *last_request_time = SystemTime::now();
    }

    #[cfg(not(feature = "rate_limiting"))]
    fn before_request(&self) {}
}

macro_rules! impl_client_wrap {
    ($($method:ident),+) => {
        impl ApiClient {
            $(
                /// Starts a request to the endpoint at `path`, authenticated with the bearer `token`
                pub fn $method(&self, path: &str, token: &str) -> anyhow::Result<reqwest::blocking::RequestBuilder> {
                    self.before_request();
                    let url = self.url(path)?;
                    #[cfg(feature = "verbose")]
                    {
                        log::debug!("{}: {}", stringify!($method), url.as_str());
                    }
                    Ok(self.client.$method(url).bearer_auth(token))
                }
            )+
        }
    };
}

impl_client_wrap!(get, post, put);

/// Extracts the human readable message of a backend error body, like `{"message": "Invalid token"}`
pub(crate) fn backend_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "error"].iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

/// Fails with the status and the backends message, if the response was not successful
pub(crate) fn check_response(response: Response) -> anyhow::Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().unwrap_or_default();
    let message = backend_error_message(&body).unwrap_or_else(|| body.trim().to_string());
    bail!("Request to {} had status code: {} ({})", url.path(), status, message)
}

/// Checks the response and parses its json body
pub(crate) fn read_json<T: DeserializeOwned>(response: Response) -> anyhow::Result<T> {
    let response = check_response(response)?;
    let text = response.text().context("failed to get response text")?;
    serde_json::from_str(&text).context("Could not parse response json")
}
