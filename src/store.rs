use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use crate::media::ImageUploader;
use crate::models::{Post, User};
use crate::{check_response, read_json, ApiClient};

const PROFILE_PATH: &str = "users/me";
const PROFILE_IMAGE_PATH: &str = "users/me/profile-image";
const BIO_PATH: &str = "users/me/bio";
const MY_POSTS_PATH: &str = "posts/me";

/// A loading flag, that can be watched from outside of its store. \
/// The remote stores block while they load, so their flag is only ever seen set through a clone held elsewhere,
/// e.g. by a UI thread showing a spinner.
#[derive(Debug, Clone, Default)]
pub struct LoadingFlag(Arc<AtomicBool>);

impl LoadingFlag {

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    // Sets the flag until the returned guard is dropped
    fn start(&self) -> LoadingGuard {
        self.0.store(true, Ordering::SeqCst);
        LoadingGuard(self.clone())
    }

}

struct LoadingGuard(LoadingFlag);

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.0.0.store(false, Ordering::SeqCst);
    }
}

/// Holds the session of the signed in user
pub trait AuthStore {
    /// The current session token, if signed in
    fn token(&self) -> Option<&str>;

    fn logout(&mut self);
}

/// Holds the signed in users profile
pub trait UserStore {
    fn current_user(&self) -> Option<&User>;

    /// Whether an operation is running. A blocking store can only report this through a [`LoadingFlag`].
    fn is_loading(&self) -> bool;

    /// The message of the last failed operation. Cleared when the next one starts.
    fn last_error(&self) -> Option<&str>;

    /// Replaces the current user with the profile fetched from the backend
    fn fetch_profile(&mut self, token: &str) -> anyhow::Result<()>;

    /// Uploads the image at `file_uri` and makes it the avatar of the current user. \
    /// Does not touch the current user, fetch the profile again to see the change.
    fn update_avatar(&mut self, token: &str, file_uri: &str) -> anyhow::Result<()>;

    /// Persists a new bio. Like [`UserStore::update_avatar()`] the current user stays as it is.
    fn update_bio(&mut self, token: &str, bio: &str) -> anyhow::Result<()>;

    /// Forgets the current user
    fn clear(&mut self);
}

/// Holds the global post collection
pub trait PostStore {
    fn posts(&self) -> &[Post];

    /// Like [`UserStore::is_loading()`]
    fn is_loading(&self) -> bool;

    /// Replaces the collection with the posts of the signed in user
    fn fetch_user_posts(&mut self, token: &str) -> anyhow::Result<()>;

    fn clear(&mut self);
}

/// An in memory [`AuthStore`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    token: Option<String>,
}

impl Session {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn sign_in(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }
}

impl AuthStore for Session {
    fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn logout(&mut self) {
        self.token = None;
    }
}

/// A [`UserStore`] backed by the backend api. Avatars are uploaded with `U` first.
#[derive(Debug)]
pub struct RemoteUserStore<U> {
    api: Arc<ApiClient>,
    uploader: U,
    user: Option<User>,
    loading: LoadingFlag,
    error: Option<String>,
}

impl<U: ImageUploader> RemoteUserStore<U> {

    pub fn new(api: Arc<ApiClient>, uploader: U) -> Self {
        Self {
            api,
            uploader,
            user: None,
            loading: LoadingFlag::default(),
            error: None,
        }
    }

    /// A handle to watch the loading state from another thread
    pub fn loading_flag(&self) -> LoadingFlag {
        self.loading.clone()
    }

    // Runs one operation, keeping the loading flag and the last error up to date
    fn track<T>(&mut self, operation: impl FnOnce(&Self) -> anyhow::Result<T>) -> anyhow::Result<T> {
        self.error = None;
        let loading = self.loading.start();
        let result = operation(self);
        drop(loading);
        if let Err(err) = &result {
            self.error = Some(format!("{:#}", err));
        }
        result
    }

}

impl<U: ImageUploader> UserStore for RemoteUserStore<U> {

    fn current_user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    fn is_loading(&self) -> bool {
        self.loading.is_set()
    }

    fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn fetch_profile(&mut self, token: &str) -> anyhow::Result<()> {
        let user: User = self.track(|store| {
            let response = store.api.get(PROFILE_PATH, token)?
                .send()
                .context("Could not fetch profile")?;
            read_json(response)
        })?;
        self.user = Some(user);
        Ok(())
    }

    fn update_avatar(&mut self, token: &str, file_uri: &str) -> anyhow::Result<()> {
        self.track(|store| {
            let user_id = &store.user.as_ref()
                .context("No user loaded, fetch the profile first")?
                .id;
            let image_url = store.uploader.upload_avatar(file_uri, user_id)
                .context("Failed to upload image")?;
            let response = store.api.put(PROFILE_IMAGE_PATH, token)?
                .json(&json!({ "profileImage": image_url }))
                .send()
                .context("Could not update profile image")?;
            check_response(response)?;
            Ok(())
        })
    }

    fn update_bio(&mut self, token: &str, bio: &str) -> anyhow::Result<()> {
        self.track(|store| {
            let response = store.api.put(BIO_PATH, token)?
                .json(&json!({ "bio": bio }))
                .send()
                .context("Could not update bio")?;
            check_response(response)?;
            Ok(())
        })
    }

    fn clear(&mut self) {
        self.user = None;
        self.error = None;
    }

}

// The backend answers either with a bare list or with `{"posts": [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostsResponse {
    Plain(Vec<Post>),
    Wrapped { posts: Vec<Post> },
}

impl From<PostsResponse> for Vec<Post> {
    fn from(value: PostsResponse) -> Self {
        match value {
            PostsResponse::Plain(posts) | PostsResponse::Wrapped { posts } => posts,
        }
    }
}

/// A [`PostStore`] backed by the backend api
#[derive(Debug)]
pub struct RemotePostStore {
    api: Arc<ApiClient>,
    posts: Vec<Post>,
    loading: LoadingFlag,
}

impl RemotePostStore {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            posts: vec![],
            loading: LoadingFlag::default(),
        }
    }

    /// A handle to watch the loading state from another thread
    pub fn loading_flag(&self) -> LoadingFlag {
        self.loading.clone()
    }
}

impl PostStore for RemotePostStore {

    fn posts(&self) -> &[Post] {
        &self.posts
    }

    fn is_loading(&self) -> bool {
        self.loading.is_set()
    }

    fn fetch_user_posts(&mut self, token: &str) -> anyhow::Result<()> {
        let loading = self.loading.start();
        let result = self.api.get(MY_POSTS_PATH, token)
            .and_then(|request| request.send().context("Could not fetch posts"))
            .and_then(read_json::<PostsResponse>);
        drop(loading);
        self.posts = result?.into();
        Ok(())
    }

    fn clear(&mut self) {
        self.posts.clear();
    }

}


#[cfg(test)]
mod tests {
    use std::sync::mpsc::{channel, Receiver};
    use once_cell::sync::OnceCell;
    use crate::test_server::{http_client, serve_inspecting, Reply};
    use super::*;

    #[test]
    fn test_session() {
        let mut session = Session::default();
        assert_eq!(session.token(), None);
        session.sign_in("abc");
        assert_eq!(session.token(), Some("abc"));
        session.logout();
        assert_eq!(session.token(), None);
    }

    #[test]
    fn test_posts_response_shapes() {
        let post = r#"{"id": "p1", "userId": "u1", "imageUrl": "https://x/p1.jpg", "createdAt": "2024-05-09T12:00:00Z"}"#;
        let plain: PostsResponse = serde_json::from_str(&format!("[{}]", post)).unwrap();
        let wrapped: PostsResponse = serde_json::from_str(&format!(r#"{{"posts": [{}], "total": 1}}"#, post)).unwrap();
        let plain: Vec<Post> = plain.into();
        let wrapped: Vec<Post> = wrapped.into();
        assert_eq!(plain.len(), 1);
        assert_eq!(plain, wrapped);
    }

    struct NeverUploader;

    impl ImageUploader for NeverUploader {
        fn upload_image(&self, _file_uri: &str, _folder: &str) -> Option<String> {
            panic!("Nothing should be uploaded here")
        }
        fn folder_base(&self) -> &str {
            "base"
        }
    }

    #[test]
    fn test_avatar_needs_loaded_user() {
        let api = Arc::new(ApiClient::new("https://api.example.com").unwrap());
        let mut store = RemoteUserStore::new(api, NeverUploader);
        let err = store.update_avatar("token", "/a.png").unwrap_err();
        assert!(err.to_string().contains("No user loaded"));
        assert_eq!(store.last_error(), Some("No user loaded, fetch the profile first"));
        assert!(!store.is_loading());
    }

    #[test]
    fn test_posts_failure_keeps_collection() {
        // http is rejected by the https only client, so nothing leaves the machine
        let api = Arc::new(ApiClient::new("http://127.0.0.1:9").unwrap());
        let mut store = RemotePostStore::new(api);
        assert!(store.fetch_user_posts("token").is_err());
        assert!(store.posts().is_empty());
        assert!(!store.is_loading());
    }

    /// Serves `replies` and records, per request, whether the flag in `slot` was set while it was answered
    fn serve_watching(replies: Vec<Reply>, slot: Arc<OnceCell<LoadingFlag>>) -> (String, Receiver<String>, Receiver<bool>) {
        let (seen_sender, seen) = channel();
        let (base, requests) = serve_inspecting(replies, move || {
            let _ = seen_sender.send(slot.get().is_some_and(LoadingFlag::is_set));
        });
        (base, requests, seen)
    }

    #[test]
    fn test_loading_flag_is_set_while_fetching_posts() {
        let slot = Arc::new(OnceCell::new());
        let post = r#"{"id": "p1", "userId": "u1", "imageUrl": "https://x/p1.jpg", "createdAt": "2024-05-09T12:00:00Z"}"#;
        let (base, requests, seen) = serve_watching(vec![Reply::json(200, &format!("[{}]", post))], slot.clone());
        let api = Arc::new(ApiClient::with_client(base, http_client()).unwrap());
        let mut store = RemotePostStore::new(api);
        slot.set(store.loading_flag()).unwrap();

        store.fetch_user_posts("tok").unwrap();
        assert!(seen.recv().unwrap());
        assert!(!store.is_loading());
        assert_eq!(store.posts().len(), 1);
        let request = requests.recv().unwrap();
        assert!(request.starts_with("GET /posts/me HTTP/1.1\r\n"), "{}", request);
        assert!(request.to_lowercase().contains("authorization: bearer tok\r\n"));
    }

    #[test]
    fn test_loading_flag_and_error_of_failed_profile_fetch() {
        let slot = Arc::new(OnceCell::new());
        let (base, _requests, seen) = serve_watching(vec![Reply::json(401, r#"{"message": "Invalid token"}"#)], slot.clone());
        let api = Arc::new(ApiClient::with_client(base, http_client()).unwrap());
        let mut store = RemoteUserStore::new(api, NeverUploader);
        slot.set(store.loading_flag()).unwrap();

        assert!(store.fetch_profile("expired").is_err());
        assert!(seen.recv().unwrap());
        assert!(!store.is_loading());
        assert!(store.current_user().is_none());
        let error = store.last_error().unwrap();
        assert!(error.contains("401") && error.contains("Invalid token"), "{}", error);
    }
}
