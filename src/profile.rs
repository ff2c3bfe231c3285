use anyhow::Context;
use chrono::{DateTime, Utc};
use log::warn;
use crate::media::{pick_file, ImagePicker};
use crate::models::{normalize_bio, partition_by_status, posts_owned_by, Post, User, BIO_MAX_CHARS};
use crate::store::{AuthStore, PostStore, UserStore};

/// How an operation of the [`ProfileController`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Nothing to do: not signed in, cancelled by the user, or already running
    Skipped,
    /// Failed, the message is available through [`ProfileController::notice()`]
    Failed,
}

/// State of the bio edit surface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BioEditor {
    pub open: bool,
    pub draft: String,
}

/// Numbers shown in the profile header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileStats {
    pub posts: usize,
    pub active_posts: usize,
    pub friends: usize,
}

/// The logic behind the profile screen. \
/// All state lives in the injected stores; the controller only sequences their operations
/// and derives what the screen shows from them.
pub struct ProfileController<A, U, P, I> {
    auth: A,
    users: U,
    posts: P,
    picker: I,
    refreshing: bool,
    bio_editor: BioEditor,
    notice: Option<String>,
}

impl<A: AuthStore, U: UserStore, P: PostStore, I: ImagePicker> ProfileController<A, U, P, I> {

    pub fn new(auth: A, users: U, posts: P, picker: I) -> Self {
        Self {
            auth,
            users,
            posts,
            picker,
            refreshing: false,
            bio_editor: BioEditor::default(),
            notice: None,
        }
    }

    pub fn auth(&self) -> &A {
        &self.auth
    }

    pub fn auth_mut(&mut self) -> &mut A {
        &mut self.auth
    }

    pub fn users(&self) -> &U {
        &self.users
    }

    pub fn posts(&self) -> &P {
        &self.posts
    }

    pub fn user(&self) -> Option<&User> {
        self.users.current_user()
    }

    /// The posts of the current user, taken from the global collection in its order. \
    /// Derived on every call, so it always matches the current user and collection.
    pub fn user_posts(&self) -> Vec<&Post> {
        match self.users.current_user() {
            Some(user) => posts_owned_by(self.posts.posts(), &user.id),
            None => vec![],
        }
    }

    /// The users posts split into `(active, expired)` relative to `now`
    pub fn split_posts(&self, now: DateTime<Utc>) -> (Vec<&Post>, Vec<&Post>) {
        partition_by_status(self.user_posts(), now)
    }

    pub fn active_posts(&self, now: DateTime<Utc>) -> Vec<&Post> {
        self.split_posts(now).0
    }

    pub fn expired_posts(&self, now: DateTime<Utc>) -> Vec<&Post> {
        self.split_posts(now).1
    }

    pub fn stats(&self, now: DateTime<Utc>) -> ProfileStats {
        let (active, expired) = self.split_posts(now);
        ProfileStats {
            posts: active.len() + expired.len(),
            active_posts: active.len(),
            friends: self.user().map_or(0, |user| user.friends_count),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.users.is_loading() || self.posts.is_loading()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    pub fn bio_editor(&self) -> &BioEditor {
        &self.bio_editor
    }

    /// The message that should be shown to the user, if any
    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    /// Takes the message, once it was shown
    pub fn take_notice(&mut self) -> Option<String> {
        self.notice.take()
    }

    fn token(&self) -> Option<String> {
        self.auth.token().map(str::to_string)
    }

    // Turns the result of a pipeline into an outcome, keeping the message of a failure
    fn conclude(&mut self, result: anyhow::Result<()>, what: &str) -> Outcome {
        match result {
            Ok(()) => Outcome::Done,
            Err(err) => {
                warn!("{} failed: {:#}", what, err);
                self.notice = Some(format!("{:#}", err));
                Outcome::Failed
            }
        }
    }

    /// Fetches the profile, then the posts of the current user. \
    /// Skipped without a session token. Call again after the token changed.
    pub fn load(&mut self) -> Outcome {
        let Some(token) = self.token() else { return Outcome::Skipped };
        let result = self.users.fetch_profile(&token)
            .and_then(|_| self.posts.fetch_user_posts(&token));
        self.conclude(result, "Loading the profile")
    }

    /// Marks a refresh as running. Returns `false` if one already is.
    pub fn begin_refresh(&mut self) -> bool {
        if self.refreshing {
            return false;
        }
        self.refreshing = true;
        true
    }

    pub fn end_refresh(&mut self) {
        self.refreshing = false;
    }

    /// Fetches the posts again. Skipped while another refresh is running.
    pub fn refresh(&mut self) -> Outcome {
        let Some(token) = self.token() else { return Outcome::Skipped };
        if !self.begin_refresh() {
            return Outcome::Skipped;
        }
        let result = self.posts.fetch_user_posts(&token);
        self.end_refresh();
        self.conclude(result, "Refreshing posts")
    }

    /// Lets the user pick a new avatar, uploads and persists it, then fetches the profile again. \
    /// Skipped if nothing was picked. A picker error (like a denied permission) counts as nothing picked.
    pub fn edit_avatar(&mut self) -> Outcome {
        let Some(token) = self.token() else { return Outcome::Skipped };
        let Some(file_uri) = pick_file(&mut self.picker) else { return Outcome::Skipped };
        let result = self.users.update_avatar(&token, &file_uri)
            .and_then(|_| self.users.fetch_profile(&token));
        self.conclude(result, "Updating the avatar")
    }

    /// Opens the bio editor, starting from the current bio
    pub fn open_bio_editor(&mut self) {
        let current = self.user()
            .and_then(|user| user.bio.clone())
            .unwrap_or_default();
        self.bio_editor = BioEditor { open: true, draft: current };
        self.notice = None;
    }

    /// Replaces the draft. Like a text field with a maximum length, anything past the limit is cut off.
    /// Leading whitespace is trimmed on save, so it does not count towards the limit.
    pub fn set_bio_draft(&mut self, text: &str) {
        let content = text.trim_start();
        let leading = &text[..text.len() - content.len()];
        self.bio_editor.draft = leading.chars()
            .chain(content.chars().take(BIO_MAX_CHARS))
            .collect();
    }

    pub fn close_bio_editor(&mut self) {
        self.bio_editor = BioEditor::default();
    }

    /// Trims and persists the draft, closes the editor and fetches the profile again. \
    /// On failure the editor stays open with the draft, so the user can retry.
    pub fn save_bio(&mut self) -> Outcome {
        if !self.bio_editor.open {
            return Outcome::Skipped;
        }
        let result = self.token()
            .context("Not signed in")
            .and_then(|token| {
                let bio = normalize_bio(&self.bio_editor.draft)?.to_string();
                self.users.update_bio(&token, &bio)?;
                Ok(token)
            });
        let token = match result {
            Ok(token) => token,
            Err(err) => return self.conclude(Err(err), "Saving the bio"),
        };
        self.close_bio_editor();
        let reloaded = self.users.fetch_profile(&token);
        self.conclude(reloaded, "Reloading the profile")
    }

    /// Ends the session and forgets everything derived from it
    pub fn logout(&mut self) {
        self.auth.logout();
        self.users.clear();
        self.posts.clear();
        self.refreshing = false;
        self.bio_editor = BioEditor::default();
        self.notice = None;
    }

}
