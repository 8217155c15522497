//! Watch page state: video details, reactions, view counting and comments.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::api::{CommentDetails, CommentPage, Reaction, VideoDetails};
use crate::data::WatchService;

/// Like/dislike counters together with the viewer's own reaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactionState {
    pub likes: u64,
    pub dislikes: u64,
    pub user_reaction: Option<Reaction>,
}

impl ReactionState {
    pub fn from_details(details: &VideoDetails) -> Self {
        Self {
            likes: details.likes,
            dislikes: details.dislikes,
            user_reaction: details.user_reaction,
        }
    }

    /// State after the viewer presses `reaction`. Pressing the active
    /// reaction again withdraws it.
    pub fn toggled(&self, reaction: Reaction) -> Self {
        let mut next = *self;
        match self.user_reaction {
            Some(current) if current == reaction => {
                next.decrement(reaction);
                next.user_reaction = None;
            }
            Some(current) => {
                next.decrement(current);
                *next.counter(reaction) += 1;
                next.user_reaction = Some(reaction);
            }
            None => {
                *next.counter(reaction) += 1;
                next.user_reaction = Some(reaction);
            }
        }
        next
    }

    fn decrement(&mut self, reaction: Reaction) {
        let count = self.counter(reaction);
        *count = count.saturating_sub(1);
    }

    fn counter(&mut self, reaction: Reaction) -> &mut u64 {
        match reaction {
            Reaction::Like => &mut self.likes,
            Reaction::Dislike => &mut self.dislikes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentThread {
    pub items: Vec<CommentDetails>,
    pub last_comment_id: Option<String>,
    pub has_more: bool,
    pub is_loading: bool,
    pub is_posting: bool,
}

impl Default for CommentThread {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            last_comment_id: None,
            has_more: true,
            is_loading: false,
            is_posting: false,
        }
    }
}

impl CommentThread {
    fn append(&mut self, page: CommentPage) {
        if page.comments.is_empty() || !page.has_more {
            self.has_more = false;
        }
        if let Some(last) = page.comments.last() {
            self.last_comment_id = Some(last.id.clone());
        }
        self.items.extend(page.comments);
    }
}

enum WatchResponse {
    Details(Result<VideoDetails>),
    Reaction {
        request_id: u64,
        snapshot: ReactionState,
        result: Result<()>,
    },
    Comments(Result<CommentPage>),
    Posted(Result<CommentDetails>),
}

pub struct WatchPage {
    service: Arc<dyn WatchService>,
    video_id: String,
    details: Option<VideoDetails>,
    reaction: ReactionState,
    latest_reaction: u64,
    comments: CommentThread,
    view_counted: bool,
    in_flight: usize,
    response_tx: Sender<WatchResponse>,
    response_rx: Receiver<WatchResponse>,
}

impl WatchPage {
    /// Starts loading the video's details and its first comment page.
    pub fn open(service: Arc<dyn WatchService>, video_id: impl Into<String>) -> Self {
        let (response_tx, response_rx) = unbounded();
        let mut page = Self {
            service,
            video_id: video_id.into(),
            details: None,
            reaction: ReactionState::default(),
            latest_reaction: 0,
            comments: CommentThread::default(),
            view_counted: false,
            in_flight: 0,
            response_tx,
            response_rx,
        };
        let video_id = page.video_id.clone();
        page.spawn(move |service| WatchResponse::Details(service.video_details(&video_id)));
        page.load_more_comments();
        page
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn details(&self) -> Option<&VideoDetails> {
        self.details.as_ref()
    }

    pub fn reaction(&self) -> ReactionState {
        self.reaction
    }

    pub fn comments(&self) -> &CommentThread {
        &self.comments
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight > 0
    }

    fn spawn<F>(&mut self, work: F)
    where
        F: FnOnce(&dyn WatchService) -> WatchResponse + Send + 'static,
    {
        self.in_flight += 1;
        let service = self.service.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let _ = tx.send(work(service.as_ref()));
        });
    }

    /// Applies the reaction locally, then tells the backend. A failed request
    /// restores the counts from before the press.
    pub fn toggle_reaction(&mut self, reaction: Reaction) -> bool {
        if self.details.is_none() {
            return false;
        }
        let snapshot = self.reaction;
        self.reaction = snapshot.toggled(reaction);
        self.latest_reaction += 1;
        let request_id = self.latest_reaction;
        let video_id = self.video_id.clone();
        self.spawn(move |service| WatchResponse::Reaction {
            request_id,
            snapshot,
            result: service.toggle_reaction(&video_id, reaction),
        });
        true
    }

    /// Counts a view the first time playback starts.
    pub fn start_playback(&mut self) {
        if self.view_counted {
            return;
        }
        self.view_counted = true;
        let service = self.service.clone();
        let video_id = self.video_id.clone();
        thread::spawn(move || {
            if let Err(err) = service.increment_view_count(&video_id) {
                warn!(video_id = %video_id, error = %err, "view count not recorded");
            }
        });
    }

    pub fn load_more_comments(&mut self) -> bool {
        if self.comments.is_loading || !self.comments.has_more {
            return false;
        }
        self.comments.is_loading = true;
        let video_id = self.video_id.clone();
        let cursor = self.comments.last_comment_id.clone();
        self.spawn(move |service| {
            WatchResponse::Comments(service.comments(&video_id, cursor.as_deref()))
        });
        true
    }

    pub fn post_comment(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || self.comments.is_posting {
            return false;
        }
        self.comments.is_posting = true;
        let video_id = self.video_id.clone();
        let text = text.to_string();
        self.spawn(move |service| WatchResponse::Posted(service.post_comment(&video_id, &text)));
        true
    }

    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(response) = self.response_rx.try_recv() {
            self.apply(response);
            changed = true;
        }
        changed
    }

    /// Blocks until all outstanding requests have been applied.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => self.apply(response),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false
                }
            }
        }
        true
    }

    fn apply(&mut self, response: WatchResponse) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match response {
            WatchResponse::Details(Ok(details)) => {
                self.reaction = ReactionState::from_details(&details);
                self.details = Some(details);
            }
            WatchResponse::Details(Err(err)) => {
                warn!(video_id = %self.video_id, error = %err, "video details unavailable");
            }
            WatchResponse::Reaction {
                request_id,
                snapshot,
                result,
            } => {
                if let Err(err) = result {
                    if request_id == self.latest_reaction {
                        warn!(video_id = %self.video_id, error = %err, "reaction failed, reverting");
                        self.reaction = snapshot;
                    } else {
                        debug!(request_id, "failed reaction already superseded");
                    }
                }
            }
            WatchResponse::Comments(result) => {
                self.comments.is_loading = false;
                match result {
                    Ok(page) => self.comments.append(page),
                    Err(err) => {
                        warn!(video_id = %self.video_id, error = %err, "comment page failed")
                    }
                }
            }
            WatchResponse::Posted(result) => {
                self.comments.is_posting = false;
                match result {
                    Ok(comment) => {
                        self.comments.items.insert(0, comment);
                        if let Some(details) = self.details.as_mut() {
                            details.num_comments += 1;
                        }
                    }
                    Err(err) => warn!(video_id = %self.video_id, error = %err, "comment not posted"),
                }
            }
        }
    }
}

/// Coarse age of an upload, in the largest whole unit.
pub fn time_since_upload(uploaded: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - uploaded).num_seconds().max(0);
    if seconds < 60 {
        return format!("{seconds} seconds ago");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes} minutes ago");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours} hours ago");
    }
    let days = hours / 24;
    if days < 30 {
        return format!("{days} days ago");
    }
    let months = days / 30;
    if months < 12 {
        return format!("{months} months ago");
    }
    format!("{} years ago", months / 12)
}
