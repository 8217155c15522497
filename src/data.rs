use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::{
    self, CommentDetails, CommentPage, NewVideo, PageOptions, Reaction, UploadTargets,
    VideoDetails, VideoPage,
};
use crate::feed::{FeedContext, FeedQuery};
use crate::media::LocalAsset;

pub trait FeedService: Send + Sync {
    fn fetch_feed_page(&self, query: &FeedQuery, page: u32, page_size: u32) -> Result<VideoPage>;
}

pub trait UploadService: Send + Sync {
    fn create_video_metadata(&self, video: &NewVideo) -> Result<UploadTargets>;
    fn put_asset(&self, target: &str, asset: &LocalAsset) -> Result<()>;
    fn generate_thumbnail(&self, video_id: &str) -> Result<()>;
    fn delete_video(&self, video_id: &str) -> Result<()>;
}

pub trait WatchService: Send + Sync {
    fn video_details(&self, video_id: &str) -> Result<VideoDetails>;
    fn increment_view_count(&self, video_id: &str) -> Result<()>;
    fn toggle_reaction(&self, video_id: &str, reaction: Reaction) -> Result<()>;
    fn comments(&self, video_id: &str, last_comment_id: Option<&str>) -> Result<CommentPage>;
    fn post_comment(&self, video_id: &str, text: &str) -> Result<CommentDetails>;
}

pub struct ApiFeedService {
    client: Arc<api::Client>,
}

impl ApiFeedService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl FeedService for ApiFeedService {
    fn fetch_feed_page(&self, query: &FeedQuery, page: u32, page_size: u32) -> Result<VideoPage> {
        let opts = PageOptions::new(page, page_size);
        let seed = query.seed.as_deref().unwrap_or_default();
        match &query.context {
            FeedContext::Home => self
                .client
                .video_options(seed, None, opts)
                .context("fetch home feed"),
            FeedContext::Recommended { exclude } => self
                .client
                .video_options(seed, Some(exclude), opts)
                .context("fetch recommended feed"),
            FeedContext::Uploader { user_id } => self
                .client
                .user_videos(user_id, opts)
                .context("fetch uploader feed"),
            FeedContext::Search { query } => self
                .client
                .search(query, opts)
                .context("fetch search results"),
        }
    }
}

pub struct ApiUploadService {
    client: Arc<api::Client>,
}

impl ApiUploadService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl UploadService for ApiUploadService {
    fn create_video_metadata(&self, video: &NewVideo) -> Result<UploadTargets> {
        self.client
            .create_video(video)
            .context("create video metadata")
    }

    fn put_asset(&self, target: &str, asset: &LocalAsset) -> Result<()> {
        self.client
            .put_asset(target, asset)
            .with_context(|| format!("upload {}", asset.name))
    }

    fn generate_thumbnail(&self, video_id: &str) -> Result<()> {
        self.client
            .generate_thumbnail(video_id)
            .context("request thumbnail generation")
    }

    fn delete_video(&self, video_id: &str) -> Result<()> {
        self.client.delete_video(video_id).context("delete video")
    }
}

pub struct ApiWatchService {
    client: Arc<api::Client>,
}

impl ApiWatchService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl WatchService for ApiWatchService {
    fn video_details(&self, video_id: &str) -> Result<VideoDetails> {
        self.client
            .video_details(video_id)
            .context("fetch video details")
    }

    fn increment_view_count(&self, video_id: &str) -> Result<()> {
        self.client.increment_view_count(video_id)
    }

    fn toggle_reaction(&self, video_id: &str, reaction: Reaction) -> Result<()> {
        self.client.toggle_reaction(video_id, reaction)
    }

    fn comments(&self, video_id: &str, last_comment_id: Option<&str>) -> Result<CommentPage> {
        self.client
            .comments(video_id, last_comment_id)
            .context("fetch comments")
    }

    fn post_comment(&self, video_id: &str, text: &str) -> Result<CommentDetails> {
        self.client.post_comment(video_id, text)
    }
}
