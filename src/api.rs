use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Body, Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::media::LocalAsset;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000/";

/// Supplies the bearer credential attached to every API request.
///
/// Implementations are asked once per request; the client never holds on to
/// a token between calls because ID tokens expire.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<IdToken>;
}

#[derive(Debug, Clone)]
pub struct IdToken {
    pub token: String,
    pub expires_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    pub page: u32,
    pub page_size: u32,
    pub extra: Vec<(String, String)>,
}

impl PageOptions {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            extra: Vec::new(),
        }
    }

    fn into_params(self) -> Vec<(String, String)> {
        let mut params = self.extra;
        params.push(("page".into(), self.page.to_string()));
        params.push(("pageSize".into(), self.page_size.to_string()));
        params
    }
}

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    base_url: Url,
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = parse_base_url(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()
                .context("api: build http client")?,
        };

        Ok(Client {
            token_provider,
            http,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn video_options(
        &self,
        seed: &str,
        exclude: Option<&str>,
        opts: PageOptions,
    ) -> Result<VideoPage> {
        let mut opts = opts;
        opts.extra.push(("seed".into(), seed.to_string()));
        if let Some(exclude) = exclude {
            opts.extra.push(("exclude".into(), exclude.to_string()));
        }
        self.fetch_json(Method::GET, &["video", "options"], &opts.into_params(), None)
    }

    pub fn search(&self, query: &str, opts: PageOptions) -> Result<VideoPage> {
        let mut opts = opts;
        opts.extra.push(("query".into(), query.to_string()));
        self.fetch_json(Method::GET, &["video", "search"], &opts.into_params(), None)
    }

    pub fn user_videos(&self, user_id: &str, opts: PageOptions) -> Result<VideoPage> {
        if user_id.trim().is_empty() {
            bail!("api: user id is required");
        }
        self.fetch_json(
            Method::GET,
            &["user", user_id.trim(), "videos"],
            &opts.into_params(),
            None,
        )
    }

    pub fn create_video(&self, video: &NewVideo) -> Result<UploadTargets> {
        if video.title.trim().is_empty() {
            bail!("api: video title is required");
        }
        let body = serde_json::to_value(video).context("api: encode video metadata")?;
        let targets: UploadTargets = self.fetch_json(Method::POST, &["video"], &[], Some(body))?;
        if targets.video_id.is_empty() {
            bail!("api: metadata response missing video id");
        }
        Ok(targets)
    }

    /// Transfers a local file to a signed upload URL.
    ///
    /// Signed targets carry their own authorization, so no bearer header is
    /// attached here.
    pub fn put_asset(&self, target: &str, asset: &LocalAsset) -> Result<()> {
        let url = Url::parse(target).with_context(|| format!("api: invalid upload target {target}"))?;
        let file = File::open(&asset.path)
            .with_context(|| format!("api: open {}", asset.path.display()))?;
        let resp = self
            .http
            .put(url)
            .header(CONTENT_TYPE, asset.content_type.clone())
            .body(Body::sized(file, asset.size))
            .send()
            .context("api: upload asset")?;
        check_status(resp).map(|_| ())
    }

    pub fn generate_thumbnail(&self, video_id: &str) -> Result<()> {
        self.request(Method::POST, &["video", video_id, "thumbnail"], &[], None)?;
        Ok(())
    }

    pub fn delete_video(&self, video_id: &str) -> Result<()> {
        self.request(Method::DELETE, &["video", video_id], &[], None)?;
        Ok(())
    }

    pub fn video_details(&self, video_id: &str) -> Result<VideoDetails> {
        self.fetch_json(Method::GET, &["video", video_id], &[], None)
    }

    pub fn increment_view_count(&self, video_id: &str) -> Result<()> {
        self.request(Method::POST, &["video", video_id, "view"], &[], None)?;
        Ok(())
    }

    pub fn toggle_reaction(&self, video_id: &str, reaction: Reaction) -> Result<()> {
        self.request(
            Method::POST,
            &["video", video_id, "reaction"],
            &[],
            Some(json!({ "type": reaction.as_str() })),
        )?;
        Ok(())
    }

    pub fn comments(&self, video_id: &str, last_comment_id: Option<&str>) -> Result<CommentPage> {
        let mut params = Vec::new();
        if let Some(last) = last_comment_id {
            params.push(("lastCommentId".to_string(), last.to_string()));
        }
        self.fetch_json(Method::GET, &["video", video_id, "comments"], &params, None)
    }

    pub fn post_comment(&self, video_id: &str, text: &str) -> Result<CommentDetails> {
        if text.trim().is_empty() {
            bail!("api: comment text is required");
        }
        self.fetch_json(
            Method::POST,
            &["video", video_id, "comments"],
            &[],
            Some(json!({ "comment": text.trim() })),
        )
    }

    fn fetch_json<T>(
        &self,
        method: Method,
        segments: &[&str],
        params: &[(String, String)],
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(method, segments, params, body)?;
        resp.json()
            .with_context(|| format!("api: decode response for {}", segments.join("/")))
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
        params: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Response> {
        let req = self.prepare(method, segments, params, body)?;
        let resp = req
            .send()
            .with_context(|| format!("api: request {}", segments.join("/")))?;
        check_status(resp)
    }

    /// Builds an authorized request. A token is fetched from the provider
    /// every time.
    fn prepare(
        &self,
        method: Method,
        segments: &[&str],
        params: &[(String, String)],
        body: Option<Value>,
    ) -> Result<RequestBuilder> {
        let token = self.token_provider.token()?;
        let url = self.endpoint(segments, params)?;
        let mut req = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", token.token));
        if let Some(body) = body {
            req = req.json(&body);
        }
        Ok(req)
    }

    /// Appends `segments` to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str], params: &[(String, String)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("api: base url {} cannot take a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }
}

fn parse_base_url(base: &str) -> Result<Url> {
    let mut normalized = base.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).with_context(|| format!("api: invalid base url {base}"))
}

fn check_status(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    match status.as_u16() {
        401 => Err(anyhow!("api: unauthorized")),
        403 => Err(anyhow!("api: forbidden")),
        404 => Err(anyhow!("api: not found")),
        _ => Err(anyhow!("api: api error {}: {}", status, body)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    #[serde(rename = "uploaderDisplayName", default)]
    pub uploader_name: String,
    #[serde(rename = "uploaderPfp", default)]
    pub uploader_avatar_url: String,
    #[serde(rename = "uploadDate")]
    pub upload_timestamp: DateTime<Utc>,
    #[serde(rename = "views", default)]
    pub view_count: u64,
    #[serde(rename = "thumbnailSignedLink", default)]
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoPage {
    #[serde(rename = "videoOptions", default)]
    pub items: Vec<VideoSummary>,
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub video_content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTargets {
    #[serde(rename = "videoId")]
    pub video_id: String,
    #[serde(rename = "videoUploadUrl")]
    pub video_upload_target: String,
    #[serde(rename = "thumbnailUploadUrl", default)]
    pub thumbnail_upload_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Like,
    Dislike,
}

impl Reaction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reaction::Like => "like",
            Reaction::Dislike => "dislike",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub uploader_display_name: String,
    #[serde(rename = "uploaderPfp", default)]
    pub uploader_avatar_url: String,
    pub upload_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub views: u64,
    #[serde(rename = "videoSignedUrl", default)]
    pub video_url: String,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub dislikes: u64,
    #[serde(default)]
    pub num_comments: u64,
    #[serde(rename = "userLikeStatus", default)]
    pub user_reaction: Option<Reaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentDetails {
    pub id: String,
    pub comment: String,
    #[serde(default)]
    pub commenter_display_name: String,
    #[serde(rename = "commenterPfp", default)]
    pub commenter_avatar_url: Option<String>,
    pub comment_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentPage {
    #[serde(default)]
    pub comments: Vec<CommentDetails>,
    #[serde(default)]
    pub has_more: bool,
}
