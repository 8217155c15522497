use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tracing_subscriber::EnvFilter;

use crate::api::{self, TokenProvider, VideoSummary};
use crate::auth::{self, StaticTokenProvider};
use crate::config::{self, Config};
use crate::data::{ApiFeedService, ApiUploadService, ApiWatchService};
use crate::feed::{FeedContext, FeedLoader, LoaderOptions, Phase, Visibility};
use crate::media::{LocalAsset, Previews};
use crate::notify::ConsoleNotifier;
use crate::profile::{DeleteOutcome, ProfileActions};
use crate::session::{self, SessionError};
use crate::storage;
use crate::upload::{Coordinator, UploadOptions, UploadOutcome};
use crate::watch::{time_since_upload, WatchPage};

pub const LOG_ENV: &str = "SCUFFTUBE_LOG";

pub const USAGE: &str = "scufftube - Scufftube video client.

Usage:
  scufftube login <refresh-token> [--api-key KEY]
  scufftube logout
  scufftube whoami
  scufftube feed [home | user <uid> | search <query>] [--pages N]
  scufftube upload --title TITLE [--description TEXT] <video> [--thumbnail <image>]
  scufftube delete <video-id>
  scufftube watch <video-id>

  --version, -V        Show version and exit
  --help,    -h        Show this help message";

const UPLOAD_WAIT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Login {
        refresh_token: String,
        api_key: Option<String>,
    },
    Logout,
    Whoami,
    Feed {
        context: FeedContext,
        pages: u32,
    },
    Upload {
        title: String,
        description: String,
        video: PathBuf,
        thumbnail: Option<PathBuf>,
    },
    Delete {
        video_id: String,
    },
    Watch {
        video_id: String,
    },
}

pub fn parse_args(args: &[String]) -> Result<Command> {
    let mut iter = args.iter().map(String::as_str);
    let Some(command) = iter.next() else {
        return Ok(Command::Help);
    };

    match command {
        "help" => Ok(Command::Help),
        "login" => {
            let mut refresh_token = None;
            let mut api_key = None;
            while let Some(arg) = iter.next() {
                match arg {
                    "--api-key" => api_key = Some(flag_value(&mut iter, arg)?),
                    other if refresh_token.is_none() => refresh_token = Some(other.to_string()),
                    other => bail!("login: unexpected argument {other:?}"),
                }
            }
            let refresh_token =
                refresh_token.ok_or_else(|| anyhow!("login: a refresh token is required"))?;
            Ok(Command::Login {
                refresh_token,
                api_key,
            })
        }
        "logout" => Ok(Command::Logout),
        "whoami" => Ok(Command::Whoami),
        "feed" => {
            let mut pages = 1;
            let mut words = Vec::new();
            while let Some(arg) = iter.next() {
                match arg {
                    "--pages" => {
                        pages = flag_value(&mut iter, arg)?
                            .parse()
                            .context("feed: --pages expects a number")?;
                    }
                    other => words.push(other.to_string()),
                }
            }
            let context = match words.split_first() {
                None => FeedContext::Home,
                Some((kind, rest)) => match (kind.as_str(), rest) {
                    ("home", []) => FeedContext::Home,
                    ("user", [user_id]) => FeedContext::Uploader {
                        user_id: user_id.clone(),
                    },
                    ("search", query) if !query.is_empty() => FeedContext::Search {
                        query: query.join(" "),
                    },
                    _ => bail!("feed: expected home, user <uid> or search <query>"),
                },
            };
            Ok(Command::Feed {
                context,
                pages: pages.max(1),
            })
        }
        "upload" => {
            let mut title = None;
            let mut description = String::new();
            let mut video = None;
            let mut thumbnail = None;
            while let Some(arg) = iter.next() {
                match arg {
                    "--title" => title = Some(flag_value(&mut iter, arg)?),
                    "--description" => description = flag_value(&mut iter, arg)?,
                    "--thumbnail" => thumbnail = Some(PathBuf::from(flag_value(&mut iter, arg)?)),
                    other if video.is_none() => video = Some(PathBuf::from(other)),
                    other => bail!("upload: unexpected argument {other:?}"),
                }
            }
            Ok(Command::Upload {
                title: title.ok_or_else(|| anyhow!("upload: --title is required"))?,
                description,
                video: video.ok_or_else(|| anyhow!("upload: a video file is required"))?,
                thumbnail,
            })
        }
        "delete" => Ok(Command::Delete {
            video_id: single_arg(&mut iter, "delete", "a video id")?,
        }),
        "watch" => Ok(Command::Watch {
            video_id: single_arg(&mut iter, "watch", "a video id")?,
        }),
        other => bail!("unknown command {other:?}; see --help"),
    }
}

fn flag_value<'a>(iter: &mut impl Iterator<Item = &'a str>, flag: &str) -> Result<String> {
    iter.next()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{flag} expects a value"))
}

fn single_arg<'a>(
    iter: &mut impl Iterator<Item = &'a str>,
    command: &str,
    what: &str,
) -> Result<String> {
    let value = iter
        .next()
        .ok_or_else(|| anyhow!("{command}: {what} is required"))?;
    if let Some(extra) = iter.next() {
        bail!("{command}: unexpected argument {extra:?}");
    }
    Ok(value.to_string())
}

pub fn run() -> Result<()> {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let app = App::new(cfg)?;
    app.execute(command)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

struct App {
    cfg: Config,
    session: Arc<session::Manager>,
}

impl App {
    fn new(cfg: Config) -> Result<Self> {
        let store =
            Arc::new(storage::Store::open(storage::Options::default()).context("open storage")?);
        let flow = Arc::new(auth::Flow::new(store.clone(), auth_config(&cfg))?);
        let session = Arc::new(session::Manager::new(store, flow));
        Ok(Self { cfg, session })
    }

    fn execute(self, command: Command) -> Result<()> {
        match command {
            Command::Help => {
                println!("{USAGE}");
                Ok(())
            }
            Command::Login {
                refresh_token,
                api_key,
            } => self.login(&refresh_token, api_key),
            Command::Logout => self.logout(),
            Command::Whoami => self.whoami(),
            Command::Feed { context, pages } => self.feed(context, pages),
            Command::Upload {
                title,
                description,
                video,
                thumbnail,
            } => self.upload(title, description, video, thumbnail),
            Command::Delete { video_id } => self.delete(&video_id),
            Command::Watch { video_id } => self.watch(&video_id),
        }
    }

    fn wait_timeout(&self) -> Duration {
        self.cfg.api.timeout * 2
    }

    fn token_provider(&self) -> Result<Arc<dyn TokenProvider>> {
        if let Some(token) = self.cfg.auth.id_token.as_deref() {
            return Ok(Arc::new(StaticTokenProvider::new(token)));
        }
        if self.session.load_existing()?.is_none() {
            return Err(SessionError::SignedOut)
                .context("run `scufftube login <refresh-token>` first");
        }
        Ok(self.session.clone())
    }

    fn client(&self) -> Result<Arc<api::Client>> {
        let client = api::Client::new(
            self.token_provider()?,
            api::ClientConfig {
                base_url: Some(self.cfg.api.base_url.clone()),
                timeout: Some(self.cfg.api.timeout),
                http_client: None,
            },
        )?;
        Ok(Arc::new(client))
    }

    fn current_uid(&self) -> Result<String> {
        if let Some(token) = self.cfg.auth.id_token.as_deref() {
            return Ok(auth::decode_identity(token)?.uid);
        }
        self.session
            .load_existing()?
            .map(|user| user.uid)
            .ok_or_else(|| anyhow!(SessionError::SignedOut))
    }

    fn login(mut self, refresh_token: &str, api_key: Option<String>) -> Result<()> {
        if let Some(api_key) = api_key {
            let path = config::save_api_key(None, &api_key)?;
            println!("Saved API key to {}", path.display());
            self.cfg.auth.api_key = api_key.trim().to_string();
            let app = App::new(self.cfg)?;
            self = app;
        }
        let user = self.session.sign_in(refresh_token)?;
        println!("Signed in as {} ({})", user.display_name, user.uid);
        Ok(())
    }

    fn logout(&self) -> Result<()> {
        self.session.load_existing()?;
        if self.session.sign_out()? {
            println!("Signed out");
        } else {
            println!("Not signed in");
        }
        Ok(())
    }

    fn whoami(&self) -> Result<()> {
        if let Some(token) = self.cfg.auth.id_token.as_deref() {
            let identity = auth::decode_identity(token)?;
            println!("{} ({}) [static token]", identity.display_name, identity.uid);
            return Ok(());
        }
        match self.session.load_existing()? {
            Some(user) => println!("{} ({})", user.display_name, user.uid),
            None => println!("Not signed in"),
        }
        Ok(())
    }

    fn feed(&self, context: FeedContext, pages: u32) -> Result<()> {
        let service = Arc::new(ApiFeedService::new(self.client()?));
        let mut loader = FeedLoader::new(service, loader_options(&self.cfg));
        loader.reset(context);
        if !loader.wait(self.wait_timeout()) {
            bail!("feed: timed out waiting for the first page");
        }

        for _ in 1..pages {
            if !loader.handle_visibility(Visibility::Entered { ratio: 1.0 }) {
                break;
            }
            loader.handle_visibility(Visibility::Left);
            if !loader.wait(self.wait_timeout()) {
                bail!("feed: timed out waiting for more videos");
            }
        }

        let now = Utc::now();
        for video in loader.items() {
            println!("{}", format_summary(video, now));
        }
        if loader.phase() == Phase::Exhausted {
            println!("(end of feed)");
        }
        Ok(())
    }

    fn upload(
        &self,
        title: String,
        description: String,
        video: PathBuf,
        thumbnail: Option<PathBuf>,
    ) -> Result<()> {
        let service = Arc::new(ApiUploadService::new(self.client()?));
        let mut coordinator = Coordinator::new(
            service,
            Arc::new(ConsoleNotifier),
            Previews::new(),
            upload_options(&self.cfg),
        );
        coordinator.set_title(title);
        coordinator.set_description(description);

        let video = LocalAsset::open(&video)?;
        println!("Video: {} ({})", video.name, video.size_label());
        coordinator.select_video_asset(video)?;
        if let Some(path) = thumbnail {
            coordinator.select_thumbnail_asset(LocalAsset::open(&path)?)?;
        }

        coordinator.submit()?;
        match coordinator.wait(UPLOAD_WAIT) {
            Some(UploadOutcome::Uploaded { video_id }) => {
                println!("Video id: {video_id}");
                Ok(())
            }
            Some(UploadOutcome::Failed) => {
                let detail = coordinator
                    .last_failure()
                    .map(|err| describe(err))
                    .unwrap_or_default();
                bail!("upload failed: {detail}")
            }
            Some(UploadOutcome::Cancelled) => bail!("upload cancelled"),
            None => bail!("upload timed out"),
        }
    }

    fn delete(&self, video_id: &str) -> Result<()> {
        let client = self.client()?;
        let uid = self.current_uid()?;
        let mut feed = FeedLoader::new(
            Arc::new(ApiFeedService::new(client.clone())),
            loader_options(&self.cfg),
        );
        feed.reset(FeedContext::Uploader { user_id: uid });
        feed.wait(self.wait_timeout());

        let mut actions = ProfileActions::new(
            Arc::new(ApiUploadService::new(client)),
            Arc::new(ConsoleNotifier),
        );
        actions.delete_video(video_id);
        let outcomes = actions.wait(&mut feed, self.wait_timeout());
        match outcomes.first() {
            Some(DeleteOutcome::Deleted { .. }) => {
                println!("{} videos left on your first page", feed.items().len());
                Ok(())
            }
            Some(DeleteOutcome::Failed { video_id }) => bail!("could not delete {video_id}"),
            None => bail!("delete timed out"),
        }
    }

    fn watch(&self, video_id: &str) -> Result<()> {
        let service = Arc::new(ApiWatchService::new(self.client()?));
        let mut page = WatchPage::open(service, video_id);
        page.wait(self.wait_timeout());
        let details = page
            .details()
            .ok_or_else(|| anyhow!("video {video_id} could not be loaded"))?;

        let now = Utc::now();
        let reaction = page.reaction();
        println!("{}", details.title);
        println!(
            "{} • {} views • {}",
            details.uploader_display_name,
            details.views,
            time_since_upload(details.upload_timestamp, now)
        );
        println!("{} likes, {} dislikes", reaction.likes, reaction.dislikes);
        if !details.description.is_empty() {
            println!("\n{}", details.description);
        }
        println!("\n{}\n", details.video_url);
        println!("{} Comments", details.num_comments);
        for comment in &page.comments().items {
            println!(
                "  {} ({}): {}",
                comment.commenter_display_name,
                time_since_upload(comment.comment_timestamp, now),
                comment.comment
            );
        }
        Ok(())
    }
}

fn auth_config(cfg: &Config) -> auth::Config {
    auth::Config {
        api_key: cfg.auth.api_key.clone(),
        token_url: cfg.auth.token_url.clone(),
        refresh_skew: cfg.auth.refresh_skew,
        timeout: cfg.api.timeout,
    }
}

fn loader_options(cfg: &Config) -> LoaderOptions {
    LoaderOptions {
        page_size: cfg.feed.page_size,
        recommended_page_size: cfg.feed.recommended_page_size,
        sentinel_threshold: cfg.feed.sentinel_threshold,
    }
}

fn upload_options(cfg: &Config) -> UploadOptions {
    UploadOptions {
        min_thumbnail_width: cfg.upload.min_thumbnail_width,
    }
}

fn format_summary(video: &VideoSummary, now: chrono::DateTime<Utc>) -> String {
    format!(
        "{}  {}\n    {} • {} views • {}",
        video.id,
        video.title,
        video.uploader_name,
        video.view_count,
        time_since_upload(video.upload_timestamp, now)
    )
}

fn describe(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
