//! Incrementally growing video feeds.
//!
//! A [`FeedLoader`] owns the list for one feed view. Fetches run on worker
//! threads and report back over a channel; the owner applies them in
//! [`FeedLoader::poll`] or [`FeedLoader::wait`]. Every reset bumps a cycle
//! token, and responses carrying an older token are dropped unapplied.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use crate::api::{VideoPage, VideoSummary};
use crate::data::FeedService;

pub const DEFAULT_PAGE_SIZE: u32 = 15;
pub const RECOMMENDED_PAGE_SIZE: u32 = 10;
pub const DEFAULT_SENTINEL_THRESHOLD: f32 = 1.0;

const SEED_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedContext {
    Home,
    Uploader { user_id: String },
    Search { query: String },
    Recommended { exclude: String },
}

impl FeedContext {
    fn uses_seed(&self) -> bool {
        matches!(self, FeedContext::Home | FeedContext::Recommended { .. })
    }
}

impl fmt::Display for FeedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedContext::Home => write!(f, "home"),
            FeedContext::Uploader { user_id } => write!(f, "uploader {user_id}"),
            FeedContext::Search { query } => write!(f, "search \"{query}\""),
            FeedContext::Recommended { exclude } => write!(f, "recommended (excluding {exclude})"),
        }
    }
}

/// What a page request is asked for: the context plus the ordering seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    pub context: FeedContext,
    pub seed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedState {
    pub items: Vec<VideoSummary>,
    /// Next page to request.
    pub page: u32,
    pub query_seed: Option<String>,
    pub has_more: bool,
    pub is_loading: bool,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            page: 1,
            query_seed: None,
            has_more: true,
            is_loading: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Exhausted,
}

/// Visibility transitions of the marker placed after the last item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Visibility {
    Entered { ratio: f32 },
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sentinel {
    threshold: f32,
    armed: bool,
    visible: bool,
}

impl Sentinel {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            armed: true,
            visible: false,
        }
    }

    pub fn observe(&mut self, event: Visibility) {
        self.visible = match event {
            Visibility::Entered { ratio } => ratio >= self.threshold,
            Visibility::Left => false,
        };
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    fn should_fire(&self) -> bool {
        self.armed && self.visible
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
        self.visible = false;
    }

    /// Forgets the last sighting so the next page waits for a fresh
    /// `Entered` event.
    fn lose_sight(&mut self) {
        self.visible = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderOptions {
    pub page_size: u32,
    pub recommended_page_size: u32,
    pub sentinel_threshold: f32,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            recommended_page_size: RECOMMENDED_PAGE_SIZE,
            sentinel_threshold: DEFAULT_SENTINEL_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LoadMode {
    Replace,
    Append,
}

struct PendingPage {
    cycle: u64,
    page: u32,
    mode: LoadMode,
}

struct PageResponse {
    cycle: u64,
    page: u32,
    result: Result<VideoPage>,
}

pub struct FeedLoader {
    service: Arc<dyn FeedService>,
    options: LoaderOptions,
    context: FeedContext,
    state: FeedState,
    seen: HashSet<String>,
    cycle: u64,
    pending: Option<PendingPage>,
    sentinel: Sentinel,
    response_tx: Sender<PageResponse>,
    response_rx: Receiver<PageResponse>,
}

impl FeedLoader {
    pub fn new(service: Arc<dyn FeedService>, options: LoaderOptions) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            service,
            options,
            context: FeedContext::Home,
            state: FeedState::default(),
            seen: HashSet::new(),
            cycle: 0,
            pending: None,
            sentinel: Sentinel::new(options.sentinel_threshold),
            response_tx,
            response_rx,
        }
    }

    pub fn state(&self) -> &FeedState {
        &self.state
    }

    pub fn items(&self) -> &[VideoSummary] {
        &self.state.items
    }

    pub fn context(&self) -> &FeedContext {
        &self.context
    }

    pub fn sentinel(&self) -> &Sentinel {
        &self.sentinel
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn phase(&self) -> Phase {
        if self.state.is_loading {
            Phase::Loading
        } else if !self.state.has_more {
            Phase::Exhausted
        } else {
            Phase::Idle
        }
    }

    pub fn page_size(&self) -> u32 {
        match self.context {
            FeedContext::Recommended { .. } => self.options.recommended_page_size,
            _ => self.options.page_size,
        }
    }

    /// Switches to `context` and starts fetching its first page.
    ///
    /// Any fetch still in flight from an earlier cycle is abandoned; its
    /// response is discarded when it arrives.
    pub fn reset(&mut self, context: FeedContext) {
        self.cycle = self.cycle.wrapping_add(1);
        let query_seed = context.uses_seed().then(new_seed);
        self.context = context;
        self.state = FeedState {
            items: Vec::new(),
            page: 1,
            query_seed,
            has_more: true,
            is_loading: true,
        };
        self.seen.clear();
        self.sentinel.arm();
        self.dispatch(LoadMode::Replace);
    }

    /// Requests the next page unless a fetch is in flight or the feed is
    /// exhausted. Returns whether a request was dispatched.
    pub fn load_more(&mut self) -> bool {
        if self.state.is_loading || !self.state.has_more {
            return false;
        }
        self.state.is_loading = true;
        self.dispatch(LoadMode::Append);
        true
    }

    pub fn handle_visibility(&mut self, event: Visibility) -> bool {
        self.sentinel.observe(event);
        if self.sentinel.should_fire() {
            self.load_more()
        } else {
            false
        }
    }

    /// Drops a summary from the list, e.g. after the video was deleted.
    pub fn remove(&mut self, video_id: &str) -> bool {
        let before = self.state.items.len();
        self.state.items.retain(|item| item.id != video_id);
        before != self.state.items.len()
    }

    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(response) = self.response_rx.try_recv() {
            changed |= self.apply(response);
        }
        changed
    }

    /// Blocks until no fetch is in flight or `timeout` passes. Returns
    /// whether the loader ended up idle.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => {
                    self.apply(response);
                }
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    fn query(&self) -> FeedQuery {
        FeedQuery {
            context: self.context.clone(),
            seed: self.state.query_seed.clone(),
        }
    }

    fn dispatch(&mut self, mode: LoadMode) {
        let cycle = self.cycle;
        let page = self.state.page;
        let page_size = self.page_size();
        let query = self.query();
        self.pending = Some(PendingPage { cycle, page, mode });
        debug!(context = %query.context, page, page_size, cycle, "fetching feed page");

        let service = self.service.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.fetch_feed_page(&query, page, page_size);
            let _ = tx.send(PageResponse {
                cycle,
                page,
                result,
            });
        });
    }

    fn apply(&mut self, response: PageResponse) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        if response.cycle != self.cycle
            || pending.cycle != response.cycle
            || pending.page != response.page
        {
            debug!(
                cycle = response.cycle,
                current = self.cycle,
                page = response.page,
                "discarding stale feed page"
            );
            return false;
        }
        let mode = pending.mode;
        self.pending = None;
        self.state.is_loading = false;

        let mut progressed = false;
        match response.result {
            Ok(batch) => {
                let received = batch.items.len();
                self.append_unique(batch.items);
                match mode {
                    LoadMode::Replace => self.state.page += 1,
                    LoadMode::Append if received > 0 => self.state.page += 1,
                    LoadMode::Append => {}
                }
                progressed = received > 0;
                if !batch.has_more {
                    self.state.has_more = false;
                }
            }
            Err(err) => {
                warn!(
                    context = %self.context,
                    page = response.page,
                    error = %err,
                    "feed page fetch failed"
                );
            }
        }

        if !self.state.has_more {
            self.sentinel.disarm();
        } else if !progressed {
            self.sentinel.lose_sight();
        } else if self.sentinel.should_fire() {
            self.load_more();
        }
        true
    }

    fn append_unique(&mut self, items: Vec<VideoSummary>) {
        for item in items {
            if self.seen.insert(item.id.clone()) {
                self.state.items.push(item);
            }
        }
    }
}

fn new_seed() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SEED_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{TimeZone, Utc};

    use crate::api::VideoSummary;

    pub fn summary(id: &str) -> VideoSummary {
        VideoSummary {
            id: id.to_string(),
            title: format!("Video {id}"),
            uploader_name: "uploader".into(),
            uploader_avatar_url: String::new(),
            upload_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            view_count: 0,
            thumbnail_url: String::new(),
        }
    }

    pub fn summaries(prefix: &str, count: usize) -> Vec<VideoSummary> {
        (0..count)
            .map(|i| summary(&format!("{prefix}{i}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    type Script = Box<dyn Fn(&FeedQuery, u32) -> Result<VideoPage> + Send + Sync>;

    struct FakeFeed {
        script: Script,
        calls: Mutex<Vec<(FeedQuery, u32, u32)>>,
        gate: Option<Receiver<()>>,
    }

    impl FakeFeed {
        fn new(script: impl Fn(&FeedQuery, u32) -> Result<VideoPage> + Send + Sync + 'static) -> Self {
            Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn gated(mut self) -> (Self, Sender<()>) {
            let (tx, rx) = unbounded();
            self.gate = Some(rx);
            (self, tx)
        }

        fn calls(&self) -> Vec<(FeedQuery, u32, u32)> {
            self.calls.lock().clone()
        }
    }

    impl FeedService for FakeFeed {
        fn fetch_feed_page(&self, query: &FeedQuery, page: u32, page_size: u32) -> Result<VideoPage> {
            self.calls.lock().push((query.clone(), page, page_size));
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            (self.script)(query, page)
        }
    }

    fn page(items: Vec<VideoSummary>, has_more: bool) -> Result<VideoPage> {
        Ok(VideoPage { items, has_more })
    }

    fn loader(fake: &Arc<FakeFeed>) -> FeedLoader {
        FeedLoader::new(fake.clone(), LoaderOptions::default())
    }

    #[test]
    fn reset_loads_first_page_in_server_order() {
        let fake = Arc::new(FakeFeed::new(|_, _| page(summaries("a", 3), true)));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert_eq!(feed.phase(), Phase::Loading);
        assert!(feed.wait(WAIT));

        let ids: Vec<_> = feed.items().iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["a0", "a1", "a2"]);
        assert_eq!(feed.state().page, 2);
        assert!(feed.state().has_more);
        assert!(!feed.state().is_loading);
        assert_eq!(fake.calls()[0].1, 1);
        assert_eq!(fake.calls()[0].2, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn load_more_is_ignored_while_a_fetch_is_in_flight() {
        let (fake, gate) = FakeFeed::new(|_, p| page(summaries(&format!("p{p}-"), 2), true)).gated();
        let fake = Arc::new(fake);
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        for _ in 0..5 {
            assert!(!feed.load_more());
            assert!(!feed.handle_visibility(Visibility::Entered { ratio: 1.0 }));
        }
        feed.handle_visibility(Visibility::Left);
        gate.send(()).unwrap();
        assert!(feed.wait(WAIT));

        assert_eq!(fake.calls().len(), 1);
        assert_eq!(feed.items().len(), 2);
        assert_eq!(feed.state().page, 2);
    }

    #[test]
    fn visible_sentinel_keeps_loading_until_exhausted() {
        let fake = Arc::new(FakeFeed::new(|_, p| {
            page(summaries(&format!("p{p}-"), 2), p < 3)
        }));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));
        assert!(feed.handle_visibility(Visibility::Entered { ratio: 1.0 }));
        assert!(feed.wait(WAIT));

        let pages: Vec<_> = fake.calls().iter().map(|call| call.1).collect();
        assert_eq!(pages, vec![1, 2, 3]);
        assert_eq!(feed.items().len(), 6);
        assert_eq!(feed.phase(), Phase::Exhausted);
        assert!(!feed.sentinel().is_visible());
    }

    #[test]
    fn exhausted_feed_ignores_load_more() {
        let fake = Arc::new(FakeFeed::new(|_, _| page(summaries("a", 2), false)));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Search { query: "cats".into() });
        assert!(feed.wait(WAIT));
        assert_eq!(feed.phase(), Phase::Exhausted);
        assert!(!feed.sentinel().is_armed());

        let before = feed.state().clone();
        assert!(!feed.load_more());
        assert!(!feed.handle_visibility(Visibility::Entered { ratio: 1.0 }));
        assert!(!feed.poll());
        assert_eq!(feed.state(), &before);
        assert_eq!(fake.calls().len(), 1);
    }

    #[test]
    fn home_feed_fifteen_then_five_exhausts() {
        let fake = Arc::new(FakeFeed::new(|_, p| match p {
            1 => page(summaries("first-", 15), true),
            2 => page(summaries("second-", 5), false),
            _ => Err(anyhow!("unexpected page {p}")),
        }));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));
        assert_eq!(feed.items().len(), 15);

        assert!(feed.handle_visibility(Visibility::Entered { ratio: 1.0 }));
        assert!(feed.wait(WAIT));

        assert_eq!(feed.items().len(), 20);
        assert!(!feed.state().has_more);
        assert!(!feed.sentinel().is_armed());
        assert_eq!(feed.phase(), Phase::Exhausted);

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].0.seed.is_some());
        assert_eq!(calls[0].0.seed, calls[1].0.seed);
        assert_eq!((calls[0].1, calls[1].1), (1, 2));
    }

    #[test]
    fn superseded_reset_result_is_discarded() {
        let (fake, gate) = FakeFeed::new(|query, _| match &query.context {
            FeedContext::Search { query } => page(summaries(&format!("{query}-"), 2), true),
            _ => page(Vec::new(), false),
        })
        .gated();
        let fake = Arc::new(fake);
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Search { query: "old".into() });
        feed.reset(FeedContext::Search { query: "new".into() });
        gate.send(()).unwrap();
        gate.send(()).unwrap();
        assert!(feed.wait(WAIT));
        // Let the older worker deliver too, then drain it.
        thread::sleep(Duration::from_millis(50));
        feed.poll();

        let ids: Vec<_> = feed.items().iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["new-0", "new-1"]);
        assert_eq!(feed.state().page, 2);
        assert_eq!(feed.cycle(), 2);
    }

    #[test]
    fn failed_page_leaves_loader_usable() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let fake = Arc::new(FakeFeed::new(move |_, p| {
            if p == 2 {
                let mut n = counter.lock();
                *n += 1;
                if *n == 1 {
                    return Err(anyhow!("connection reset"));
                }
                return page(summaries("b", 1), false);
            }
            page(summaries("a", 2), true)
        }));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Uploader { user_id: "u1".into() });
        assert!(feed.wait(WAIT));

        assert!(feed.load_more());
        assert!(feed.wait(WAIT));
        assert_eq!(feed.phase(), Phase::Idle);
        assert_eq!(feed.items().len(), 2);
        assert_eq!(feed.state().page, 2);
        assert!(feed.state().has_more);

        assert!(feed.load_more());
        assert!(feed.wait(WAIT));
        assert_eq!(feed.items().len(), 3);
        assert_eq!(feed.phase(), Phase::Exhausted);
    }

    #[test]
    fn failed_page_does_not_refire_while_sentinel_visible() {
        let fake = Arc::new(FakeFeed::new(|_, p| match p {
            1 => page(summaries("a", 3), true),
            _ => Err(anyhow!("backend down")),
        }));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));

        assert!(feed.handle_visibility(Visibility::Entered { ratio: 1.0 }));
        assert!(feed.wait(WAIT));
        thread::sleep(Duration::from_millis(50));
        feed.poll();

        let second_pages = fake.calls().iter().filter(|call| call.1 == 2).count();
        assert_eq!(second_pages, 1);
        assert_eq!(feed.phase(), Phase::Idle);
        assert!(!feed.sentinel().is_visible());
        assert!(feed.sentinel().is_armed());

        // A fresh sighting retries the same page.
        assert!(feed.handle_visibility(Visibility::Entered { ratio: 1.0 }));
        assert!(feed.wait(WAIT));
        let second_pages = fake.calls().iter().filter(|call| call.1 == 2).count();
        assert_eq!(second_pages, 2);
        assert_eq!(feed.state().page, 2);
    }

    #[test]
    fn empty_page_with_more_waits_for_next_sighting() {
        let fake = Arc::new(FakeFeed::new(|_, p| match p {
            1 => page(summaries("a", 2), true),
            _ => page(Vec::new(), true),
        }));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));

        assert!(feed.handle_visibility(Visibility::Entered { ratio: 1.0 }));
        assert!(feed.wait(WAIT));
        assert_eq!(fake.calls().len(), 2);
        assert_eq!(feed.phase(), Phase::Idle);
        assert_eq!(feed.state().page, 2);
    }

    #[test]
    fn wait_returns_within_budget_while_pages_keep_arriving() {
        let fake = Arc::new(FakeFeed::new(|_, p| {
            thread::sleep(Duration::from_millis(20));
            page(summaries(&format!("p{p}-"), 1), true)
        }));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));
        assert!(feed.handle_visibility(Visibility::Entered { ratio: 1.0 }));

        let budget = Duration::from_millis(200);
        let started = Instant::now();
        assert!(!feed.wait(budget));
        assert!(started.elapsed() < budget + Duration::from_millis(150));
        assert!(fake.calls().len() > 2);
    }

    #[test]
    fn duplicate_ids_are_dropped() {
        let fake = Arc::new(FakeFeed::new(|_, p| match p {
            1 => page(vec![summary("x"), summary("y")], true),
            _ => page(vec![summary("y"), summary("z")], true),
        }));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));
        feed.load_more();
        assert!(feed.wait(WAIT));
        let ids: Vec<_> = feed.items().iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
        assert_eq!(feed.state().page, 3);
    }

    #[test]
    fn partial_visibility_below_threshold_does_not_fetch() {
        let fake = Arc::new(FakeFeed::new(|_, _| page(summaries("a", 1), true)));
        let mut feed = FeedLoader::new(
            fake.clone(),
            LoaderOptions {
                sentinel_threshold: 0.6,
                ..LoaderOptions::default()
            },
        );
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));
        assert!(!feed.handle_visibility(Visibility::Entered { ratio: 0.3 }));
        assert_eq!(fake.calls().len(), 1);
        assert!(feed.handle_visibility(Visibility::Entered { ratio: 0.6 }));
        feed.handle_visibility(Visibility::Left);
        assert!(feed.wait(WAIT));
        assert_eq!(fake.calls().len(), 2);
    }

    #[test]
    fn seeds_only_for_randomized_contexts() {
        let fake = Arc::new(FakeFeed::new(|_, _| page(Vec::new(), false)));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));
        let first = feed.state().query_seed.clone().unwrap();
        assert_eq!(first.len(), SEED_LEN);

        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));
        assert_ne!(feed.state().query_seed.as_deref(), Some(first.as_str()));

        feed.reset(FeedContext::Search { query: "q".into() });
        assert!(feed.wait(WAIT));
        assert!(feed.state().query_seed.is_none());
    }

    #[test]
    fn recommended_feed_uses_smaller_pages() {
        let fake = Arc::new(FakeFeed::new(|_, _| page(Vec::new(), false)));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Recommended { exclude: "v9".into() });
        assert!(feed.wait(WAIT));
        assert_eq!(fake.calls()[0].2, RECOMMENDED_PAGE_SIZE);
    }

    #[test]
    fn remove_drops_deleted_video() {
        let fake = Arc::new(FakeFeed::new(|_, _| page(summaries("a", 3), true)));
        let mut feed = loader(&fake);
        feed.reset(FeedContext::Home);
        assert!(feed.wait(WAIT));
        assert!(feed.remove("a1"));
        assert!(!feed.remove("a1"));
        assert_eq!(feed.items().len(), 2);
    }
}
