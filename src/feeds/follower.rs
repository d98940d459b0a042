//! The feed follower: discovers feeds behind submitted URLs, creates parrot
//! accounts, diffs feed contents against what we have seen, emits toots for
//! new items, and runs the adaptive polling loop plus the two purge routines.

use crate::config::Config;
use crate::db::{Account, FeedPost, Repo, Toot, TootExtract};
use crate::error::AppError;
use crate::feeds::BlockedFeeds;
use crate::ids::{self, IdBuilder};
use crate::keystore::KeyStore;
use crate::messenger::Messenger;
use crate::metrics::Metrics;
use crate::texts::{strip_html, Texts};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use feed_rs::model::Feed;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

const FEED_CHECK_IDLE_WAKE: Duration = Duration::from_secs(60);
const PANIC_SLEEP: Duration = Duration::from_secs(10);
const FEED_OR_SITE_TIMEOUT: Duration = Duration::from_secs(10);
const POST_COUNT_UPDATE_SECS: i64 = 60;
const ALLOWED_FUTURE_POST_DAYS: i64 = 2;
/// Toots sent for posts that predate a newly created account.
const OLD_TOOTS_TO_SEND: usize = 5;

/// Outcome of resolving a URL to a parrot account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    New,
    AlreadyFollowed,
    Error,
    Mastodon,
    Banned,
    OptOut,
}

/// The seam the inbox talks to when a user requests a feed.
#[async_trait]
pub trait FeedResolver: Send + Sync {
    async fn resolve_feed(&self, url: &str) -> (Option<Account>, FeedStatus);
}

/// What we learned about a site during discovery.
#[derive(Debug, Clone)]
struct SiteInfo {
    url: String,
    parrot_handle: String,
    feed_url: String,
    title: String,
    description: String,
}

/// A feed entry reduced to the fields ingestion works with.
#[derive(Debug, Clone)]
struct FeedItem {
    guid: String,
    link: String,
    title: String,
    description: String,
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    audio_enclosures: Vec<String>,
}

pub struct FeedFollower {
    cfg: Arc<Config>,
    repo: Arc<Repo>,
    blocked: BlockedFeeds,
    messenger: Arc<Messenger>,
    texts: Texts,
    keystore: Arc<KeyStore>,
    metrics: Arc<Metrics>,
    idb: IdBuilder,
    client: reqwest::Client,
    // single-run gates: only one purge of each kind at a time, process-wide
    purging_old_posts: Mutex<bool>,
    purging_unfollowed: Mutex<bool>,
    last_checked_post_count: Mutex<DateTime<Utc>>,
}

impl FeedFollower {
    pub fn new(
        cfg: Arc<Config>,
        repo: Arc<Repo>,
        blocked: BlockedFeeds,
        messenger: Arc<Messenger>,
        texts: Texts,
        keystore: Arc<KeyStore>,
        metrics: Arc<Metrics>,
    ) -> Result<FeedFollower, AppError> {
        let client = reqwest::Client::builder()
            .timeout(FEED_OR_SITE_TIMEOUT)
            .user_agent(crate::user_agent(&cfg.host))
            .build()?;
        let idb = IdBuilder::new(cfg.host.clone());
        Ok(FeedFollower {
            cfg,
            repo,
            blocked,
            messenger,
            texts,
            keystore,
            metrics,
            idb,
            client,
            purging_old_posts: Mutex::new(false),
            purging_unfollowed: Mutex::new(false),
            last_checked_post_count: Mutex::new(DateTime::<Utc>::MIN_UTC),
        })
    }

    // ------------------------------------------------------------------
    // Discovery

    /// Resolves a submitted URL to a parrot account, creating it if needed.
    /// Discovery failures are a status, not an error; `Err` is reserved for
    /// internal trouble (database, key generation).
    pub async fn get_account_for_feed(
        &self,
        url_str: &str,
    ) -> Result<(Option<Account>, FeedStatus), AppError> {
        info!(url_str, "retrieving site information");

        let (site, feed) = match self.get_site_info(url_str).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, url_str, "feed discovery failed");
                self.metrics.feed_requested("failed");
                return Ok((None, FeedStatus::Error));
            }
        };
        if let Err(err) = validate_site_info(&site) {
            warn!(%err, url_str, "site info failed validation");
            self.metrics.feed_requested("failed");
            return Ok((None, FeedStatus::Error));
        }

        if let Some(status) = self.filter_feed(&site.feed_url, &feed).await? {
            self.metrics.feed_requested("failed");
            return Ok((None, status));
        }

        let (pub_key, priv_key) = self.keystore.make_key_pair().await?;
        let (acct, is_new) = self
            .repo
            .add_account_if_not_exist(
                &Account {
                    id: 0,
                    created_at: Utc::now(),
                    approve_status: 0,
                    user_url: self.idb.user_url(&site.parrot_handle),
                    handle: site.parrot_handle.clone(),
                    name: site.title.clone(),
                    summary: site.description.clone(),
                    profile_image_url: String::new(),
                    header_image_url: String::new(),
                    site_url: site.url.clone(),
                    feed_url: site.feed_url.clone(),
                    feed_last_updated: DateTime::UNIX_EPOCH,
                    next_check_due: DateTime::UNIX_EPOCH,
                    pub_key,
                },
                &priv_key,
            )
            .await?;
        info!(handle = %acct.handle, is_new, "account created or retrieved");

        if !is_new && acct.approve_status <= -100 {
            self.metrics.feed_requested("failed");
            return Ok((None, FeedStatus::Banned));
        }

        self.update_account_posts(acct.id, &acct.handle, &feed, !is_new)
            .await?;

        if is_new {
            self.metrics.feed_requested("new");
            Ok((Some(acct), FeedStatus::New))
        } else {
            self.metrics.feed_requested("existing");
            Ok((Some(acct), FeedStatus::AlreadyFollowed))
        }
    }

    /// First treats the URL as a feed; failing that, fetches it as HTML and
    /// scans `<link rel="alternate">` entries.
    async fn get_site_info(&self, url_str: &str) -> Result<(SiteInfo, Feed), AppError> {
        let url_str = url_str.trim_end_matches('/');

        let no_query = trim_query_params_str(url_str)?;
        if let Ok(feed) = self.fetch_parse_feed(&no_query).await {
            let site_url = feed_site_link(&feed);
            let site = SiteInfo {
                parrot_handle: ids::handle_from_url(&site_url),
                url: site_url,
                feed_url: no_query,
                title: feed_text(feed.title.as_ref()),
                description: feed_text(feed.description.as_ref()),
            };
            return Ok((site, feed));
        }

        let page_url = Url::parse(url_str)
            .map_err(|e| AppError::BadRequest(format!("cannot parse URL '{}': {}", url_str, e)))?;
        let resp = self.client.get(url_str).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Internal(format!(
                "request for {} failed with status {}",
                url_str,
                resp.status()
            )));
        }
        let body = resp.text().await?;
        let discovered = discover_in_html(&page_url, &body);

        let feed_url = discovered
            .feed_url
            .ok_or_else(|| AppError::Internal(format!("no feed URL found at {}", url_str)))?;
        let feed = self.fetch_parse_feed(&feed_url).await?;
        let site = SiteInfo {
            url: url_str.to_owned(),
            parrot_handle: ids::handle_from_url(url_str),
            feed_url,
            title: discovered.title,
            description: discovered.description,
        };
        Ok((site, feed))
    }

    async fn filter_feed(
        &self,
        feed_url: &str,
        feed: &Feed,
    ) -> Result<Option<FeedStatus>, AppError> {
        // Mastodon accounts are followable directly; we don't parrot them
        let generator = feed
            .generator
            .as_ref()
            .map(|g| g.content.to_lowercase())
            .unwrap_or_default();
        if generator.contains("mastodon") {
            return Ok(Some(FeedStatus::Mastodon));
        }
        if self.blocked.is_blocked(feed_url).await? {
            return Ok(Some(FeedStatus::OptOut));
        }
        Ok(None)
    }

    async fn fetch_parse_feed(&self, feed_url: &str) -> Result<Feed, AppError> {
        let resp = self.client.get(feed_url).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Internal(format!(
                "request for {} failed with status {}",
                feed_url,
                resp.status()
            )));
        }
        let bytes = resp.bytes().await?;
        feed_rs::parser::parse(&bytes[..])
            .map_err(|e| AppError::Internal(format!("failed to parse feed {}: {}", feed_url, e)))
    }

    // ------------------------------------------------------------------
    // Diff and ingest

    /// Persists feed items newer than the account's last-seen time, emitting
    /// a toot for each. For a freshly created account (`toot_new = false`)
    /// at most the [`OLD_TOOTS_TO_SEND`] most recent items are kept.
    async fn update_account_posts(
        &self,
        account_id: i64,
        handle: &str,
        feed: &Feed,
        toot_new: bool,
    ) -> Result<(), AppError> {
        let last_known = self.repo.get_feed_last_updated(account_id).await?;

        let items = items_from_feed(feed);
        let (mut keepers, new_last_updated) = sorted_new_posts(items, last_known, Utc::now());

        if !toot_new && keepers.len() > OLD_TOOTS_TO_SEND {
            keepers.drain(..keepers.len() - OLD_TOOTS_TO_SEND);
        }

        for (mut item, post_time) in keepers {
            fix_podcast_link(&mut item);
            self.store_post_if_new(account_id, handle, post_time, &item)
                .await?;
        }

        let next_check_due = self.next_check_time(new_last_updated);
        self.repo
            .update_account_feed_times(account_id, new_last_updated, next_check_due)
            .await?;
        Ok(())
    }

    async fn store_post_if_new(
        &self,
        account_id: i64,
        handle: &str,
        post_time: DateTime<Utc>,
        item: &FeedItem,
    ) -> Result<(), AppError> {
        let is_new = self
            .repo
            .add_feed_post_if_new(
                account_id,
                &FeedPost {
                    post_guid_hash: item_hash(item),
                    post_time,
                    link: item.link.clone(),
                    title: strip_html(&item.title),
                    description: strip_html(&item.description),
                },
            )
            .await?;
        if is_new {
            self.metrics.new_post_saved();
            self.create_toot(account_id, handle, item).await?;
        }
        Ok(())
    }

    async fn create_toot(
        &self,
        account_id: i64,
        handle: &str,
        item: &FeedItem,
    ) -> Result<(), AppError> {
        let pretty_url = item
            .link
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        let plain_title = strip_html(&item.title);
        let plain_description =
            ids::truncate_with_ellipsis(&strip_html(&item.description), ids::MAX_DESCRIPTION_LEN);
        let content = self.texts.with_vals(
            "toot_new_post.html",
            &[
                ("title", plain_title.as_str()),
                ("url", item.link.as_str()),
                ("prettyUrl", pretty_url),
                ("description", plain_description.as_str()),
            ],
        );

        let id = self.repo.next_id();
        let status_id = self.idb.user_status(handle, id);
        let tooted_at = Utc::now();
        self.repo
            .add_toot(
                account_id,
                &Toot {
                    post_guid_hash: item_hash(item),
                    tooted_at,
                    status_id: status_id.clone(),
                    content: content.clone(),
                },
            )
            .await?;
        self.metrics.post_flow("toot_created");
        self.messenger
            .enqueue_broadcast(handle, &status_id, tooted_at, &content)
            .await
    }

    /// Hours to the next check depend on how long the feed has been idle,
    /// jittered into a 0.8-1.2 band so checks spread out.
    fn next_check_time(&self, last_changed: DateTime<Utc>) -> DateTime<Utc> {
        let schedule = &self.cfg.update_schedule;
        let idle_hours = (Utc::now() - last_changed).num_seconds() as f64 / 3600.0;
        let mut hours = f64::from(schedule.day);
        if idle_hours > 24.0 {
            hours = f64::from(schedule.week);
        }
        if idle_hours > 168.0 {
            hours = f64::from(schedule.weeks4);
        }
        if idle_hours > 168.0 * 4.0 {
            hours = f64::from(schedule.older);
        }
        hours *= 0.8 + 0.4 * rand::random::<f64>();
        Utc::now() + ChronoDuration::milliseconds((hours * 3_600_000.0) as i64)
    }

    // ------------------------------------------------------------------
    // Polling loop

    /// Starts the long-lived polling task. Runs back-to-back while feeds are
    /// due, sleeps a minute when the queue is drained; a panicking cycle is
    /// logged and followed by a short pause.
    pub fn spawn_check_loop(self: &Arc<Self>) {
        let ff = self.clone();
        tokio::spawn(async move {
            loop {
                let cycle = ff.clone();
                let joined = tokio::spawn(async move { cycle.check_cycle().await }).await;
                if let Err(join_err) = joined {
                    if join_err.is_panic() {
                        error!("feed check cycle panicked; pausing before retry");
                        tokio::time::sleep(PANIC_SLEEP).await;
                    }
                }
                ff.update_db_size_metric();
                ff.update_total_posts_metric().await;
            }
        });
    }

    async fn check_cycle(self: Arc<Self>) {
        let (acct, total) = match self.repo.get_account_to_check(Utc::now()).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(%err, "failed to get next feed due for checking");
                tokio::time::sleep(FEED_CHECK_IDLE_WAKE).await;
                return;
            }
        };
        self.metrics.checkable_feed_count(total);
        let Some(acct) = acct else {
            debug!("no feeds to check");
            tokio::time::sleep(FEED_CHECK_IDLE_WAKE).await;
            return;
        };

        let last_updated = acct.feed_last_updated;
        if let Err(err) = self.update_feed(&acct).await {
            error!(%err, handle = %acct.handle, "error updating feed");
            // reschedule as if there was no new post, so a broken feed does
            // not reset progress
            let next_check_due = self.next_check_time(last_updated);
            if let Err(err) = self
                .repo
                .update_account_feed_times(acct.id, last_updated, next_check_due)
                .await
            {
                error!(%err, handle = %acct.handle, "failed to reschedule after error");
            }
        }

        let ff = self.clone();
        tokio::spawn(async move { ff.purge_unfollowed_account(acct).await });
    }

    async fn update_feed(self: &Arc<Self>, acct: &Account) -> Result<(), AppError> {
        info!(handle = %acct.handle, feed_url = %acct.feed_url, "updating account");
        self.metrics.feed_updated();

        let feed = self.fetch_parse_feed(&acct.feed_url).await?;
        self.update_account_posts(acct.id, &acct.handle, &feed, true)
            .await?;

        let ff = self.clone();
        let acct = acct.clone();
        tokio::spawn(async move {
            let (min_count, min_days) = (ff.cfg.posts_min_count_kept, ff.cfg.posts_min_days_kept);
            if let Err(err) = ff.purge_old_posts(&acct, min_count, min_days).await {
                error!(%err, handle = %acct.handle, "error purging old posts");
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Purging

    /// Removes a feed's old toots and posts, keeping at least `min_count`
    /// and everything younger than `min_age_days`. Only one purge runs at a
    /// time across all accounts; re-entry returns immediately.
    pub async fn purge_old_posts(
        &self,
        acct: &Account,
        min_count: usize,
        min_age_days: u32,
    ) -> Result<(), AppError> {
        if min_count == 0 || min_age_days == 0 {
            return Ok(());
        }
        {
            let mut purging = self.purging_old_posts.lock().expect("purge gate");
            if *purging {
                return Ok(());
            }
            *purging = true;
        }
        let res = self.purge_old_posts_inner(acct, min_count, min_age_days).await;
        *self.purging_old_posts.lock().expect("purge gate") = false;
        res
    }

    async fn purge_old_posts_inner(
        &self,
        acct: &Account,
        min_count: usize,
        min_age_days: u32,
    ) -> Result<(), AppError> {
        if self.cfg.purge_wait_sec > 0 {
            tokio::time::sleep(Duration::from_secs(self.cfg.purge_wait_sec)).await;
        }

        let mut extracts = self.repo.get_toot_extracts(acct.id).await?;
        if extracts.len() <= min_count {
            return Ok(());
        }
        extracts.sort_by(|a, b| b.tooted_at.cmp(&a.tooted_at));

        let Some((from_before, n_to_del)) =
            purge_cutoff(&extracts, min_count, min_age_days, Utc::now())
        else {
            return Ok(());
        };

        info!(n_to_del, handle = %acct.handle, "purging old toots and posts");
        self.repo.purge_posts_and_toots(acct.id, from_before).await?;
        self.metrics.post_flow_by("purged", n_to_del as u64);
        Ok(())
    }

    /// Deletes the account if nobody at all follows it. Gated separately
    /// from the post purger.
    async fn purge_unfollowed_account(&self, acct: Account) {
        {
            let mut purging = self.purging_unfollowed.lock().expect("purge gate");
            if *purging {
                return;
            }
            *purging = true;
        }
        self.purge_unfollowed_inner(acct).await;
        *self.purging_unfollowed.lock().expect("purge gate") = false;
    }

    async fn purge_unfollowed_inner(&self, acct: Account) {
        let follower_count = match self.repo.get_follower_count(&acct.handle, false).await {
            Ok(count) => count,
            Err(err) => {
                error!(%err, handle = %acct.handle, "error getting follower count");
                return;
            }
        };
        if follower_count != 0 {
            return;
        }
        info!(handle = %acct.handle, "deleting account with 0 followers");
        if let Err(err) = self.repo.brute_delete_account(acct.id).await {
            error!(%err, handle = %acct.handle, "failed to delete account");
            return;
        }
        if self.cfg.purge_wait_sec > 0 {
            tokio::time::sleep(Duration::from_secs(self.cfg.purge_wait_sec)).await;
        }
    }

    // ------------------------------------------------------------------
    // Gauges

    fn update_db_size_metric(&self) {
        if self.cfg.db_file.is_empty() {
            return;
        }
        match std::fs::metadata(&self.cfg.db_file) {
            Ok(meta) => self.metrics.db_file_size(meta.len() as i64),
            Err(err) => error!(%err, "error getting DB file size"),
        }
    }

    async fn update_total_posts_metric(&self) {
        let now = Utc::now();
        {
            let mut last = self.last_checked_post_count.lock().expect("metrics gate");
            if (now - *last).num_seconds() < POST_COUNT_UPDATE_SECS {
                return;
            }
            *last = now;
        }
        match self.repo.get_total_post_count().await {
            Ok(count) => self.metrics.total_posts(count),
            Err(err) => error!(%err, "error getting total post count"),
        }
    }
}

#[async_trait]
impl FeedResolver for FeedFollower {
    async fn resolve_feed(&self, url: &str) -> (Option<Account>, FeedStatus) {
        match self.get_account_for_feed(url).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(%err, url, "internal error resolving feed");
                (None, FeedStatus::Error)
            }
        }
    }
}

// ----------------------------------------------------------------------
// Pure helpers

fn validate_site_info(site: &SiteInfo) -> Result<(), AppError> {
    Url::parse(&site.feed_url)
        .map_err(|e| AppError::BadRequest(format!("invalid feed URL '{}': {}", site.feed_url, e)))?;
    ids::validate_handle(&site.parrot_handle)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(())
}

fn feed_text(text: Option<&feed_rs::model::Text>) -> String {
    text.map(|t| t.content.clone()).unwrap_or_default()
}

/// The site a feed belongs to: its first non-self link.
fn feed_site_link(feed: &Feed) -> String {
    feed.links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.trim_end_matches('/').to_owned())
        .unwrap_or_default()
}

fn items_from_feed(feed: &Feed) -> Vec<FeedItem> {
    feed.entries
        .iter()
        .map(|entry| FeedItem {
            guid: entry.id.clone(),
            link: entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default(),
            title: feed_text(entry.title.as_ref()),
            description: feed_text(entry.summary.as_ref()),
            published: entry.published,
            updated: entry.updated,
            audio_enclosures: entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .filter(|c| {
                    c.content_type
                        .as_ref()
                        .map(|t| t.to_string().starts_with("audio/"))
                        .unwrap_or(false)
                })
                .filter_map(|c| c.url.as_ref().map(|u| u.to_string()))
                .collect(),
        })
        .collect()
}

/// 32-bit Murmur3 over `guid + "\t" + link`; the feed-post identity.
fn item_hash(item: &FeedItem) -> i64 {
    let key = format!("{}\t{}", item.guid, item.link);
    let hash = murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), 0).expect("in-memory hash");
    i64::from(hash)
}

/// Items with an effective time after `last_known` and no further than two
/// days into the future, sorted chronologically ascending, plus the new
/// last-updated watermark.
fn sorted_new_posts(
    items: Vec<FeedItem>,
    last_known: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (Vec<(FeedItem, DateTime<Utc>)>, DateTime<Utc>) {
    let future_limit = now + ChronoDuration::days(ALLOWED_FUTURE_POST_DAYS);
    let mut keepers = Vec::new();
    let mut new_last_updated = last_known;

    for item in items {
        let Some(post_time) = effective_time(&item, last_known) else {
            continue;
        };
        // far-future posts would block the routine purge of old ones
        if post_time > future_limit {
            continue;
        }
        if post_time > new_last_updated {
            new_last_updated = post_time;
        }
        keepers.push((item, post_time));
    }

    keepers.sort_by(|a, b| a.1.cmp(&b.1));
    (keepers, new_last_updated)
}

/// The later of `published` and `updated`, counting only values after
/// `last_known`; `None` when the item is not news.
fn effective_time(item: &FeedItem, last_known: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut post_time = None;
    if let Some(published) = item.published {
        if published > last_known {
            post_time = Some(published);
        }
    }
    if let Some(updated) = item.updated {
        if updated > last_known && post_time.map_or(true, |t| updated > t) {
            post_time = Some(updated);
        }
    }
    post_time
}

/// Podcast items often have no link, only an audio enclosure; adopt its URL
/// (query stripped) as the link.
fn fix_podcast_link(item: &mut FeedItem) {
    if !item.link.is_empty() {
        return;
    }
    for enclosure in &item.audio_enclosures {
        let Ok(mut parsed) = Url::parse(enclosure) else {
            continue;
        };
        parsed.set_query(None);
        item.link = parsed.to_string();
        return;
    }
}

/// Query parameters get stripped from feed URLs, with a short list of hosts
/// and shapes where the query is load-bearing.
fn trim_query_params(feed_url: &mut Url) {
    let host = feed_url.host_str().unwrap_or_default().to_owned();
    let query = feed_url.query().unwrap_or_default().to_owned();

    // Youtube: https://www.youtube.com/feeds/videos.xml?channel_id=...
    if host.contains("youtube.com") && query.contains("channel_id") {
        return;
    }
    // Archive.org: https://archive.org/services/collection-rss.php?collection=...
    if host.contains("archive.org") {
        return;
    }
    if host.contains("languagelog.ldc.upenn.edu") {
        return;
    }
    // Squarespace serves the feed only with ?format=rss
    if query.contains("format=rss") {
        feed_url.set_query(Some("format=rss"));
        return;
    }
    feed_url.set_query(None);
}

fn trim_query_params_str(url_str: &str) -> Result<String, AppError> {
    let mut parsed = Url::parse(url_str)
        .map_err(|e| AppError::BadRequest(format!("cannot parse URL '{}': {}", url_str, e)))?;
    trim_query_params(&mut parsed);
    Ok(parsed.to_string().trim_end_matches('/').to_owned())
}

/// What HTML discovery found on a page.
struct DiscoveredPage {
    feed_url: Option<String>,
    title: String,
    description: String,
}

/// Scans `<link rel="alternate">` entries, preferring RSS over Atom, and
/// picks up page title and meta description. Relative hrefs are resolved
/// against the page URL.
fn discover_in_html(page_url: &Url, body: &str) -> DiscoveredPage {
    let doc = scraper::Html::parse_document(body);

    let link_sel = scraper::Selector::parse("link[rel='alternate']").expect("static selector");
    let mut feed_href = String::new();
    let mut is_feed_rss = false;
    for element in doc.select(&link_sel) {
        let (Some(a_type), Some(a_href)) =
            (element.value().attr("type"), element.value().attr("href"))
        else {
            continue;
        };
        if a_type == "application/atom+xml" && !is_feed_rss && feed_href.is_empty() {
            feed_href = a_href.to_owned();
        }
        if a_type == "application/rss+xml" && (feed_href.is_empty() || !is_feed_rss) {
            feed_href = a_href.to_owned();
            is_feed_rss = true;
        }
    }

    let feed_url = if feed_href.is_empty() {
        None
    } else {
        page_url.join(&feed_href).ok().map(|mut joined| {
            trim_query_params(&mut joined);
            joined.to_string().trim_end_matches('/').to_owned()
        })
    };

    let title_sel = scraper::Selector::parse("title").expect("static selector");
    let title = doc
        .select(&title_sel)
        .next()
        .map(|el| el.text().collect::<String>())
        .unwrap_or_default();
    let meta_sel =
        scraper::Selector::parse("meta[name='description']").expect("static selector");
    let description = doc
        .select(&meta_sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .unwrap_or_default()
        .to_owned();

    DiscoveredPage {
        feed_url,
        title,
        description,
    }
}

/// Walks the newest-first extracts; the cutoff is the first entry past
/// `min_count` that is at least `min_age_days` old. Returns the cutoff time
/// and how many entries fall at or after it.
fn purge_cutoff(
    extracts: &[TootExtract],
    min_count: usize,
    min_age_days: u32,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, usize)> {
    for (i, extract) in extracts.iter().enumerate() {
        if i < min_count {
            continue;
        }
        let age_days = (now - extract.tooted_at).num_seconds() as f64 / 86_400.0;
        if age_days < f64::from(min_age_days) {
            continue;
        }
        return Some((extract.tooted_at, extracts.len() - i));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(guid: &str, published: Option<DateTime<Utc>>, updated: Option<DateTime<Utc>>) -> FeedItem {
        FeedItem {
            guid: guid.to_owned(),
            link: format!("https://site.example/{}", guid),
            title: format!("Post {}", guid),
            description: "A post".to_owned(),
            published,
            updated,
            audio_enclosures: vec![],
        }
    }

    fn at(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + ChronoDuration::hours(h)
    }

    #[test]
    fn diff_keeps_new_items_in_ascending_order() {
        // last seen two hours ago; one older post, one future post, one fresh
        let now = at(0);
        let last_known = at(-2);
        let items = vec![
            item("old", Some(at(-1)), None),
            item("future", Some(at(3 * 24)), None),
            item("mid", Some(at(0) - ChronoDuration::minutes(30)), None),
            item("ancient", Some(at(-5)), None),
        ];
        let (keepers, new_last) = sorted_new_posts(items, last_known, now);
        let guids: Vec<&str> = keepers.iter().map(|(i, _)| i.guid.as_str()).collect();
        assert_eq!(guids, vec!["old", "mid"]);
        assert_eq!(new_last, at(0) - ChronoDuration::minutes(30));
    }

    #[test]
    fn diff_honors_two_day_future_window() {
        let now = at(0);
        let items = vec![
            item("ok", Some(now + ChronoDuration::hours(47)), None),
            item("too-far", Some(now + ChronoDuration::hours(49)), None),
        ];
        let (keepers, _) = sorted_new_posts(items, at(-1), now);
        assert_eq!(keepers.len(), 1);
        assert_eq!(keepers[0].0.guid, "ok");
    }

    #[test]
    fn updated_time_counts_when_later() {
        let last_known = at(-2);
        let it = item("x", Some(at(-3)), Some(at(-1)));
        assert_eq!(effective_time(&it, last_known), Some(at(-1)));
        // neither time is news
        let stale = item("y", Some(at(-3)), Some(at(-4)));
        assert_eq!(effective_time(&stale, last_known), None);
    }

    #[test]
    fn hash_is_stable_and_link_sensitive() {
        let a = item("guid-1", None, None);
        let mut b = item("guid-1", None, None);
        assert_eq!(item_hash(&a), item_hash(&b));
        b.link = "https://site.example/other".to_owned();
        assert_ne!(item_hash(&a), item_hash(&b));
        assert!(item_hash(&a) >= 0);
    }

    #[test]
    fn podcast_items_adopt_audio_enclosure() {
        let mut it = item("p", None, None);
        it.link = String::new();
        it.audio_enclosures = vec!["https://cdn.example/ep1.mp3?token=abc".to_owned()];
        fix_podcast_link(&mut it);
        assert_eq!(it.link, "https://cdn.example/ep1.mp3");

        let mut linked = item("q", None, None);
        linked.audio_enclosures = vec!["https://cdn.example/ep2.mp3".to_owned()];
        fix_podcast_link(&mut linked);
        assert_eq!(linked.link, "https://site.example/q");
    }

    #[test]
    fn query_trimming_has_exceptions() {
        let cases = [
            (
                "https://www.youtube.com/feeds/videos.xml?channel_id=UCabc",
                "https://www.youtube.com/feeds/videos.xml?channel_id=UCabc",
            ),
            (
                "https://archive.org/services/collection-rss.php?collection=zines",
                "https://archive.org/services/collection-rss.php?collection=zines",
            ),
            (
                "https://shop.example/blog?format=rss&extra=1",
                "https://shop.example/blog?format=rss",
            ),
            ("https://site.example/feed?utm_source=x", "https://site.example/feed"),
        ];
        for (input, expected) in cases {
            let mut url = Url::parse(input).unwrap();
            trim_query_params(&mut url);
            assert_eq!(url.as_str().trim_end_matches('?'), expected, "for {}", input);
        }
    }

    #[test]
    fn html_discovery_prefers_rss_and_resolves_relative() {
        let page = Url::parse("https://site.example/blog/post").unwrap();
        let body = r#"<html><head>
            <title>Some Blog</title>
            <meta name="description" content="Posts about things">
            <link rel="alternate" type="application/atom+xml" href="/atom.xml">
            <link rel="alternate" type="application/rss+xml" href="/rss.xml">
        </head><body></body></html>"#;
        let discovered = discover_in_html(&page, body);
        assert_eq!(discovered.feed_url.as_deref(), Some("https://site.example/rss.xml"));
        assert_eq!(discovered.title, "Some Blog");
        assert_eq!(discovered.description, "Posts about things");
    }

    #[test]
    fn html_discovery_takes_atom_when_only_option() {
        let page = Url::parse("https://site.example").unwrap();
        let body = r#"<link rel="alternate" type="application/atom+xml" href="https://site.example/atom.xml">"#;
        let discovered = discover_in_html(&page, body);
        assert_eq!(
            discovered.feed_url.as_deref(),
            Some("https://site.example/atom.xml")
        );

        let none = discover_in_html(&page, "<html><body>no links</body></html>");
        assert!(none.feed_url.is_none());
    }

    fn extract(days_old: i64, n: i64, now: DateTime<Utc>) -> TootExtract {
        TootExtract {
            post_guid_hash: n,
            tooted_at: now - ChronoDuration::days(days_old),
        }
    }

    #[test]
    fn purge_cutoff_respects_min_count_and_age() {
        let now = at(0);
        // newest-first: 4 fresh, 6 old
        let mut extracts: Vec<TootExtract> = (0..4).map(|n| extract(0, n, now)).collect();
        extracts.extend((0..6).map(|n| extract(3 + n, 100 + n, now)));
        let (cutoff, n) = purge_cutoff(&extracts, 5, 2, now).unwrap();
        assert_eq!(n, 5);
        assert_eq!(cutoff, extracts[5].tooted_at);

        // 6 fresh, 4 old: cutoff at the first old one past min_count
        let mut extracts: Vec<TootExtract> = (0..6).map(|n| extract(0, n, now)).collect();
        extracts.extend((0..4).map(|n| extract(3 + n, 100 + n, now)));
        let (_, n) = purge_cutoff(&extracts, 5, 2, now).unwrap();
        assert_eq!(n, 4);

        // all fresh: nothing to purge
        let extracts: Vec<TootExtract> = (0..10).map(|n| extract(0, n, now)).collect();
        assert!(purge_cutoff(&extracts, 5, 2, now).is_none());
    }

    async fn ingest_harness() -> (FeedFollower, Arc<Repo>, i64) {
        let (pub_pem, priv_pem) = crate::keystore::test_key_pair_pem().clone();
        let mut cfg = crate::config::test_config();
        cfg.birb.pub_key = pub_pem.clone();
        cfg.birb.priv_key = priv_pem.clone();
        let cfg = Arc::new(cfg);

        let repo = Arc::new(Repo::open_in_memory().await.unwrap());
        repo.init_update_db(&cfg).await.unwrap();
        let (acct, _) = repo
            .add_account_if_not_exist(
                &Account {
                    id: 0,
                    created_at: Utc::now(),
                    approve_status: 0,
                    user_url: "https://test-parrot.net/u/site.example".to_owned(),
                    handle: "site.example".to_owned(),
                    name: "Site".to_owned(),
                    summary: String::new(),
                    profile_image_url: String::new(),
                    header_image_url: String::new(),
                    site_url: "https://site.example".to_owned(),
                    feed_url: "https://site.example/feed".to_owned(),
                    feed_last_updated: DateTime::UNIX_EPOCH,
                    next_check_due: DateTime::UNIX_EPOCH,
                    pub_key: pub_pem,
                },
                &priv_pem,
            )
            .await
            .unwrap();

        let keystore = Arc::new(KeyStore::new(cfg.clone(), repo.clone()));
        let sender = Arc::new(crate::sender::testing::RecordingSender::default());
        let metrics = Arc::new(Metrics::new());
        let (messenger, _wake_rx) = Messenger::build(
            cfg.clone(),
            repo.clone(),
            keystore.clone(),
            sender,
            metrics.clone(),
        );
        let blocked = BlockedFeeds::new(&cfg);
        let ff = FeedFollower::new(cfg, repo.clone(), blocked, messenger, Texts, keystore, metrics)
            .unwrap();
        (ff, repo, acct.id)
    }

    fn rss_with_items(items: &[(&str, DateTime<Utc>)]) -> Feed {
        let mut xml = String::from(
            r#"<?xml version="1.0"?><rss version="2.0"><channel>
            <title>Site</title><link>https://site.example</link><description>d</description>"#,
        );
        for (guid, time) in items {
            xml.push_str(&format!(
                "<item><guid>{}</guid><link>https://site.example/{}</link>\
                 <title>Post {}</title><description>About {}</description>\
                 <pubDate>{}</pubDate></item>",
                guid,
                guid,
                guid,
                guid,
                time.to_rfc2822()
            ));
        }
        xml.push_str("</channel></rss>");
        feed_rs::parser::parse(xml.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn new_account_backlog_is_capped_at_five_toots() {
        let (ff, repo, account_id) = ingest_harness().await;
        let now = Utc::now();
        let items: Vec<(String, DateTime<Utc>)> = (0..8)
            .map(|n| (format!("p{}", n), now - ChronoDuration::hours(8 - n)))
            .collect();
        let borrowed: Vec<(&str, DateTime<Utc>)> =
            items.iter().map(|(g, t)| (g.as_str(), *t)).collect();
        let feed = rss_with_items(&borrowed);

        ff.update_account_posts(account_id, "site.example", &feed, false)
            .await
            .unwrap();

        let extracts = repo.get_toot_extracts(account_id).await.unwrap();
        assert_eq!(extracts.len(), OLD_TOOTS_TO_SEND, "backlog capped");
        // the five most recent items were kept
        assert_eq!(repo.get_total_post_count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn ingestion_skips_seen_and_future_items() {
        let (ff, repo, account_id) = ingest_harness().await;
        let now = Utc::now();
        let last_seen = now - ChronoDuration::hours(2);
        repo.update_account_feed_times(account_id, last_seen, now)
            .await
            .unwrap();

        let feed = rss_with_items(&[
            ("old", now - ChronoDuration::hours(1)),
            ("future", now + ChronoDuration::days(3)),
            ("mid", now - ChronoDuration::minutes(30)),
            ("ancient", now - ChronoDuration::hours(5)),
        ]);
        ff.update_account_posts(account_id, "site.example", &feed, true)
            .await
            .unwrap();

        assert_eq!(repo.get_total_post_count().await.unwrap(), 2);
        let last = repo.get_feed_last_updated(account_id).await.unwrap();
        // rfc2822 rounds to seconds
        let expected = now - ChronoDuration::minutes(30);
        assert!((last - expected).num_seconds().abs() <= 1);
        // running the same feed again changes nothing
        ff.update_account_posts(account_id, "site.example", &feed, true)
            .await
            .unwrap();
        assert_eq!(repo.get_total_post_count().await.unwrap(), 2);
        assert_eq!(repo.get_toot_extracts(account_id).await.unwrap().len(), 2);
    }

    #[test]
    fn purge_cutoff_skips_young_stragglers_past_min_count() {
        let now = at(0);
        // positions 5 and 6 are young, position 7 on is old
        let mut extracts: Vec<TootExtract> = (0..7).map(|n| extract(0, n, now)).collect();
        extracts.extend((0..3).map(|n| extract(5 + n, 100 + n, now)));
        let (cutoff, n) = purge_cutoff(&extracts, 5, 2, now).unwrap();
        assert_eq!(n, 3);
        assert_eq!(cutoff, extracts[7].tooted_at);
    }
}
