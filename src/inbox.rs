//! Inbound activity handlers: Follow, Undo(Follow) and Create(Note), plus
//! the handled-activities purge loop.
//!
//! Every handler marks the activity in the handled-activities ledger as its
//! first durable step; a repeat delivery returns success silently. Handlers
//! report client mistakes through [`HandlerOutcome::Problem`] and reserve
//! `Err` for internal failures.

use crate::config::Config;
use crate::db::{Follower, Repo};
use crate::directory::UserDirectory;
use crate::error::AppError;
use crate::feeds::{FeedResolver, FeedStatus};
use crate::ids::{self, IdBuilder};
use crate::messenger::{Messenger, MsgMention};
use crate::metrics::Metrics;
use crate::protocol::{ActivityEnvelope, ActorDoc, IncomingActivity, Note};
use crate::texts::Texts;
use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

const ACCEPT_DELAY: Duration = Duration::from_secs(1);
const LEDGER_PURGE_STARTUP_DELAY: Duration = Duration::from_secs(60);
const LEDGER_PURGE_PERIOD: Duration = Duration::from_secs(60 * 60);
const LEDGER_KEEP_HOURS: i64 = 48;

/// How a handler finished: done, or a 400-class client problem.
#[derive(Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled,
    Problem(String),
}

pub struct Inbox {
    cfg: Arc<Config>,
    repo: Arc<Repo>,
    texts: Texts,
    udir: Arc<UserDirectory>,
    messenger: Arc<Messenger>,
    feed_resolver: Arc<dyn FeedResolver>,
    metrics: Arc<Metrics>,
    idb: IdBuilder,
    re_user_url: Regex,
    re_https: Regex,
}

impl Inbox {
    pub fn new(
        cfg: Arc<Config>,
        repo: Arc<Repo>,
        texts: Texts,
        udir: Arc<UserDirectory>,
        messenger: Arc<Messenger>,
        feed_resolver: Arc<dyn FeedResolver>,
        metrics: Arc<Metrics>,
    ) -> Inbox {
        let re_user_url = Regex::new(&format!("https://{}/u/([^/]+)/?", regex::escape(&cfg.host)))
            .expect("static regex");
        let re_https = Regex::new("https?://[^ ]+").expect("static regex");
        let idb = IdBuilder::new(cfg.host.clone());
        Inbox {
            cfg,
            repo,
            texts,
            udir,
            messenger,
            feed_resolver,
            metrics,
            idb,
            re_user_url,
            re_https,
        }
    }

    /// Purges handled-activity ledger entries older than two days, hourly.
    pub fn spawn_purge_loop(self: &Arc<Self>) {
        let inbox = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(LEDGER_PURGE_STARTUP_DELAY).await;
            loop {
                let before = Utc::now() - ChronoDuration::hours(LEDGER_KEEP_HOURS);
                if let Err(err) = inbox.repo.delete_handled_activities(before).await {
                    error!(%err, "failed to purge handled activities");
                }
                tokio::time::sleep(LEDGER_PURGE_PERIOD).await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Follow

    pub async fn handle_follow(
        &self,
        receiving_user: &str,
        sender: &ActorDoc,
        body: &[u8],
    ) -> Result<HandlerOutcome, AppError> {
        info!(receiving_user, "handling Follow activity");

        let Some(account) = self.repo.get_account(receiving_user).await? else {
            return Ok(HandlerOutcome::Problem(format!(
                "User does not exist: {}",
                receiving_user
            )));
        };

        let act: IncomingActivity<String> = match serde_json::from_slice(body) {
            Ok(act) => act,
            Err(err) => {
                return Ok(HandlerOutcome::Problem(format!("Invalid JSON: {}", err)));
            }
        };

        if self.repo.mark_activity_handled(&act.id, Utc::now()).await? {
            info!(id = %act.id, "activity has already been handled");
            return Ok(HandlerOutcome::Handled);
        }

        let my_user_url = self.idb.user_url(receiving_user);
        if act.object != my_user_url {
            let msg = format!(
                "Follow sent to inbox of {}, but object is {}",
                receiving_user, act.object
            );
            warn!("{}", msg);
            return Ok(HandlerOutcome::Problem(msg));
        }

        let actor_host = match ids::host_name(&act.actor) {
            Ok(host) => host,
            Err(err) => return Ok(HandlerOutcome::Problem(err.to_string())),
        };

        let follower = Follower {
            request_id: act.id.clone(),
            approve_status: 0,
            user_url: act.actor.clone(),
            handle: sender.preferred_username.clone(),
            host: actor_host,
            user_inbox: sender.inbox.clone(),
            shared_inbox: sender.endpoints.shared_inbox.clone(),
        };
        self.repo.add_follower(receiving_user, &follower).await?;
        self.update_follower_gauge().await;

        // the birb account may be configured to be approved by hand; parrot
        // accounts always auto-accept
        let auto_accept = !(account.handle == self.cfg.birb.user
            && self.cfg.birb.manually_approves_follows);
        if auto_accept {
            let udir = self.udir.clone();
            let followed_user = receiving_user.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(ACCEPT_DELAY).await;
                if let Err(err) = udir
                    .accept_follower(
                        &follower.request_id,
                        &follower.user_url,
                        &follower.user_inbox,
                        &followed_user,
                    )
                    .await
                {
                    error!(%err, "error accepting follower");
                }
            });
        }
        Ok(HandlerOutcome::Handled)
    }

    // ------------------------------------------------------------------
    // Undo

    pub async fn handle_undo(
        &self,
        receiving_user: &str,
        body: &[u8],
    ) -> Result<HandlerOutcome, AppError> {
        info!(receiving_user, "handling Undo activity");

        let envelope: ActivityEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                return Ok(HandlerOutcome::Problem(format!("Invalid JSON: {}", err)));
            }
        };

        if self
            .repo
            .mark_activity_handled(&envelope.id, Utc::now())
            .await?
        {
            info!(id = %envelope.id, "activity has already been handled");
            return Ok(HandlerOutcome::Handled);
        }

        // other undone object types are none of our business
        if envelope.object_kind() == Some("Follow") {
            return self.handle_unfollow(receiving_user, body).await;
        }
        Ok(HandlerOutcome::Handled)
    }

    async fn handle_unfollow(
        &self,
        receiving_user: &str,
        body: &[u8],
    ) -> Result<HandlerOutcome, AppError> {
        info!(receiving_user, "handling Undo Follow activity");

        let act: IncomingActivity<IncomingActivity<String>> = match serde_json::from_slice(body) {
            Ok(act) => act,
            Err(err) => {
                return Ok(HandlerOutcome::Problem(format!("Invalid JSON: {}", err)));
            }
        };

        // who is being unfollowed, according to the inner object?
        let Some(caps) = self.re_user_url.captures(&act.object.object) else {
            return Ok(HandlerOutcome::Problem(format!(
                "Cannot parse Undo Follow object as a local user URL: {}",
                act.object.object
            )));
        };
        let object_user = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

        // on the shared inbox there is no addressed user; the object decides
        if !receiving_user.is_empty() && object_user != receiving_user {
            return Ok(HandlerOutcome::Problem(format!(
                "Undo Follow sent to '{}' but user in object URL is '{}'",
                receiving_user, object_user
            )));
        }

        if !self.repo.does_account_exist(object_user).await? {
            return Ok(HandlerOutcome::Problem(format!(
                "User does not exist: {}",
                object_user
            )));
        }

        self.repo.remove_follower(object_user, &act.actor).await?;
        self.update_follower_gauge().await;
        Ok(HandlerOutcome::Handled)
    }

    // ------------------------------------------------------------------
    // Create Note

    pub async fn handle_create_note(
        self: &Arc<Self>,
        envelope: &ActivityEnvelope,
        sender: &ActorDoc,
        body: &[u8],
    ) -> Result<HandlerOutcome, AppError> {
        info!("handling Create Note activity");

        if self
            .repo
            .mark_activity_handled(&envelope.id, Utc::now())
            .await?
        {
            info!(id = %envelope.id, "activity has already been handled");
            return Ok(HandlerOutcome::Handled);
        }

        // is this for us, and is it public?
        let birb_user_url = self.idb.user_url(&self.cfg.birb.user);
        let mut to_me = false;
        let mut to_public_or_followers = false;
        for addressee in envelope.to.iter().chain(envelope.cc.iter()) {
            if addressee == crate::PUBLIC_STREAM || *addressee == sender.followers {
                to_public_or_followers = true;
            } else if *addressee == birb_user_url {
                to_me = true;
            }
        }
        if !to_me {
            return Ok(HandlerOutcome::Handled);
        }

        let act: IncomingActivity<Note> = match serde_json::from_slice(body) {
            Ok(act) => act,
            Err(err) => {
                return Ok(HandlerOutcome::Problem(format!("Invalid JSON: {}", err)));
            }
        };

        let sender_host = match ids::host_name(&sender.id) {
            Ok(host) => host,
            Err(err) => {
                return Ok(HandlerOutcome::Problem(format!(
                    "Failed to extract host from sender ID {}: {}",
                    sender.id, err
                )));
            }
        };
        let moniker = ids::full_moniker(&sender_host, &sender.preferred_username);

        // replies mirror the addressing of the incoming note
        let (reply_to, reply_cc) = if to_public_or_followers {
            (
                vec![crate::PUBLIC_STREAM.to_owned()],
                vec![act.actor.clone(), sender.followers.clone()],
            )
        } else {
            (vec![act.actor.clone()], Vec::new())
        };

        let blog_url = self.extract_single_url(&act.object.content);
        let Some(blog_url) = blog_url else {
            info!("no single URL found in message");
            let msg = self.texts.with_vals(
                "reply_no_single_url.html",
                &[("moniker", moniker.as_str()), ("userUrl", sender.id.as_str())],
            );
            self.messenger.send_message_async(
                &self.cfg.birb.user,
                &sender.inbox,
                &msg,
                vec![MsgMention {
                    moniker,
                    user_url: act.actor.clone(),
                }],
                reply_to,
                reply_cc,
                Some(act.object.id.clone()),
            );
            return Ok(HandlerOutcome::Handled);
        };

        let inbox = self.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            inbox
                .handle_site_request(sender, act, moniker, blog_url, reply_to, reply_cc)
                .await;
        });
        Ok(HandlerOutcome::Handled)
    }

    async fn handle_site_request(
        self: Arc<Self>,
        sender: ActorDoc,
        act: IncomingActivity<Note>,
        moniker: String,
        blog_url: String,
        reply_to: Vec<String>,
        reply_cc: Vec<String>,
    ) {
        let (acct, status) = self.feed_resolver.resolve_feed(&blog_url).await;

        let mut mentions = vec![MsgMention {
            moniker: moniker.clone(),
            user_url: act.actor.clone(),
        }];

        let msg = match acct {
            Some(acct) => {
                info!(%blog_url, handle = %acct.handle, "account for site created/retrieved");
                let account_url = self.idb.user_url(&acct.handle);
                let account_moniker = ids::full_moniker(&self.cfg.host, &acct.handle);
                mentions.push(MsgMention {
                    moniker: account_moniker,
                    user_url: account_url.clone(),
                });
                self.texts.with_vals(
                    "reply_got_feed.html",
                    &[
                        ("userHandle", sender.preferred_username.as_str()),
                        ("userUrl", sender.id.as_str()),
                        ("accountName", acct.name.as_str()),
                        ("accountMoniker", &format!("@{}", acct.handle)),
                        ("accountUrl", account_url.as_str()),
                    ],
                )
            }
            None => {
                info!(%blog_url, ?status, "could not create account for site");
                let template = match status {
                    FeedStatus::Mastodon => "reply_feed_mastodon.html",
                    FeedStatus::Banned => "reply_feed_banned.html",
                    FeedStatus::OptOut => "reply_feed_optout.html",
                    _ => "reply_site_not_found.html",
                };
                self.texts.with_vals(
                    template,
                    &[("moniker", moniker.as_str()), ("userUrl", sender.id.as_str())],
                )
            }
        };

        self.messenger.send_message_async(
            &self.cfg.birb.user,
            &sender.inbox,
            &msg,
            mentions,
            reply_to,
            reply_cc,
            Some(act.object.id.clone()),
        );
    }

    /// Exactly one parseable URL in the note's text, or nothing.
    fn extract_single_url(&self, content: &str) -> Option<String> {
        let plain = crate::texts::strip_html(content);
        let mut found: Option<String> = None;
        for m in self.re_https.find_iter(&plain) {
            if Url::parse(m.as_str()).is_err() {
                continue;
            }
            if found.is_some() {
                return None;
            }
            found = Some(m.as_str().to_owned());
        }
        found
    }

    async fn update_follower_gauge(&self) {
        match self.repo.get_feed_follower_count().await {
            Ok(count) => self.metrics.total_followers(count),
            Err(err) => error!(%err, "failed to count followers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::db::Account;
    use crate::keystore::{test_key_pair_pem, KeyStore};
    use crate::protocol::Endpoints;
    use crate::sender::testing::{RecordingSender, SentActivity};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    const CALLER_HOST: &str = "stardust.community";
    const CALLER_NAME: &str = "pixie";

    struct StubResolver {
        acct: Option<Account>,
        status: FeedStatus,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FeedResolver for StubResolver {
        async fn resolve_feed(&self, url: &str) -> (Option<Account>, FeedStatus) {
            self.requests.lock().unwrap().push(url.to_owned());
            (self.acct.clone(), self.status)
        }
    }

    struct Harness {
        inbox: Arc<Inbox>,
        repo: Arc<Repo>,
        sender: Arc<RecordingSender>,
        resolver: Arc<StubResolver>,
        caller: ActorDoc,
        birb_url: String,
    }

    fn parrot_account() -> Account {
        let now = Utc::now();
        Account {
            id: 7,
            created_at: now,
            approve_status: 0,
            user_url: "https://test-parrot.net/u/cute.example.blog".to_owned(),
            handle: "cute.example.blog".to_owned(),
            name: "Cute Blog".to_owned(),
            summary: String::new(),
            profile_image_url: String::new(),
            header_image_url: String::new(),
            site_url: "https://cute.example/blog".to_owned(),
            feed_url: "https://cute.example/blog/feed".to_owned(),
            feed_last_updated: now,
            next_check_due: now,
            pub_key: String::new(),
        }
    }

    async fn setup(resolved: (Option<Account>, FeedStatus)) -> Harness {
        let (pub_pem, priv_pem) = test_key_pair_pem().clone();
        let mut cfg = test_config();
        cfg.birb.pub_key = pub_pem;
        cfg.birb.priv_key = priv_pem;
        let cfg = Arc::new(cfg);

        let repo = Arc::new(Repo::open_in_memory().await.unwrap());
        repo.init_update_db(&cfg).await.unwrap();

        let keystore = Arc::new(KeyStore::new(cfg.clone(), repo.clone()));
        let sender = Arc::new(RecordingSender::default());
        let metrics = Arc::new(Metrics::new());
        let udir = Arc::new(UserDirectory::new(
            cfg.clone(),
            repo.clone(),
            keystore.clone(),
            sender.clone(),
            metrics.clone(),
            Texts,
        ));
        let (messenger, _wake_rx) = Messenger::build(
            cfg.clone(),
            repo.clone(),
            keystore,
            sender.clone(),
            metrics.clone(),
        );
        let resolver = Arc::new(StubResolver {
            acct: resolved.0,
            status: resolved.1,
            requests: Mutex::new(Vec::new()),
        });
        let inbox = Arc::new(Inbox::new(
            cfg,
            repo.clone(),
            Texts,
            udir,
            messenger,
            resolver.clone(),
            metrics,
        ));

        let caller = ActorDoc {
            id: format!("https://{}/users/{}", CALLER_HOST, CALLER_NAME),
            kind: "Person".to_owned(),
            preferred_username: CALLER_NAME.to_owned(),
            inbox: format!("https://{}/users/{}/inbox", CALLER_HOST, CALLER_NAME),
            followers: format!("https://{}/users/{}/followers", CALLER_HOST, CALLER_NAME),
            endpoints: Endpoints {
                shared_inbox: format!("https://{}/inbox", CALLER_HOST),
            },
            ..ActorDoc::default()
        };
        Harness {
            inbox,
            repo,
            sender,
            resolver,
            caller,
            birb_url: "https://test-parrot.net/u/birb".to_owned(),
        }
    }

    fn follow_body(h: &Harness, act_id: &str) -> Vec<u8> {
        json!({
            "id": act_id,
            "type": "Follow",
            "actor": h.caller.id,
            "object": h.birb_url,
        })
        .to_string()
        .into_bytes()
    }

    fn note_body(h: &Harness, to: Vec<String>, cc: Vec<String>, content: &str) -> Vec<u8> {
        json!({
            "id": "https://stardust.community/act/note-1",
            "type": "Create",
            "actor": h.caller.id,
            "to": to.clone(),
            "cc": cc.clone(),
            "object": {
                "id": "https://stardust.community/notes/7",
                "type": "Note",
                "attributedTo": h.caller.id,
                "content": content,
                "to": to,
                "cc": cc,
            },
        })
        .to_string()
        .into_bytes()
    }

    async fn wait_for_sent(sender: &RecordingSender, count: usize) -> Vec<SentActivity> {
        for _ in 0..100 {
            let sent = sender.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        sender.sent()
    }

    #[tokio::test]
    async fn follow_persists_follower_then_accepts() {
        let h = setup((None, FeedStatus::Error)).await;
        let body = follow_body(&h, "https://stardust.community/act/f1");

        let outcome = h
            .inbox
            .handle_follow("birb", &h.caller, &body)
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Handled);

        let followers = h.repo.get_followers_by_user("birb", false).await.unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].user_url, h.caller.id);
        assert_eq!(followers[0].shared_inbox, "https://stardust.community/inbox");

        // the accept fires after a short delay
        let sent = wait_for_sent(&h.sender, 1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].inbox_url, h.caller.inbox);
        let act = &sent[0].activity;
        assert_eq!(act["type"], "Accept");
        assert_eq!(act["object"]["id"], "https://stardust.community/act/f1");
        assert_eq!(act["object"]["actor"], h.caller.id);

        for _ in 0..50 {
            let approved = h.repo.get_followers_by_user("birb", true).await.unwrap();
            if !approved.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("follower was never approved");
    }

    #[tokio::test]
    async fn repeated_follow_is_idempotent() {
        let h = setup((None, FeedStatus::Error)).await;
        let body = follow_body(&h, "https://stardust.community/act/f2");

        for _ in 0..2 {
            let outcome = h
                .inbox
                .handle_follow("birb", &h.caller, &body)
                .await
                .unwrap();
            assert_eq!(outcome, HandlerOutcome::Handled);
        }

        let sent = wait_for_sent(&h.sender, 1).await;
        assert_eq!(sent.len(), 1);
        // extra settle time: a second accept would also have fired by now
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.sender.sent().len(), 1, "exactly one Accept dispatched");
        let followers = h.repo.get_followers_by_user("birb", false).await.unwrap();
        assert_eq!(followers.len(), 1);
    }

    #[tokio::test]
    async fn follow_with_wrong_object_is_rejected() {
        let h = setup((None, FeedStatus::Error)).await;
        let body = json!({
            "id": "https://stardust.community/act/f3",
            "type": "Follow",
            "actor": h.caller.id,
            "object": "https://test-parrot.net/u/somebody.else",
        })
        .to_string()
        .into_bytes();
        let outcome = h
            .inbox
            .handle_follow("birb", &h.caller, &body)
            .await
            .unwrap();
        assert!(matches!(outcome, HandlerOutcome::Problem(_)));

        let unknown = h
            .inbox
            .handle_follow("nobody.known", &h.caller, &body)
            .await
            .unwrap();
        assert!(matches!(unknown, HandlerOutcome::Problem(_)));
    }

    #[tokio::test]
    async fn public_note_with_url_triggers_feed_reply() {
        let h = setup((Some(parrot_account()), FeedStatus::New)).await;
        let to = vec![crate::PUBLIC_STREAM.to_owned()];
        let cc = vec![h.birb_url.clone(), h.caller.followers.clone()];
        let body = note_body(
            &h,
            to,
            cc,
            "<p>@birb please parrot https://cute.example/blog</p>",
        );
        let envelope: ActivityEnvelope = serde_json::from_slice(&body).unwrap();

        let outcome = h
            .inbox
            .handle_create_note(&envelope, &h.caller, &body)
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Handled);

        let sent = wait_for_sent(&h.sender, 1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(
            h.resolver.requests.lock().unwrap().as_slice(),
            ["https://cute.example/blog"]
        );

        assert_eq!(sent[0].sending_user, "birb");
        assert_eq!(sent[0].inbox_url, h.caller.inbox);
        let note = &sent[0].activity["object"];
        assert_eq!(note["to"], json!([crate::PUBLIC_STREAM]));
        assert_eq!(note["cc"], json!([h.caller.id, h.caller.followers]));
        assert_eq!(note["inReplyTo"], "https://stardust.community/notes/7");
        let tags = note["tag"].as_array().unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0]["href"], h.caller.id);
        assert_eq!(tags[0]["name"], "@pixie@stardust.community");
        assert_eq!(tags[1]["href"], "https://test-parrot.net/u/cute.example.blog");
        assert!(note["content"].as_str().unwrap().contains("@pixie"));
    }

    #[tokio::test]
    async fn direct_note_gets_direct_reply() {
        let h = setup((Some(parrot_account()), FeedStatus::New)).await;
        let to = vec![h.birb_url.clone()];
        let body = note_body(&h, to, vec![], "https://cute.example/blog");
        let envelope: ActivityEnvelope = serde_json::from_slice(&body).unwrap();

        h.inbox
            .handle_create_note(&envelope, &h.caller, &body)
            .await
            .unwrap();

        let sent = wait_for_sent(&h.sender, 1).await;
        let note = &sent[0].activity["object"];
        assert_eq!(note["to"], json!([h.caller.id]));
        assert_eq!(note["cc"], json!([]));
        assert_eq!(note["inReplyTo"], "https://stardust.community/notes/7");
    }

    #[tokio::test]
    async fn note_without_single_url_gets_apology() {
        let h = setup((None, FeedStatus::Error)).await;
        let to = vec![crate::PUBLIC_STREAM.to_owned()];
        let cc = vec![h.birb_url.clone(), h.caller.followers.clone()];
        let body = note_body(
            &h,
            to,
            cc,
            "<p>hello https://a.example and also https://b.example</p>",
        );
        let envelope: ActivityEnvelope = serde_json::from_slice(&body).unwrap();

        h.inbox
            .handle_create_note(&envelope, &h.caller, &body)
            .await
            .unwrap();

        let sent = wait_for_sent(&h.sender, 1).await;
        assert_eq!(sent.len(), 1);
        assert!(h.resolver.requests.lock().unwrap().is_empty());
        let note = &sent[0].activity["object"];
        assert!(note["content"]
            .as_str()
            .unwrap()
            .contains("exactly one link"));
        assert_eq!(note["tag"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn note_not_addressed_to_us_is_ignored() {
        let h = setup((None, FeedStatus::Error)).await;
        let to = vec![crate::PUBLIC_STREAM.to_owned()];
        let cc = vec![h.caller.followers.clone()];
        let body = note_body(&h, to, cc, "https://cute.example/blog");
        let envelope: ActivityEnvelope = serde_json::from_slice(&body).unwrap();

        let outcome = h
            .inbox
            .handle_create_note(&envelope, &h.caller, &body)
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Handled);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn mastodon_feed_gets_specific_reply() {
        let h = setup((None, FeedStatus::Mastodon)).await;
        let to = vec![crate::PUBLIC_STREAM.to_owned()];
        let cc = vec![h.birb_url.clone(), h.caller.followers.clone()];
        let body = note_body(&h, to, cc, "https://mastodon.example/@someone.rss");
        let envelope: ActivityEnvelope = serde_json::from_slice(&body).unwrap();

        h.inbox
            .handle_create_note(&envelope, &h.caller, &body)
            .await
            .unwrap();
        let sent = wait_for_sent(&h.sender, 1).await;
        assert!(sent[0].activity["object"]["content"]
            .as_str()
            .unwrap()
            .contains("Mastodon"));
    }

    fn undo_body(h: &Harness, followed_url: &str) -> Vec<u8> {
        json!({
            "id": "https://stardust.community/act/u1",
            "type": "Undo",
            "actor": h.caller.id,
            "object": {
                "id": "https://stardust.community/act/f1",
                "type": "Follow",
                "actor": h.caller.id,
                "object": followed_url,
            },
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn undo_follow_removes_follower() {
        let h = setup((None, FeedStatus::Error)).await;
        h.repo
            .add_follower(
                "birb",
                &Follower {
                    request_id: "https://stardust.community/act/f1".to_owned(),
                    approve_status: 1,
                    user_url: h.caller.id.clone(),
                    handle: CALLER_NAME.to_owned(),
                    host: CALLER_HOST.to_owned(),
                    user_inbox: h.caller.inbox.clone(),
                    shared_inbox: String::new(),
                },
            )
            .await
            .unwrap();

        let body = undo_body(&h, "https://test-parrot.net/u/birb");
        let outcome = h.inbox.handle_undo("birb", &body).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Handled);
        let followers = h.repo.get_followers_by_user("birb", false).await.unwrap();
        assert!(followers.is_empty());
    }

    #[tokio::test]
    async fn undo_follow_for_other_user_is_rejected() {
        let h = setup((None, FeedStatus::Error)).await;
        let body = undo_body(&h, "https://test-parrot.net/u/other.site");
        let outcome = h.inbox.handle_undo("birb", &body).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Problem(_)));

        // non-Follow undos are silently ignored
        let like_undo = json!({
            "id": "https://stardust.community/act/u2",
            "type": "Undo",
            "actor": h.caller.id,
            "object": {"id": "x", "type": "Like", "object": "y"},
        })
        .to_string()
        .into_bytes();
        let outcome = h.inbox.handle_undo("birb", &like_undo).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Handled);
    }
}
