//! Outbound messaging: rendering Notes, one-shot replies, broadcast fan-out
//! and the toot-queue dispatcher.
//!
//! The dispatcher is a single cooperative loop. It wakes on a new-work
//! signal, a 5 second idle timer, or a delivery completion, and keeps at most
//! [`MAX_PARALLEL_SENDS`] deliveries in flight. Queue rows are selected above
//! the highest in-flight id, so the same row is never dispatched twice
//! concurrently; deleting the row on success is the delivery receipt.

use crate::config::Config;
use crate::db::{Repo, TootQueueItem};
use crate::error::AppError;
use crate::ids::IdBuilder;
use crate::keystore::KeyStore;
use crate::metrics::Metrics;
use crate::protocol::{Note, OutgoingActivity, Tag, ACTIVITY_CONTEXT};
use crate::sender::ActivitySender;
use chrono::{DateTime, SecondsFormat, Utc};
use itertools::Itertools;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const MAX_PARALLEL_SENDS: usize = 5;
const TOOT_LOOP_IDLE_WAKE: Duration = Duration::from_secs(5);

/// A user to @-mention in an outgoing note.
#[derive(Debug, Clone)]
pub struct MsgMention {
    pub moniker: String,
    pub user_url: String,
}

pub struct Messenger {
    repo: Arc<Repo>,
    keystore: Arc<KeyStore>,
    sender: Arc<dyn ActivitySender>,
    metrics: Arc<Metrics>,
    idb: IdBuilder,
    wake_tx: mpsc::Sender<()>,
}

impl Messenger {
    /// Creates the messenger and starts its dispatcher loop.
    pub fn new(
        cfg: Arc<Config>,
        repo: Arc<Repo>,
        keystore: Arc<KeyStore>,
        sender: Arc<dyn ActivitySender>,
        metrics: Arc<Metrics>,
    ) -> Arc<Messenger> {
        let (messenger, wake_rx) = Messenger::build(cfg, repo, keystore, sender, metrics);
        tokio::spawn(messenger.clone().toot_queue_loop(wake_rx));
        messenger
    }

    /// Construction without the dispatcher; the caller decides whether to
    /// run [`Messenger::toot_queue_loop`].
    pub(crate) fn build(
        cfg: Arc<Config>,
        repo: Arc<Repo>,
        keystore: Arc<KeyStore>,
        sender: Arc<dyn ActivitySender>,
        metrics: Arc<Metrics>,
    ) -> (Arc<Messenger>, mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(4);
        let messenger = Arc::new(Messenger {
            repo,
            keystore,
            sender,
            metrics,
            idb: IdBuilder::new(cfg.host.clone()),
            wake_tx,
        });
        (messenger, wake_rx)
    }

    /// One-shot reply: builds, signs and sends in a background task.
    /// Nothing is persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn send_message_async(
        self: &Arc<Self>,
        by_user: &str,
        to_inbox: &str,
        msg: &str,
        mentions: Vec<MsgMention>,
        to: Vec<String>,
        cc: Vec<String>,
        in_reply_to: Option<String>,
    ) {
        let messenger = self.clone();
        let by_user = by_user.to_owned();
        let to_inbox = to_inbox.to_owned();
        let msg = msg.to_owned();
        tokio::spawn(async move {
            let published = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            if let Err(err) = messenger
                .send_to_inbox(&by_user, to, cc, &to_inbox, in_reply_to, published, &msg, &mentions, None)
                .await
            {
                error!(%err, %to_inbox, "failed to send message to inbox");
            }
        });
    }

    /// Fan-out: one durable queue row per distinct follower inbox, then a
    /// nudge for the dispatcher.
    pub async fn enqueue_broadcast(
        &self,
        user: &str,
        status_id: &str,
        tooted_at: DateTime<Utc>,
        msg: &str,
    ) -> Result<(), AppError> {
        let followers = self.repo.get_followers_by_user(user, true).await?;

        let inboxes: Vec<String> = followers
            .iter()
            .map(|f| {
                if f.shared_inbox.is_empty() {
                    f.user_inbox.clone()
                } else {
                    f.shared_inbox.clone()
                }
            })
            .filter(|inbox| !inbox.is_empty())
            .unique()
            .collect();

        for inbox_url in inboxes {
            self.repo
                .add_toot_queue_item(&TootQueueItem {
                    id: 0,
                    sending_user: user.to_owned(),
                    to_inbox: inbox_url,
                    tooted_at,
                    status_id: status_id.to_owned(),
                    content: msg.to_owned(),
                })
                .await?;
        }
        self.metrics.post_flow("enqueued");

        let _ = self.wake_tx.try_send(());
        Ok(())
    }

    pub(crate) async fn toot_queue_loop(self: Arc<Self>, mut wake_rx: mpsc::Receiver<()>) {
        let (done_tx, mut done_rx) = mpsc::channel::<(i64, bool)>(MAX_PARALLEL_SENDS * 2);
        let mut in_flight: HashSet<i64> = HashSet::new();

        loop {
            tokio::select! {
                Some(()) = wake_rx.recv() => {
                    debug!("new toots in queue");
                    self.send_toots(&mut in_flight, &done_tx).await;
                }
                () = tokio::time::sleep(TOOT_LOOP_IDLE_WAKE) => {
                    self.send_toots(&mut in_flight, &done_tx).await;
                }
                Some((id, delivered)) = done_rx.recv() => {
                    in_flight.remove(&id);
                    if delivered {
                        debug!(id, "toot sent");
                        if let Err(err) = self.repo.delete_toot_queue_item(id).await {
                            error!(%err, id, "failed to remove sent toot from queue");
                        }
                        self.send_toots(&mut in_flight, &done_tx).await;
                    }
                    // failed rows stay queued; the idle timer re-picks them
                }
            }
        }
    }

    async fn send_toots(
        self: &Arc<Self>,
        in_flight: &mut HashSet<i64>,
        done_tx: &mpsc::Sender<(i64, bool)>,
    ) {
        if in_flight.len() >= MAX_PARALLEL_SENDS {
            return;
        }
        let above_id = in_flight.iter().max().copied().unwrap_or(0);
        let max_count = (MAX_PARALLEL_SENDS - in_flight.len()) as i64;
        match self.repo.get_toot_queue_items(above_id, max_count).await {
            Ok((items, qlen)) => {
                self.metrics.toot_queue_length(qlen);
                for item in items {
                    in_flight.insert(item.id);
                    tokio::spawn(self.clone().send_queued_toot(item, done_tx.clone()));
                }
            }
            Err(err) => error!(%err, "failed to get toot queue items"),
        }
    }

    async fn send_queued_toot(self: Arc<Self>, item: TootQueueItem, done_tx: mpsc::Sender<(i64, bool)>) {
        // keep the status URL stable across retries by reusing its numeric id
        let reuse_id = IdBuilder::parse_status_id(&item.status_id);
        let to = vec![crate::PUBLIC_STREAM.to_owned()];
        let cc = vec![self.idb.user_followers(&item.sending_user)];
        let published = item.tooted_at.to_rfc3339_opts(SecondsFormat::Secs, true);

        let res = self
            .send_to_inbox(
                &item.sending_user,
                to,
                cc,
                &item.to_inbox,
                None,
                published,
                &item.content,
                &[],
                reuse_id,
            )
            .await;

        let delivered = match res {
            Ok(()) => {
                self.metrics.feed_toot_sent();
                self.metrics.post_flow("sent");
                true
            }
            Err(err) => {
                warn!(%err, to_inbox = %item.to_inbox, "failed to send queued toot");
                false
            }
        };
        let _ = done_tx.send((item.id, delivered)).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_to_inbox(
        &self,
        by_user: &str,
        to: Vec<String>,
        cc: Vec<String>,
        to_inbox: &str,
        in_reply_to: Option<String>,
        published: String,
        message: &str,
        mentions: &[MsgMention],
        reuse_id: Option<u64>,
    ) -> Result<(), AppError> {
        debug!(to_inbox, "sending to inbox");

        let priv_key = self.keystore.get_priv_key(by_user).await?;
        let id = match reuse_id {
            Some(id) => id,
            None => self.repo.next_id(),
        };
        let tag = mentions
            .iter()
            .map(|m| Tag::mention(&m.user_url, &m.moniker))
            .collect();

        let note = Note {
            context: None,
            id: self.idb.user_status(by_user, id),
            kind: "Note".to_owned(),
            published,
            summary: None,
            attributed_to: self.idb.user_url(by_user),
            in_reply_to,
            to: to.clone(),
            cc: cc.clone(),
            content: message.to_owned(),
            tag,
        };
        let act = OutgoingActivity {
            context: Some(ACTIVITY_CONTEXT),
            id: self.idb.user_status_activity(by_user, id),
            kind: "Create",
            actor: self.idb.user_url(by_user),
            to: Some(to),
            cc: Some(cc),
            object: Some(note),
        };

        self.sender
            .send(&priv_key, by_user, to_inbox, &serde_json::to_value(&act)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::db::{Account, Follower};
    use crate::keystore::test_key_pair_pem;
    use crate::sender::testing::RecordingSender;

    struct Harness {
        messenger: Arc<Messenger>,
        wake_rx: Option<mpsc::Receiver<()>>,
        repo: Arc<Repo>,
        sender: Arc<RecordingSender>,
    }

    async fn setup(sender_delay: Option<Duration>) -> Harness {
        let (pub_pem, priv_pem) = test_key_pair_pem().clone();
        let mut cfg = test_config();
        cfg.birb.pub_key = pub_pem.clone();
        cfg.birb.priv_key = priv_pem.clone();
        let cfg = Arc::new(cfg);

        let repo = Arc::new(Repo::open_in_memory().await.unwrap());
        repo.init_update_db(&cfg).await.unwrap();

        let now = Utc::now();
        let acct = Account {
            id: 0,
            created_at: now,
            approve_status: 0,
            user_url: "https://test-parrot.net/u/some.site".to_owned(),
            handle: "some.site".to_owned(),
            name: "Some Site".to_owned(),
            summary: String::new(),
            profile_image_url: String::new(),
            header_image_url: String::new(),
            site_url: "https://some.site".to_owned(),
            feed_url: "https://some.site/feed".to_owned(),
            feed_last_updated: now,
            next_check_due: now,
            pub_key: pub_pem,
        };
        repo.add_account_if_not_exist(&acct, &priv_pem).await.unwrap();

        let keystore = Arc::new(KeyStore::new(cfg.clone(), repo.clone()));
        let sender = Arc::new(RecordingSender {
            delay: sender_delay,
            ..RecordingSender::default()
        });
        let metrics = Arc::new(Metrics::new());
        let (messenger, wake_rx) = Messenger::build(
            cfg,
            repo.clone(),
            keystore,
            sender.clone(),
            metrics,
        );
        Harness {
            messenger,
            wake_rx: Some(wake_rx),
            repo,
            sender,
        }
    }

    fn follower(n: usize, shared: Option<&str>, approved: bool) -> Follower {
        Follower {
            request_id: format!("https://remote{}.example/act/1", n),
            approve_status: if approved { 1 } else { 0 },
            user_url: format!("https://remote{}.example/users/u", n),
            handle: "u".to_owned(),
            host: format!("remote{}.example", n),
            user_inbox: format!("https://remote{}.example/users/u/inbox", n),
            shared_inbox: shared.map(str::to_owned).unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_distinct_inboxes() {
        let h = setup(None).await;
        // two followers behind one shared inbox, one with a personal inbox
        // only, and one who is not approved
        let mut f1 = follower(1, Some("https://remote1.example/inbox"), true);
        f1.user_url = "https://remote1.example/users/a".to_owned();
        let mut f2 = follower(1, Some("https://remote1.example/inbox"), true);
        f2.user_url = "https://remote1.example/users/b".to_owned();
        let f3 = follower(2, None, true);
        let f4 = follower(3, Some("https://remote3.example/inbox"), false);
        for f in [&f1, &f2, &f3, &f4] {
            h.repo.add_follower("some.site", f).await.unwrap();
        }

        h.messenger
            .enqueue_broadcast(
                "some.site",
                "https://test-parrot.net/u/some.site/status/42",
                Utc::now(),
                "<p>new post</p>",
            )
            .await
            .unwrap();

        let (items, qlen) = h.repo.get_toot_queue_items(0, 100).await.unwrap();
        assert_eq!(qlen, 2);
        let mut inboxes: Vec<&str> = items.iter().map(|i| i.to_inbox.as_str()).collect();
        inboxes.sort_unstable();
        assert_eq!(
            inboxes,
            vec![
                "https://remote1.example/inbox",
                "https://remote2.example/users/u/inbox"
            ]
        );
    }

    #[tokio::test]
    async fn dispatcher_keeps_at_most_five_in_flight() {
        let mut h = setup(Some(Duration::from_millis(40))).await;
        for n in 0..12 {
            let f = follower(100 + n, None, true);
            h.repo.add_follower("some.site", &f).await.unwrap();
        }
        h.messenger
            .enqueue_broadcast(
                "some.site",
                "https://test-parrot.net/u/some.site/status/42",
                Utc::now(),
                "<p>new post</p>",
            )
            .await
            .unwrap();

        let wake_rx = h.wake_rx.take().unwrap();
        tokio::spawn(h.messenger.clone().toot_queue_loop(wake_rx));

        // wait for the queue to drain
        for _ in 0..200 {
            let (_, qlen) = h.repo.get_toot_queue_items(0, 1).await.unwrap();
            if qlen == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let (_, qlen) = h.repo.get_toot_queue_items(0, 1).await.unwrap();
        assert_eq!(qlen, 0);

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 12);
        let distinct: std::collections::HashSet<&str> =
            sent.iter().map(|s| s.inbox_url.as_str()).collect();
        assert_eq!(distinct.len(), 12, "every row dispatched exactly once");
        assert!(h.sender.max_concurrent() <= MAX_PARALLEL_SENDS);
        assert!(h.sender.max_concurrent() >= 2, "sends did overlap");
    }

    #[tokio::test]
    async fn queued_toot_reuses_status_id() {
        let h = setup(None).await;
        let item = TootQueueItem {
            id: 1,
            sending_user: "some.site".to_owned(),
            to_inbox: "https://remote1.example/inbox".to_owned(),
            tooted_at: Utc::now(),
            status_id: "https://test-parrot.net/u/some.site/status/777".to_owned(),
            content: "<p>post</p>".to_owned(),
        };
        let (done_tx, mut done_rx) = mpsc::channel(1);
        h.messenger
            .clone()
            .send_queued_toot(item, done_tx)
            .await;
        assert_eq!(done_rx.recv().await, Some((1, true)));

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        let act = &sent[0].activity;
        assert_eq!(act["type"], "Create");
        assert_eq!(
            act["object"]["id"],
            "https://test-parrot.net/u/some.site/status/777"
        );
        assert_eq!(act["object"]["to"][0], crate::PUBLIC_STREAM);
        assert_eq!(
            act["object"]["cc"][0],
            "https://test-parrot.net/u/some.site/followers"
        );
    }

    #[tokio::test]
    async fn reply_carries_mentions_and_thread() {
        let h = setup(None).await;
        h.messenger
            .send_to_inbox(
                "birb",
                vec![crate::PUBLIC_STREAM.to_owned()],
                vec!["https://remote1.example/users/u".to_owned()],
                "https://remote1.example/inbox",
                Some("https://remote1.example/notes/5".to_owned()),
                "2024-01-01T00:00:00Z".to_owned(),
                "<p>hi</p>",
                &[MsgMention {
                    moniker: "@u@remote1.example".to_owned(),
                    user_url: "https://remote1.example/users/u".to_owned(),
                }],
                None,
            )
            .await
            .unwrap();

        let sent = h.sender.sent();
        let note = &sent[0].activity["object"];
        assert_eq!(note["inReplyTo"], "https://remote1.example/notes/5");
        assert_eq!(note["tag"][0]["type"], "Mention");
        assert_eq!(note["tag"][0]["name"], "@u@remote1.example");
        assert_eq!(sent[0].sending_user, "birb");
    }
}
