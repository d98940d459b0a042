//! Actor documents, webfinger, collection summaries, and the follow-accept
//! flow.

use crate::config::Config;
use crate::db::Repo;
use crate::error::AppError;
use crate::ids::IdBuilder;
use crate::keystore::KeyStore;
use crate::metrics::Metrics;
use crate::protocol::{
    ActorDoc, Attachment, Endpoints, Image, Note, OrderedCollectionSummary, OutgoingActivity,
    PublicKey, WebfingerLink, WebfingerResponse, ACTIVITY_CONTEXT, ACTOR_CONTEXTS,
};
use crate::sender::ActivitySender;
use crate::texts::Texts;
use chrono::SecondsFormat;
use std::sync::Arc;
use tracing::info;

const WEBSITE_LINK_TEMPLATE: &str =
    "<a href='{url}' target='_blank' rel='nofollow noopener noreferrer me' translate='no'>{pretty}</a>";

pub struct UserDirectory {
    cfg: Arc<Config>,
    repo: Arc<Repo>,
    idb: IdBuilder,
    keystore: Arc<KeyStore>,
    sender: Arc<dyn ActivitySender>,
    metrics: Arc<Metrics>,
    texts: Texts,
}

impl UserDirectory {
    pub fn new(
        cfg: Arc<Config>,
        repo: Arc<Repo>,
        keystore: Arc<KeyStore>,
        sender: Arc<dyn ActivitySender>,
        metrics: Arc<Metrics>,
        texts: Texts,
    ) -> UserDirectory {
        let idb = IdBuilder::new(cfg.host.clone());
        UserDirectory {
            cfg,
            repo,
            idb,
            keystore,
            sender,
            metrics,
            texts,
        }
    }

    pub async fn get_webfinger(&self, user: &str) -> Result<Option<WebfingerResponse>, AppError> {
        let user = user.to_lowercase();
        if self.repo.get_account(&user).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(WebfingerResponse {
            subject: format!("acct:{}@{}", user, self.cfg.host),
            aliases: vec![self.idb.user_profile(&user), self.idb.user_url(&user)],
            links: vec![
                WebfingerLink {
                    rel: "http://webfinger.net/rel/profile-page",
                    kind: "text/html",
                    href: self.idb.user_profile(&user),
                },
                WebfingerLink {
                    rel: "self",
                    kind: crate::APUB_JSON_CONTENT_TYPE,
                    href: self.idb.user_url(&user),
                },
            ],
        }))
    }

    pub async fn get_user_info(&self, user: &str) -> Result<Option<ActorDoc>, AppError> {
        let user = user.to_lowercase();
        let Some(acct) = self.repo.get_account(&user).await? else {
            return Ok(None);
        };

        let mut doc = ActorDoc {
            context: Some(serde_json::json!(ACTOR_CONTEXTS)),
            id: self.idb.user_url(&user),
            kind: "Service".to_owned(),
            preferred_username: user.clone(),
            published: acct.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            inbox: self.idb.user_inbox(&user),
            outbox: self.idb.user_outbox(&user),
            followers: self.idb.user_followers(&user),
            following: self.idb.user_following(&user),
            endpoints: Endpoints {
                shared_inbox: self.idb.shared_inbox(),
            },
            ..ActorDoc::default()
        };

        if user == self.cfg.birb.user {
            self.fill_birb_user_info(&mut doc);
        } else {
            self.fill_feed_user_info(&mut doc, &acct);
        }
        Ok(Some(doc))
    }

    fn fill_birb_user_info(&self, doc: &mut ActorDoc) {
        doc.name = self.texts.get("birb_name.txt");
        doc.summary = self.texts.get("birb_bio.html");
        doc.manually_approves = self.cfg.birb.manually_approves_follows;
        doc.public_key = PublicKey {
            id: self.idb.user_key_id(&self.cfg.birb.user),
            owner: doc.id.clone(),
            public_key_pem: self.cfg.birb.pub_key.clone(),
        };
        doc.attachments.push(self.website_attachment(&self.idb.site_url()));
        doc.icon = Some(Image::new(self.cfg.birb.profile_pic.clone()));
        doc.image = Some(Image::new(self.cfg.birb.header_pic.clone()));
    }

    fn fill_feed_user_info(&self, doc: &mut ActorDoc, acct: &crate::db::Account) {
        doc.name = crate::ids::name_with_parrot(&acct.name);
        doc.summary = self.texts.with_vals(
            "acct_bio.html",
            &[
                ("siteUrl", self.idb.site_url().as_str()),
                ("description", acct.summary.as_str()),
            ],
        );
        doc.manually_approves = false;
        doc.public_key = PublicKey {
            id: self.idb.user_key_id(&acct.handle),
            owner: doc.id.clone(),
            public_key_pem: acct.pub_key.clone(),
        };
        doc.attachments.push(self.website_attachment(&acct.site_url));
        let icon_url = if acct.profile_image_url.is_empty() {
            self.cfg.fallback_profile_pic.clone()
        } else {
            acct.profile_image_url.clone()
        };
        doc.icon = Some(Image::new(icon_url));
        doc.image = Some(Image::new(acct.header_image_url.clone()));
    }

    fn website_attachment(&self, url: &str) -> Attachment {
        let pretty = url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        Attachment {
            kind: "PropertyValue".to_owned(),
            name: "Website".to_owned(),
            value: WEBSITE_LINK_TEMPLATE
                .replace("{url}", url)
                .replace("{pretty}", pretty),
        }
    }

    /// The public form of a stored toot.
    pub async fn get_user_status(
        &self,
        user: &str,
        status_num: &str,
    ) -> Result<Option<Note>, AppError> {
        let user = user.to_lowercase();
        let Ok(id) = status_num.parse::<u64>() else {
            return Ok(None);
        };
        let status_url = self.idb.user_status(&user, id);
        let Some(toot) = self.repo.get_toot(&user, &status_url).await? else {
            return Ok(None);
        };
        Ok(Some(Note {
            context: Some(serde_json::json!(ACTIVITY_CONTEXT)),
            id: toot.status_id,
            kind: "Note".to_owned(),
            published: toot.tooted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            summary: None,
            attributed_to: self.idb.user_url(&user),
            in_reply_to: None,
            to: vec![crate::PUBLIC_STREAM.to_owned()],
            cc: vec![self.idb.user_followers(&user)],
            content: toot.content,
            tag: vec![],
        }))
    }

    pub async fn get_outbox_summary(
        &self,
        user: &str,
    ) -> Result<Option<OrderedCollectionSummary>, AppError> {
        let user = user.to_lowercase();
        if !self.repo.does_account_exist(&user).await? {
            return Ok(None);
        }
        let count = self.repo.get_toot_count(&user).await?;
        Ok(Some(OrderedCollectionSummary::new(
            self.idb.user_outbox(&user),
            count.max(0) as u64,
        )))
    }

    pub async fn get_followers_summary(
        &self,
        user: &str,
    ) -> Result<Option<OrderedCollectionSummary>, AppError> {
        let user = user.to_lowercase();
        if !self.repo.does_account_exist(&user).await? {
            return Ok(None);
        }
        let count = self.repo.get_follower_count(&user, true).await?;
        Ok(Some(OrderedCollectionSummary::new(
            self.idb.user_followers(&user),
            count.max(0) as u64,
        )))
    }

    /// Parrot accounts follow nobody.
    pub async fn get_following_summary(
        &self,
        user: &str,
    ) -> Result<Option<OrderedCollectionSummary>, AppError> {
        let user = user.to_lowercase();
        if !self.repo.does_account_exist(&user).await? {
            return Ok(None);
        }
        Ok(Some(OrderedCollectionSummary::new(
            self.idb.user_following(&user),
            0,
        )))
    }

    /// Sends an `Accept` echoing the original Follow, and on success flips
    /// the follower to approved.
    pub async fn accept_follower(
        &self,
        follow_act_id: &str,
        follower_user_url: &str,
        follower_inbox: &str,
        followed_user: &str,
    ) -> Result<(), AppError> {
        info!(follower_inbox, "accepting follow");

        let priv_key = self.keystore.get_priv_key(followed_user).await?;
        let accept_id = self.repo.next_id();

        let act = OutgoingActivity {
            context: Some(ACTIVITY_CONTEXT),
            id: self.idb.activity_url(accept_id),
            kind: "Accept",
            actor: self.idb.user_url(followed_user),
            to: None,
            cc: None,
            object: Some(OutgoingActivity {
                context: None,
                id: follow_act_id.to_owned(),
                kind: "Follow",
                actor: follower_user_url.to_owned(),
                to: None,
                cc: None,
                object: Some(self.idb.user_url(followed_user)),
            }),
        };

        self.sender
            .send(
                &priv_key,
                followed_user,
                follower_inbox,
                &serde_json::to_value(&act)?,
            )
            .await?;

        self.repo
            .set_follower_approve_status(followed_user, follower_user_url, 1)
            .await?;

        if let Ok(count) = self.repo.get_feed_follower_count().await {
            self.metrics.total_followers(count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::db::{Account, Follower};
    use crate::keystore::test_key_pair_pem;
    use crate::sender::testing::RecordingSender;
    use chrono::Utc;

    struct Harness {
        udir: UserDirectory,
        repo: Arc<Repo>,
        sender: Arc<RecordingSender>,
    }

    async fn setup() -> Harness {
        let (pub_pem, priv_pem) = test_key_pair_pem().clone();
        let mut cfg = test_config();
        cfg.birb.pub_key = pub_pem.clone();
        cfg.birb.priv_key = priv_pem.clone();
        cfg.birb.manually_approves_follows = false;
        let cfg = Arc::new(cfg);

        let repo = Arc::new(Repo::open_in_memory().await.unwrap());
        repo.init_update_db(&cfg).await.unwrap();
        let now = Utc::now();
        repo.add_account_if_not_exist(
            &Account {
                id: 0,
                created_at: now,
                approve_status: 0,
                user_url: "https://test-parrot.net/u/some.site".to_owned(),
                handle: "some.site".to_owned(),
                name: "Some Site".to_owned(),
                summary: "All about things".to_owned(),
                profile_image_url: String::new(),
                header_image_url: String::new(),
                site_url: "https://some.site".to_owned(),
                feed_url: "https://some.site/feed".to_owned(),
                feed_last_updated: now,
                next_check_due: now,
                pub_key: pub_pem,
            },
            &priv_pem,
        )
        .await
        .unwrap();

        let keystore = Arc::new(KeyStore::new(cfg.clone(), repo.clone()));
        let sender = Arc::new(RecordingSender::default());
        let udir = UserDirectory::new(
            cfg,
            repo.clone(),
            keystore,
            sender.clone(),
            Arc::new(Metrics::new()),
            Texts,
        );
        Harness { udir, repo, sender }
    }

    #[tokio::test]
    async fn webfinger_points_at_actor_and_profile() {
        let h = setup().await;
        let wf = h.udir.get_webfinger("birb").await.unwrap().unwrap();
        assert_eq!(wf.subject, "acct:birb@test-parrot.net");
        assert_eq!(wf.aliases.len(), 2);
        assert_eq!(wf.links.len(), 2);
        assert_eq!(wf.links[1].href, "https://test-parrot.net/u/birb");
        assert!(h.udir.get_webfinger("nobody.here").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn feed_actor_doc_has_parrot_name_and_fallback_icon() {
        let h = setup().await;
        let doc = h.udir.get_user_info("Some.Site").await.unwrap().unwrap();
        assert_eq!(doc.kind, "Service");
        assert_eq!(doc.preferred_username, "some.site");
        assert!(doc.name.starts_with('\u{1F99C}'));
        assert!(doc.summary.contains("All about things"));
        assert_eq!(
            doc.icon.unwrap().url,
            "https://test-parrot.net/static/fallback.png"
        );
        assert_eq!(
            doc.endpoints.shared_inbox,
            "https://test-parrot.net/inbox"
        );
        assert_eq!(
            doc.public_key.id,
            "https://test-parrot.net/u/some.site#main-key"
        );
    }

    #[tokio::test]
    async fn birb_actor_doc_uses_config_material() {
        let h = setup().await;
        let doc = h.udir.get_user_info("birb").await.unwrap().unwrap();
        assert_eq!(doc.name, "birb");
        assert!(!doc.manually_approves);
        assert!(doc.public_key.public_key_pem.contains("BEGIN PUBLIC KEY"));
    }

    #[tokio::test]
    async fn summaries_report_counts() {
        let h = setup().await;
        h.repo
            .add_follower(
                "some.site",
                &Follower {
                    request_id: "r".to_owned(),
                    approve_status: 1,
                    user_url: "https://example.social/users/alice".to_owned(),
                    handle: "alice".to_owned(),
                    host: "example.social".to_owned(),
                    user_inbox: "https://example.social/users/alice/inbox".to_owned(),
                    shared_inbox: String::new(),
                },
            )
            .await
            .unwrap();

        let followers = h.udir.get_followers_summary("some.site").await.unwrap().unwrap();
        assert_eq!(followers.total_items, 1);
        let following = h.udir.get_following_summary("some.site").await.unwrap().unwrap();
        assert_eq!(following.total_items, 0);
        let outbox = h.udir.get_outbox_summary("some.site").await.unwrap().unwrap();
        assert_eq!(outbox.total_items, 0);
        assert!(h.udir.get_outbox_summary("gone.site").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accept_echoes_follow_and_approves() {
        let h = setup().await;
        let flwr = Follower {
            request_id: "https://example.social/act/77".to_owned(),
            approve_status: 0,
            user_url: "https://example.social/users/alice".to_owned(),
            handle: "alice".to_owned(),
            host: "example.social".to_owned(),
            user_inbox: "https://example.social/users/alice/inbox".to_owned(),
            shared_inbox: String::new(),
        };
        h.repo.add_follower("some.site", &flwr).await.unwrap();

        h.udir
            .accept_follower(
                &flwr.request_id,
                &flwr.user_url,
                &flwr.user_inbox,
                "some.site",
            )
            .await
            .unwrap();

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].inbox_url, flwr.user_inbox);
        let act = &sent[0].activity;
        assert_eq!(act["type"], "Accept");
        assert_eq!(act["actor"], "https://test-parrot.net/u/some.site");
        assert_eq!(act["object"]["id"], flwr.request_id);
        assert_eq!(act["object"]["type"], "Follow");
        assert_eq!(act["object"]["actor"], flwr.user_url);
        assert_eq!(act["object"]["object"], "https://test-parrot.net/u/some.site");

        let followers = h.repo.get_followers_by_user("some.site", true).await.unwrap();
        assert_eq!(followers.len(), 1);
    }

    #[tokio::test]
    async fn status_round_trips_through_store() {
        let h = setup().await;
        let acct = h.repo.get_account("some.site").await.unwrap().unwrap();
        let status_url = "https://test-parrot.net/u/some.site/status/12345";
        h.repo
            .add_toot(
                acct.id,
                &crate::db::Toot {
                    post_guid_hash: 1,
                    tooted_at: Utc::now(),
                    status_id: status_url.to_owned(),
                    content: "<p>content</p>".to_owned(),
                },
            )
            .await
            .unwrap();

        let note = h
            .udir
            .get_user_status("some.site", "12345")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.id, status_url);
        assert_eq!(note.content, "<p>content</p>");
        assert_eq!(note.to, vec![crate::PUBLIC_STREAM.to_owned()]);
        assert!(h
            .udir
            .get_user_status("some.site", "999")
            .await
            .unwrap()
            .is_none());
        assert!(h
            .udir
            .get_user_status("some.site", "not-a-number")
            .await
            .unwrap()
            .is_none());
    }
}
