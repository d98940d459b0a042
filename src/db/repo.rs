//! The repository: typed operations over the embedded sqlite store.
//!
//! Writers take the process-wide lock exclusively, readers share it. The
//! monotone id generator lives here too, seeded from wall-clock nanoseconds
//! so ids keep growing across restarts.

use crate::config::Config;
use crate::db::entities::{Account, FeedPost, Follower, Toot, TootExtract, TootQueueItem};
use crate::error::AppError;
use crate::ids::IdBuilder;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::info;

const SCHEMA_VER: i64 = 1;

const SCRIPTS: &[(i64, &str)] = &[(1, include_str!("scripts/create-01.sql"))];

pub struct Repo {
    pool: SqlitePool,
    mu: RwLock<()>,
    next_id: AtomicU64,
}

impl Repo {
    /// Opens (and creates, if needed) the database file. WAL journal,
    /// 5 second busy timeout.
    pub async fn open(db_file: &str) -> Result<Repo, AppError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_file))
            .map_err(AppError::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        Ok(Repo::with_pool(pool))
    }

    /// In-memory database; a single connection so all queries see one store.
    pub async fn open_in_memory() -> Result<Repo, AppError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:").map_err(AppError::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Ok(Repo::with_pool(pool))
    }

    fn with_pool(pool: SqlitePool) -> Repo {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Repo {
            pool,
            mu: RwLock::new(()),
            next_id: AtomicU64::new(nanos),
        }
    }

    /// Process-wide monotone id; used for status and activity URLs.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Brings the schema up to the compiled-in version, running the ordered
    /// scripts; after the initial bootstrap, seeds the built-in actor.
    pub async fn init_update_db(&self, cfg: &Config) -> Result<(), AppError> {
        let _g = self.mu.write().await;

        let sys_params_exists: Option<SqliteRow> =
            sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='sys_params'")
                .fetch_optional(&self.pool)
                .await?;

        let mut db_ver: i64 = 0;
        if sys_params_exists.is_some() {
            let row = sqlx::query("SELECT val FROM sys_params WHERE name='schema_ver'")
                .fetch_one(&self.pool)
                .await?;
            let val: String = row.get("val");
            db_ver = val
                .parse()
                .map_err(|e| AppError::Internal(format!("bad schema_ver '{}': {}", val, e)))?;
            info!(db_ver, target_ver = SCHEMA_VER, "database schema version");
        } else {
            info!(target_ver = SCHEMA_VER, "database appears to be empty");
        }

        for ver in (db_ver + 1)..=SCHEMA_VER {
            let (_, script) = SCRIPTS
                .iter()
                .find(|(v, _)| *v == ver)
                .ok_or_else(|| AppError::Internal(format!("missing schema script {}", ver)))?;
            info!(ver, "running schema script");
            for stmt in script.split(';') {
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                sqlx::query(stmt).execute(&self.pool).await?;
            }
            sqlx::query("UPDATE sys_params SET val=? WHERE name='schema_ver'")
                .bind(ver.to_string())
                .execute(&self.pool)
                .await?;
        }

        if db_ver == 0 {
            self.add_built_in_user(cfg).await?;
        }
        Ok(())
    }

    /// Seeds the birb account. Its private key stays in configuration.
    async fn add_built_in_user(&self, cfg: &Config) -> Result<(), AppError> {
        let idb = IdBuilder::new(cfg.host.clone());
        sqlx::query(
            "INSERT INTO accounts (created_at, approve_status, user_url, handle, pubkey)
             VALUES (?, 1, ?, ?, ?)",
        )
        .bind(cfg.birb.published)
        .bind(idb.user_url(&cfg.birb.user))
        .bind(&cfg.birb.user)
        .bind(&cfg.birb.pub_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accounts

    /// Inserts the account unless one with the same handle exists. Never
    /// overwrites; on duplicate handle, returns the existing row.
    pub async fn add_account_if_not_exist(
        &self,
        acct: &Account,
        priv_key: &str,
    ) -> Result<(Account, bool), AppError> {
        let _g = self.mu.write().await;

        let res = sqlx::query(
            "INSERT INTO accounts
                (created_at, approve_status, user_url, handle, name, summary,
                 profile_image_url, header_image_url, site_url, feed_url, pubkey, privkey)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(acct.created_at)
        .bind(acct.approve_status)
        .bind(&acct.user_url)
        .bind(&acct.handle)
        .bind(&acct.name)
        .bind(&acct.summary)
        .bind(&acct.profile_image_url)
        .bind(&acct.header_image_url)
        .bind(&acct.site_url)
        .bind(&acct.feed_url)
        .bind(&acct.pub_key)
        .bind(priv_key)
        .execute(&self.pool)
        .await;

        let is_new = match res {
            Ok(_) => true,
            Err(err) if is_unique_violation(&err) => false,
            Err(err) => return Err(err.into()),
        };
        let stored = self
            .get_account_locked(&acct.handle)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok((stored, is_new))
    }

    pub async fn does_account_exist(&self, handle: &str) -> Result<bool, AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM accounts WHERE handle=?")
            .bind(handle)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("cnt");
        Ok(count != 0)
    }

    /// `None` without error means not-found.
    pub async fn get_account(&self, handle: &str) -> Result<Option<Account>, AppError> {
        let _g = self.mu.read().await;
        self.get_account_locked(handle).await
    }

    async fn get_account_locked(&self, handle: &str) -> Result<Option<Account>, AppError> {
        let row = sqlx::query(&format!("{} WHERE handle=?", SELECT_ACCOUNT))
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_account(&r)))
    }

    /// Pages through non-banned accounts that follow a feed, newest first.
    pub async fn get_accounts_page(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Account>, i64), AppError> {
        let _g = self.mu.read().await;
        let row =
            sqlx::query("SELECT COUNT(*) AS cnt FROM accounts WHERE approve_status>-100 AND feed_url<>''")
                .fetch_one(&self.pool)
                .await?;
        let total: i64 = row.get("cnt");

        let rows = sqlx::query(&format!(
            "{} WHERE approve_status>-100 AND feed_url<>'' ORDER BY id DESC LIMIT ? OFFSET ?",
            SELECT_ACCOUNT
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows.iter().map(row_to_account).collect(), total))
    }

    /// Any one account due for a feed check (we pick the most overdue), plus
    /// the total number of due accounts for the gauge. Accounts without a
    /// feed (the built-in actor) are never due.
    pub async fn get_account_to_check(
        &self,
        check_due: DateTime<Utc>,
    ) -> Result<(Option<Account>, i64), AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM accounts WHERE next_check_due<? AND feed_url<>''",
        )
        .bind(check_due)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("cnt");

        let row = sqlx::query(&format!(
            "{} WHERE next_check_due<? AND feed_url<>'' ORDER BY next_check_due ASC LIMIT 1",
            SELECT_ACCOUNT
        ))
        .bind(check_due)
        .fetch_optional(&self.pool)
        .await?;
        Ok((row.map(|r| row_to_account(&r)), total))
    }

    pub async fn update_account_feed_times(
        &self,
        account_id: i64,
        last_updated: DateTime<Utc>,
        next_check_due: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        sqlx::query("UPDATE accounts SET feed_last_updated=?, next_check_due=? WHERE id=?")
            .bind(last_updated)
            .bind(next_check_due)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_feed_last_updated(&self, account_id: i64) -> Result<DateTime<Utc>, AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query("SELECT feed_last_updated FROM accounts WHERE id=?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("feed_last_updated"))
    }

    pub async fn get_priv_key(&self, handle: &str) -> Result<Option<String>, AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query("SELECT privkey FROM accounts WHERE handle=?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("privkey")))
    }

    /// Removes an account and everything hanging off it.
    pub async fn brute_delete_account(&self, account_id: i64) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        let handle: Option<String> = sqlx::query("SELECT handle FROM accounts WHERE id=?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.get("handle"));
        let Some(handle) = handle else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM followers WHERE account_id=?",
            "DELETE FROM feed_posts WHERE account_id=?",
            "DELETE FROM toots WHERE account_id=?",
        ] {
            sqlx::query(sql).bind(account_id).execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM toot_queue WHERE sending_user=?")
            .bind(&handle)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM accounts WHERE id=?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Feed posts and toots

    /// Duplicate `(account_id, post_guid_hash)` is not an error; it yields
    /// `false`.
    pub async fn add_feed_post_if_new(
        &self,
        account_id: i64,
        post: &FeedPost,
    ) -> Result<bool, AppError> {
        let _g = self.mu.write().await;
        let res = sqlx::query(
            "INSERT INTO feed_posts (account_id, post_guid_hash, post_time, link, title, description)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(post.post_guid_hash)
        .bind(post.post_time)
        .bind(&post.link)
        .bind(&post.title)
        .bind(&post.description)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn add_toot(&self, account_id: i64, toot: &Toot) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        sqlx::query(
            "INSERT INTO toots (account_id, post_guid_hash, tooted_at, status_id, content)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(toot.post_guid_hash)
        .bind(toot.tooted_at)
        .bind(&toot.status_id)
        .bind(&toot.content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_toot_count(&self, handle: &str) -> Result<i64, AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM toots JOIN accounts
             ON toots.account_id=accounts.id AND accounts.handle=?",
        )
        .bind(handle)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("cnt"))
    }

    pub async fn get_total_post_count(&self) -> Result<i64, AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM feed_posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("cnt"))
    }

    /// The status served at `/u/{handle}/status/{id}`.
    pub async fn get_toot(&self, handle: &str, status_id: &str) -> Result<Option<Toot>, AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query(
            "SELECT post_guid_hash, tooted_at, status_id, content FROM toots JOIN accounts
             ON toots.account_id=accounts.id AND accounts.handle=?
             WHERE toots.status_id=?",
        )
        .bind(handle)
        .bind(status_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Toot {
            post_guid_hash: r.get("post_guid_hash"),
            tooted_at: r.get("tooted_at"),
            status_id: r.get("status_id"),
            content: r.get("content"),
        }))
    }

    /// The purge routine's working set.
    pub async fn get_toot_extracts(&self, account_id: i64) -> Result<Vec<TootExtract>, AppError> {
        let _g = self.mu.read().await;
        let rows = sqlx::query("SELECT post_guid_hash, tooted_at FROM toots WHERE account_id=?")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| TootExtract {
                post_guid_hash: r.get("post_guid_hash"),
                tooted_at: r.get("tooted_at"),
            })
            .collect())
    }

    /// Deletes toots at or before `before` and their matching feed posts,
    /// atomically.
    pub async fn purge_posts_and_toots(
        &self,
        account_id: i64,
        before: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM feed_posts WHERE account_id=? AND post_guid_hash IN
               (SELECT post_guid_hash FROM toots WHERE account_id=? AND tooted_at<=?)",
        )
        .bind(account_id)
        .bind(account_id)
        .bind(before)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM toots WHERE account_id=? AND tooted_at<=?")
            .bind(account_id)
            .bind(before)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Followers

    pub async fn get_follower_count(
        &self,
        handle: &str,
        only_approved: bool,
    ) -> Result<i64, AppError> {
        let _g = self.mu.read().await;
        let mut sql = "SELECT COUNT(*) AS cnt FROM followers JOIN accounts
             ON followers.account_id=accounts.id AND accounts.handle=?"
            .to_owned();
        if only_approved {
            sql.push_str(" WHERE followers.approve_status=1");
        }
        let row = sqlx::query(&sql).bind(handle).fetch_one(&self.pool).await?;
        Ok(row.get("cnt"))
    }

    /// Follower rows across all accounts; feeds the total-follower gauge.
    pub async fn get_feed_follower_count(&self) -> Result<i64, AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM followers")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("cnt"))
    }

    pub async fn get_followers_by_user(
        &self,
        handle: &str,
        only_approved: bool,
    ) -> Result<Vec<Follower>, AppError> {
        let _g = self.mu.read().await;
        let mut sql = "SELECT request_id, followers.approve_status AS approve_status,
                followers.user_url AS user_url, followers.handle AS handle, host,
                user_inbox, shared_inbox
             FROM followers JOIN accounts
             ON followers.account_id=accounts.id AND accounts.handle=?"
            .to_owned();
        if only_approved {
            sql.push_str(" WHERE followers.approve_status=1");
        }
        let rows = sqlx::query(&sql).bind(handle).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_follower).collect())
    }

    /// Upsert keyed on `(account_id, user_url)`; a repeated Follow refreshes
    /// `request_id` and `approve_status`.
    pub async fn add_follower(&self, handle: &str, flwr: &Follower) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        let account_id = self.account_id_for(handle).await?;
        sqlx::query(
            "INSERT INTO followers
                (account_id, request_id, approve_status, user_url, handle, host, user_inbox, shared_inbox)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO UPDATE SET request_id=excluded.request_id,
                approve_status=excluded.approve_status",
        )
        .bind(account_id)
        .bind(&flwr.request_id)
        .bind(flwr.approve_status)
        .bind(&flwr.user_url)
        .bind(&flwr.handle)
        .bind(&flwr.host)
        .bind(&flwr.user_inbox)
        .bind(&flwr.shared_inbox)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_follower_approve_status(
        &self,
        handle: &str,
        follower_user_url: &str,
        status: i64,
    ) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        let account_id = self.account_id_for(handle).await?;
        sqlx::query("UPDATE followers SET approve_status=? WHERE account_id=? AND user_url=?")
            .bind(status)
            .bind(account_id)
            .bind(follower_user_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_follower(
        &self,
        handle: &str,
        follower_user_url: &str,
    ) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        let account_id = self.account_id_for(handle).await?;
        sqlx::query("DELETE FROM followers WHERE account_id=? AND user_url=?")
            .bind(account_id)
            .bind(follower_user_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn account_id_for(&self, handle: &str) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT id FROM accounts WHERE handle=?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.get("id")).ok_or(AppError::NotFound)
    }

    // ------------------------------------------------------------------
    // Toot queue

    pub async fn add_toot_queue_item(&self, item: &TootQueueItem) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        sqlx::query(
            "INSERT INTO toot_queue (sending_user, to_inbox, tooted_at, status_id, content)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&item.sending_user)
        .bind(&item.to_inbox)
        .bind(item.tooted_at)
        .bind(&item.status_id)
        .bind(&item.content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queue rows above `above_id` in ascending id order, plus the total
    /// queue length for the gauge.
    pub async fn get_toot_queue_items(
        &self,
        above_id: i64,
        max_count: i64,
    ) -> Result<(Vec<TootQueueItem>, i64), AppError> {
        let _g = self.mu.read().await;
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM toot_queue")
            .fetch_one(&self.pool)
            .await?;
        let qlen: i64 = row.get("cnt");

        let rows = sqlx::query(
            "SELECT id, sending_user, to_inbox, tooted_at, status_id, content
             FROM toot_queue WHERE id>? ORDER BY id ASC LIMIT ?",
        )
        .bind(above_id)
        .bind(max_count)
        .fetch_all(&self.pool)
        .await?;
        let items = rows
            .iter()
            .map(|r| TootQueueItem {
                id: r.get("id"),
                sending_user: r.get("sending_user"),
                to_inbox: r.get("to_inbox"),
                tooted_at: r.get("tooted_at"),
                status_id: r.get("status_id"),
                content: r.get("content"),
            })
            .collect();
        Ok((items, qlen))
    }

    /// Removing the row is the delivery receipt.
    pub async fn delete_toot_queue_item(&self, id: i64) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        sqlx::query("DELETE FROM toot_queue WHERE id=?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handled activities

    /// The idempotency primitive: inserting a second time yields
    /// `alreadyHandled = true` without error.
    pub async fn mark_activity_handled(
        &self,
        id: &str,
        when: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let _g = self.mu.write().await;
        let res = sqlx::query("INSERT INTO handled_activities (id, handled_at) VALUES (?, ?)")
            .bind(id)
            .bind(when)
            .execute(&self.pool)
            .await;
        match res {
            Ok(_) => Ok(false),
            Err(err) if is_unique_violation(&err) => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_handled_activities(&self, before: DateTime<Utc>) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        sqlx::query("DELETE FROM handled_activities WHERE handled_at<?")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn vacuum(&self) -> Result<(), AppError> {
        let _g = self.mu.write().await;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

const SELECT_ACCOUNT: &str = "SELECT id, created_at, approve_status, user_url, handle, name,
    summary, profile_image_url, header_image_url, site_url, feed_url, feed_last_updated,
    next_check_due, pubkey FROM accounts";

fn row_to_account(row: &SqliteRow) -> Account {
    Account {
        id: row.get("id"),
        created_at: row.get("created_at"),
        approve_status: row.get("approve_status"),
        user_url: row.get("user_url"),
        handle: row.get("handle"),
        name: row.get("name"),
        summary: row.get("summary"),
        profile_image_url: row.get("profile_image_url"),
        header_image_url: row.get("header_image_url"),
        site_url: row.get("site_url"),
        feed_url: row.get("feed_url"),
        feed_last_updated: row.get("feed_last_updated"),
        next_check_due: row.get("next_check_due"),
        pub_key: row.get("pubkey"),
    }
}

fn row_to_follower(row: &SqliteRow) -> Follower {
    Follower {
        request_id: row.get("request_id"),
        approve_status: row.get("approve_status"),
        user_url: row.get("user_url"),
        handle: row.get("handle"),
        host: row.get("host"),
        user_inbox: row.get("user_inbox"),
        shared_inbox: row.get("shared_inbox"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}
