use std::future::Future;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

pub type GroupId = i64;
pub type UserId = i64;

/// Who a connection or session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Identity {
    pub user_id: UserId,
    pub name: String,
    pub picture: String,
    pub email: String,
}

/// A stored chat message. `position` is assigned by the store and orders
/// messages within a group; it doubles as the message identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupMessage {
    pub position: i64,
    pub group_id: GroupId,
    pub user: String,
    pub user_image: String,
    pub message: String,
    pub created_at: i64,
}

/// One row of the group directory, as seen by `viewer` in `Db::discover`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub member_count: i64,
    pub is_member: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub group_id: GroupId,
    pub sender: Identity,
    pub body: String,
    pub client_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Appended {
    pub message: GroupMessage,
    /// The client token matched an earlier append; nothing new was written.
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    NoSuchGroup,
    NotMember,
    Member,
}

pub trait MessageStore: Clone + Send + Sync + 'static {
    fn append(&self, message: NewMessage) -> impl Future<Output = Result<Appended, sqlx::Error>> + Send;

    /// Messages of `group_id` with a position strictly after `after`, oldest first.
    fn list_since(
        &self,
        group_id: GroupId,
        after: Option<i64>,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<GroupMessage>, sqlx::Error>> + Send;
}

/// Users and group membership, owned by the rest of the application.
pub trait Directory: Clone + Send + Sync + 'static {
    fn identity(&self, user_id: UserId) -> impl Future<Output = Result<Option<Identity>, sqlx::Error>> + Send;

    fn membership(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> impl Future<Output = Result<Membership, sqlx::Error>> + Send;
}

pub(crate) fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Insert or refresh a user signing in with Google.
    pub async fn upsert_user(
        &self,
        google_id: &str,
        email: &str,
        name: &str,
        picture: Option<&str>,
    ) -> Result<UserId, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO users (google_id,email,name,picture) VALUES (?,?,?,?) \
             ON CONFLICT (google_id) DO UPDATE SET email=excluded.email, name=excluded.name, picture=excluded.picture \
             RETURNING id",
        )
        .bind(google_id)
        .bind(email)
        .bind(name)
        .bind(picture)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Create a group and make its creator the first member.
    pub async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
        creator: UserId,
    ) -> Result<GroupId, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let (group_id,): (i64,) = sqlx::query_as("INSERT INTO groups (name,description) VALUES (?,?) RETURNING id")
            .bind(name)
            .bind(description)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO group_members (user_id,group_id) VALUES (?,?)")
            .bind(creator)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(group_id)
    }

    /// Every group, oldest first, with its size and whether `viewer` belongs to it.
    pub async fn discover(&self, viewer: UserId) -> Result<Vec<GroupSummary>, sqlx::Error> {
        sqlx::query_as(
            "SELECT g.id, g.name, g.description, \
                    (SELECT COUNT(*) FROM group_members m WHERE m.group_id=g.id) AS member_count, \
                    EXISTS (SELECT 1 FROM group_members m WHERE m.group_id=g.id AND m.user_id=?) AS is_member \
             FROM groups g ORDER BY g.id",
        )
        .bind(viewer)
        .fetch_all(&self.pool)
        .await
    }

    /// Add `user_id` to the group. Returns `false` when the group does not exist.
    pub async fn add_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool, sqlx::Error> {
        if sqlx::query("SELECT 1 FROM groups WHERE id=?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?
            .is_none()
        {
            return Ok(false);
        }

        sqlx::query("INSERT OR IGNORE INTO group_members (user_id,group_id) VALUES (?,?)")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }
}

impl MessageStore for Db {
    async fn append(&self, message: NewMessage) -> Result<Appended, sqlx::Error> {
        let NewMessage { group_id, sender, body, client_token } = message;
        let created_at = now_millis();

        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO messages (group_id,user_id,user_name,user_image,content,created_at,client_token) \
             VALUES (?,?,?,?,?,?,?) \
             ON CONFLICT (group_id,user_id,client_token) DO NOTHING \
             RETURNING id",
        )
        .bind(group_id)
        .bind(sender.user_id)
        .bind(&sender.name)
        .bind(&sender.picture)
        .bind(&body)
        .bind(created_at)
        .bind(&client_token)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((position,)) = inserted {
            return Ok(Appended {
                message: GroupMessage {
                    position,
                    group_id,
                    user: sender.name,
                    user_image: sender.picture,
                    message: body,
                    created_at,
                },
                replayed: false,
            });
        }

        // only a repeated client token can conflict
        let message = sqlx::query_as::<_, GroupMessage>(
            "SELECT id AS position, group_id, user_name AS user, user_image, content AS message, created_at \
             FROM messages WHERE group_id=? AND user_id=? AND client_token=?",
        )
        .bind(group_id)
        .bind(sender.user_id)
        .bind(&client_token)
        .fetch_one(&self.pool)
        .await?;

        Ok(Appended { message, replayed: true })
    }

    async fn list_since(
        &self,
        group_id: GroupId,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Vec<GroupMessage>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id AS position, group_id, user_name AS user, user_image, content AS message, created_at \
             FROM messages WHERE group_id=? AND id>? ORDER BY id LIMIT ?",
        )
        .bind(group_id)
        .bind(after.unwrap_or(0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

impl Directory for Db {
    async fn identity(&self, user_id: UserId) -> Result<Option<Identity>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id AS user_id, name, COALESCE(picture, '') AS picture, email FROM users WHERE id=?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn membership(&self, group_id: GroupId, user_id: UserId) -> Result<Membership, sqlx::Error> {
        let row: Option<(Option<i64>,)> = sqlx::query_as(
            "SELECT m.user_id FROM groups g \
             LEFT JOIN group_members m ON m.group_id=g.id AND m.user_id=? \
             WHERE g.id=?",
        )
        .bind(user_id)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => Membership::NoSuchGroup,
            Some((None,)) => Membership::NotMember,
            Some((Some(_),)) => Membership::Member,
        })
    }
}
