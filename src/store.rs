//! Metadata store: users, groups, memberships, locked files and shares.
//!
//! Backed by a single SQLite connection. All statements are parameterized.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub picture: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_id: String,
    pub name: String,
    /// Owner email, shown to other members.
    pub owner: String,
    #[serde(skip)]
    pub owner_id: String,
    pub is_public: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub object_key: String,
    pub owner_id: String,
    pub salt: String,
    pub digest: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareRecord {
    pub object_key: String,
    pub owner_id: String,
    pub owner_email: String,
    pub shared_with: String,
}

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT NOT NULL,
                picture TEXT NOT NULL,
                last_login INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS groups (
                group_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                owner_email TEXT NOT NULL,
                is_public INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
                email TEXT NOT NULL,
                PRIMARY KEY (group_id, email)
            );
            CREATE INDEX IF NOT EXISTS idx_group_members_email ON group_members(email);
            CREATE TABLE IF NOT EXISTS locked_files (
                object_key TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                salt TEXT NOT NULL,
                digest TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS shares (
                object_key TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                owner_email TEXT NOT NULL,
                shared_with TEXT NOT NULL,
                PRIMARY KEY (object_key, shared_with)
            );
            CREATE INDEX IF NOT EXISTS idx_shares_with ON shares(shared_with);",
        )?;
        Ok(())
    }

    // ---- users ----

    pub fn upsert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, email, name, picture, last_login)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                picture = excluded.picture,
                last_login = excluded.last_login",
            params![
                user.id,
                user.email,
                user.name,
                user.picture,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT user_id, email, name, picture FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        picture: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    // ---- groups ----

    pub fn create_group(&self, group: &Group) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO groups (group_id, name, owner_id, owner_email, is_public, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                group.group_id,
                group.name,
                group.owner_id,
                group.owner,
                group.is_public,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        let conn = self.conn()?;
        let group = conn
            .query_row(
                "SELECT group_id, name, owner_email, owner_id, is_public
                 FROM groups WHERE group_id = ?1",
                params![group_id],
                map_group,
            )
            .optional()?;
        Ok(group)
    }

    pub fn groups_owned_by(&self, owner_id: &str) -> Result<Vec<Group>> {
        self.query_groups(
            "SELECT group_id, name, owner_email, owner_id, is_public
             FROM groups WHERE owner_id = ?1 ORDER BY created_at, group_id",
            owner_id,
        )
    }

    /// Groups `email` belongs to as a non-owner member.
    pub fn groups_joined_by(&self, email: &str) -> Result<Vec<Group>> {
        self.query_groups(
            "SELECT g.group_id, g.name, g.owner_email, g.owner_id, g.is_public
             FROM groups g JOIN group_members m ON m.group_id = g.group_id
             WHERE m.email = ?1 AND g.owner_email <> ?1
             ORDER BY g.created_at, g.group_id",
            email,
        )
    }

    pub fn public_groups(&self) -> Result<Vec<Group>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT group_id, name, owner_email, owner_id, is_public
             FROM groups WHERE is_public = 1 ORDER BY created_at, group_id",
        )?;
        let groups = stmt
            .query_map([], map_group)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    fn query_groups(&self, sql: &str, arg: &str) -> Result<Vec<Group>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let groups = stmt
            .query_map(params![arg], map_group)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Returns `false` when the membership already existed.
    pub fn add_member(&self, group_id: &str, email: &str) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, email) VALUES (?1, ?2)",
            params![group_id, normalize_email(email)],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_member(&self, group_id: &str, email: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND email = ?2",
            params![group_id, normalize_email(email)],
        )?;
        Ok(removed > 0)
    }

    pub fn is_member(&self, group_id: &str, email: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM group_members WHERE group_id = ?1 AND email = ?2",
                params![group_id, normalize_email(email)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn members(&self, group_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT email FROM group_members WHERE group_id = ?1 ORDER BY email")?;
        let emails = stmt
            .query_map(params![group_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(emails)
    }

    // ---- locked files ----

    pub fn lock_file(&self, record: &LockRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO locked_files (object_key, owner_id, salt, digest)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(object_key) DO UPDATE SET
                owner_id = excluded.owner_id,
                salt = excluded.salt,
                digest = excluded.digest",
            params![
                record.object_key,
                record.owner_id,
                record.salt,
                record.digest
            ],
        )?;
        Ok(())
    }

    pub fn locked_file(&self, object_key: &str) -> Result<Option<LockRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT object_key, owner_id, salt, digest FROM locked_files WHERE object_key = ?1",
                params![object_key],
                map_lock,
            )
            .optional()?;
        Ok(record)
    }

    pub fn locked_files_of(&self, owner_id: &str) -> Result<Vec<LockRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT object_key, owner_id, salt, digest FROM locked_files
             WHERE owner_id = ?1 ORDER BY object_key",
        )?;
        let records = stmt
            .query_map(params![owner_id], map_lock)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn unlock_file(&self, object_key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM locked_files WHERE object_key = ?1",
            params![object_key],
        )?;
        Ok(removed > 0)
    }

    // ---- shares ----

    /// Returns `false` when the share already existed.
    pub fn add_share(&self, record: &ShareRecord) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO shares (object_key, owner_id, owner_email, shared_with)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.object_key,
                record.owner_id,
                record.owner_email,
                normalize_email(&record.shared_with)
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_share(&self, object_key: &str, owner_id: &str, shared_with: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM shares WHERE object_key = ?1 AND owner_id = ?2 AND shared_with = ?3",
            params![object_key, owner_id, normalize_email(shared_with)],
        )?;
        Ok(removed > 0)
    }

    pub fn shares_with(&self, email: &str) -> Result<Vec<ShareRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT object_key, owner_id, owner_email, shared_with FROM shares
             WHERE shared_with = ?1 ORDER BY owner_email, object_key",
        )?;
        let records = stmt
            .query_map(params![normalize_email(email)], |row| {
                Ok(ShareRecord {
                    object_key: row.get(0)?,
                    owner_id: row.get(1)?,
                    owner_email: row.get(2)?,
                    shared_with: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// True when `object_key` is shared with `email` directly or through a
    /// shared folder prefix.
    pub fn is_shared_with(&self, object_key: &str, email: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM shares WHERE shared_with = ?1 AND (
                    object_key = ?2 OR (
                        substr(object_key, -1) = '/'
                        AND substr(?2, 1, length(object_key)) = object_key
                    )
                 ) LIMIT 1",
                params![normalize_email(email), object_key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Drops lock and share rows of the given deleted objects. Matching is
    /// exact; callers pass every expanded key, folder markers included.
    pub fn forget_objects(&self, keys: &[String]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut forget_lock = tx.prepare("DELETE FROM locked_files WHERE object_key = ?1")?;
            let mut forget_shares = tx.prepare("DELETE FROM shares WHERE object_key = ?1")?;
            for key in keys {
                removed += forget_lock.execute(params![key])?;
                removed += forget_shares.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

fn map_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        group_id: row.get(0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        owner_id: row.get(3)?,
        is_public: row.get(4)?,
    })
}

fn map_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<LockRecord> {
    Ok(LockRecord {
        object_key: row.get(0)?,
        owner_id: row.get(1)?,
        salt: row.get(2)?,
        digest: row.get(3)?,
    })
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
