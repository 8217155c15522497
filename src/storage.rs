use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub uid: String,
    pub display_name: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub account_id: i64,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("storage: enable foreign keys")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn upsert_account(&self, mut account: Account) -> Result<i64> {
        if account.uid.is_empty() {
            bail!("storage: user id required");
        }
        let now = Utc::now();
        if account.created_at.timestamp() == 0 {
            account.created_at = now;
        }
        account.updated_at = now;

        let conn = self.conn.lock();
        let id: i64 = conn.query_row(
            r#"
INSERT INTO accounts (uid, display_name, avatar_url, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(uid) DO UPDATE SET
  display_name = excluded.display_name,
  avatar_url = excluded.avatar_url,
  updated_at = excluded.updated_at
RETURNING id
"#,
            params![
                account.uid,
                account.display_name,
                account.avatar_url,
                account.created_at.timestamp(),
                account.updated_at.timestamp(),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_account_by_uid(&self, uid: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT id, uid, display_name, avatar_url, created_at, updated_at
FROM accounts
WHERE uid = ?1
"#,
            params![uid],
            account_from_row,
        )
        .optional()
        .context("storage: query account by uid")
    }

    /// Accounts, most recently used first.
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT id, uid, display_name, avatar_url, created_at, updated_at
FROM accounts
ORDER BY updated_at DESC, id DESC
"#,
        )?;
        let rows = stmt
            .query_map([], account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Removes an account together with its stored token.
    pub fn delete_account(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .context("storage: delete account")?;
        Ok(removed > 0)
    }

    pub fn upsert_token(&self, token: Token) -> Result<()> {
        if token.account_id == 0 {
            bail!("storage: account id required for token");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO tokens (account_id, id_token, refresh_token, expires_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(account_id) DO UPDATE SET
  id_token = excluded.id_token,
  refresh_token = excluded.refresh_token,
  expires_at = excluded.expires_at
"#,
            params![
                token.account_id,
                token.id_token,
                token.refresh_token,
                token.expires_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_token(&self, account_id: i64) -> Result<Option<Token>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT account_id, id_token, refresh_token, expires_at
FROM tokens
WHERE account_id = ?1
"#,
            params![account_id],
            |row| {
                let expires: i64 = row.get(3)?;
                Ok(Token {
                    account_id: row.get(0)?,
                    id_token: row.get(1)?,
                    refresh_token: row.get(2)?,
                    expires_at: timestamp(expires),
                })
            },
        )
        .optional()
        .context("storage: query token")
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let created: i64 = row.get(4)?;
    let updated: i64 = row.get(5)?;
    Ok(Account {
        id: row.get(0)?,
        uid: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        created_at: timestamp(created),
        updated_at: timestamp(updated),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![r#"
CREATE TABLE IF NOT EXISTS accounts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uid TEXT NOT NULL UNIQUE,
  display_name TEXT NOT NULL DEFAULT '',
  avatar_url TEXT NOT NULL DEFAULT '',
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
  account_id INTEGER PRIMARY KEY,
  id_token TEXT NOT NULL,
  refresh_token TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  FOREIGN KEY(account_id) REFERENCES accounts(id) ON DELETE CASCADE
);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("scufftube").join("state.db"))
}
