//! User Storage
//! Mission: Securely store and manage user accounts with SQLite

use crate::auth::models::{User, UserRole};
use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// User storage with SQLite backend.
pub struct UserStore {
    db_path: PathBuf,
}

impl UserStore {
    /// Create a new user store and initialize the database.
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        self.create_default_admin(&conn)?;
        Ok(())
    }

    /// Create a default admin user for initial setup.
    fn create_default_admin(&self, conn: &Connection) -> Result<()> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE role = 'admin'",
                [],
                |row| row.get(0),
            )
            .context("Failed to check for admin users")?;

        if count == 0 {
            let password_hash =
                hash("admin123", DEFAULT_COST).context("Failed to hash password")?;

            conn.execute(
                "INSERT INTO users (username, password_hash, role, first_name, last_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    "admin",
                    password_hash,
                    UserRole::Admin.as_str(),
                    "System",
                    "Administrator",
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert admin user")?;

            info!("🔐 Default admin user created (username: admin, password: admin123)");
            warn!("⚠️  CHANGE DEFAULT PASSWORD IN PRODUCTION!");
        }

        Ok(())
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        let role_str: String = row.get(2)?;
        Ok(User {
            username: row.get(0)?,
            password_hash: row.get(1)?,
            role: UserRole::from_str(&role_str).unwrap_or(UserRole::Gp),
            first_name: row.get(3)?,
            last_name: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    /// Get a user by username.
    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        let conn = Connection::open(&self.db_path)?;

        let mut stmt = conn.prepare(
            "SELECT username, password_hash, role, first_name, last_name, created_at
             FROM users WHERE username = ?1",
        )?;

        match stmt.query_row(params![username], Self::row_to_user) {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Verify username and password; returns the user on success.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        match self.get_user(username)? {
            Some(user) => {
                let valid =
                    verify(password, &user.password_hash).context("Failed to verify password")?;
                Ok(valid.then_some(user))
            }
            None => Ok(None),
        }
    }

    /// Create a new user.
    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        role: UserRole,
        first_name: &str,
        last_name: &str,
    ) -> Result<User> {
        let password_hash = hash(password, DEFAULT_COST).context("Failed to hash password")?;

        let user = User {
            username: username.to_string(),
            password_hash,
            role,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        let conn = Connection::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO users (username, password_hash, role, first_name, last_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.username,
                user.password_hash,
                user.role.as_str(),
                user.first_name,
                user.last_name,
                user.created_at,
            ],
        )
        .context("Failed to insert user")?;

        info!("✅ Created user: {} ({})", user.username, user.role.as_str());
        Ok(user)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = Connection::open(&self.db_path)?;

        let mut stmt = conn.prepare(
            "SELECT username, password_hash, role, first_name, last_name, created_at FROM users",
        )?;
        let users = stmt
            .query_map([], Self::row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(users)
    }

    /// Delete a user by username.
    pub fn delete_user(&self, username: &str) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        let rows_affected =
            conn.execute("DELETE FROM users WHERE username = ?1", params![username])?;

        if rows_affected == 0 {
            anyhow::bail!("User not found");
        }
        info!("🗑️  Deleted user: {}", username);
        Ok(())
    }
}
