//! Store module - SQLite persistence for agents, conversations and messages
//!
//! A [`Store`] is a cheap, cloneable handle to a connection pool. Work happens
//! in a [`Session`]: the first write opens a transaction, later reads in the
//! same session see those writes, and [`Gateway::commit`] makes them visible
//! to everyone else. Dropping a session rolls back anything it did not commit.
//!
//! Identities come from SQLite, and deleting an agent or a conversation
//! cascades through foreign keys.

mod entities;
mod schema;

pub use entities::{
    Agent, AgentId, AgentPatch, Conversation, ConversationId, Message, MessageId, NewAgent, Role,
    TokenUsage, UsageId, UsageTotals, DEFAULT_SYSTEM_PROMPT,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteQueryResult, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::Error;
use crate::Result;

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_CONNECTIONS: u32 = 5;

type Statement<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Persistence operations the message pipeline depends on.
#[async_trait]
pub trait Gateway: Send {
    async fn get_conversation(&mut self, id: ConversationId) -> Result<Option<Conversation>>;

    async fn get_agent(&mut self, id: AgentId) -> Result<Option<Agent>>;

    /// Write a new message; identity and timestamp are assigned here.
    async fn create_message(
        &mut self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> Result<Message>;

    /// Messages of a conversation, oldest first.
    async fn list_messages(&mut self, conversation_id: ConversationId) -> Result<Vec<Message>>;

    /// Write the token usage of one completion call.
    async fn record_usage(
        &mut self,
        conversation_id: ConversationId,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        total_tokens: i64,
    ) -> Result<TokenUsage>;

    /// Make every write of this unit of work durable at once.
    async fn commit(&mut self) -> Result<()>;
}

/// Handle to the shared database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Store backed by the SQLite file at `path`, created on first use.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        schema::migrate(&pool).await?;
        debug!("Opened store {}", path.display());
        Ok(Self { pool })
    }

    /// Process-local store, lost on exit.
    ///
    /// Backed by a single connection, so at most one session can hold an
    /// open transaction at a time.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Each in-memory connection is its own database: keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Begin a unit of work.
    pub fn session(&self) -> Session {
        Session {
            pool: self.pool.clone(),
            tx: None,
            pending: 0,
        }
    }

    /// Let conversations point at agents that do not exist.
    #[cfg(test)]
    pub(crate) async fn allow_orphans(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// A unit of work over a [`Store`].
pub struct Session {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    pending: usize,
}

impl Session {
    async fn fetch_optional(&mut self, query: Statement<'_>) -> Result<Option<SqliteRow>> {
        let row = match self.tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(row)
    }

    async fn fetch_one(&mut self, query: Statement<'_>) -> Result<SqliteRow> {
        let row = match self.tx.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(row)
    }

    async fn fetch_all(&mut self, query: Statement<'_>) -> Result<Vec<SqliteRow>> {
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    /// Run a write inside this session's transaction, opening it if needed.
    async fn execute(&mut self, query: Statement<'_>) -> Result<SqliteQueryResult> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        let tx = self.tx.insert(tx);

        let result = query.execute(&mut **tx).await?;
        if result.rows_affected() > 0 {
            self.pending += 1;
        }
        Ok(result)
    }

    /// Number of uncommitted writes.
    pub fn pending_writes(&self) -> usize {
        self.pending
    }

    /// Discard uncommitted writes.
    pub async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            debug!("Rolled back {} writes", self.pending);
        }
        self.pending = 0;
        Ok(())
    }

    /// All agents, newest first.
    pub async fn list_agents(&mut self) -> Result<Vec<Agent>> {
        let rows = self
            .fetch_all(sqlx::query(
                "SELECT * FROM agents ORDER BY created_at DESC, id DESC",
            ))
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    pub async fn insert_agent(
        &mut self,
        name: &str,
        system_prompt: &str,
        description: Option<&str>,
    ) -> Result<Agent> {
        let now = Utc::now();
        let result = self
            .execute(
                sqlx::query(
                    "INSERT INTO agents (name, system_prompt, description, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(name)
                .bind(system_prompt)
                .bind(description)
                .bind(now)
                .bind(now),
            )
            .await?;

        Ok(Agent {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    /// Overwrite the mutable fields of an existing agent.
    pub async fn update_agent(&mut self, agent: Agent) -> Result<Agent> {
        let result = self
            .execute(
                sqlx::query(
                    "UPDATE agents SET name = ?, system_prompt = ?, description = ?, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(agent.name.as_str())
                .bind(agent.system_prompt.as_str())
                .bind(agent.description.as_deref())
                .bind(agent.updated_at)
                .bind(agent.id),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Agent", agent.id));
        }
        Ok(agent)
    }

    /// Delete an agent with its conversations, their messages and usage.
    pub async fn delete_agent(&mut self, id: AgentId) -> Result<bool> {
        let result = self
            .execute(sqlx::query("DELETE FROM agents WHERE id = ?").bind(id))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write a conversation. Ownership is checked by the caller.
    pub async fn insert_conversation(
        &mut self,
        agent_id: AgentId,
        title: Option<&str>,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let result = self
            .execute(
                sqlx::query(
                    "INSERT INTO conversations (agent_id, title, created_at, updated_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(agent_id)
                .bind(title)
                .bind(now)
                .bind(now),
            )
            .await?;

        Ok(Conversation {
            id: result.last_insert_rowid(),
            agent_id,
            title: title.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    /// Conversations of an agent, most recently updated first.
    pub async fn list_conversations(&mut self, agent_id: AgentId) -> Result<Vec<Conversation>> {
        let rows = self
            .fetch_all(
                sqlx::query(
                    "SELECT * FROM conversations WHERE agent_id = ? \
                     ORDER BY updated_at DESC, id DESC",
                )
                .bind(agent_id),
            )
            .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    pub async fn delete_conversation(&mut self, id: ConversationId) -> Result<bool> {
        let result = self
            .execute(sqlx::query("DELETE FROM conversations WHERE id = ?").bind(id))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_messages(&mut self, conversation_id: ConversationId) -> Result<i64> {
        let row = self
            .fetch_one(
                sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE conversation_id = ?")
                    .bind(conversation_id),
            )
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Usage records of a conversation, oldest first.
    pub async fn usage_for_conversation(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<Vec<TokenUsage>> {
        let rows = self
            .fetch_all(
                sqlx::query(
                    "SELECT * FROM token_usage WHERE conversation_id = ? ORDER BY created_at, id",
                )
                .bind(conversation_id),
            )
            .await?;
        rows.iter().map(usage_from_row).collect()
    }

    pub async fn usage_totals_for_conversation(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<UsageTotals> {
        let row = self
            .fetch_one(
                sqlx::query(
                    "SELECT COUNT(*) AS requests, \
                            COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
                            COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
                            COALESCE(SUM(total_tokens), 0) AS total_tokens \
                     FROM token_usage WHERE conversation_id = ?",
                )
                .bind(conversation_id),
            )
            .await?;
        totals_from_row(&row)
    }

    /// Usage summed over every conversation of an agent.
    pub async fn usage_totals_for_agent(&mut self, agent_id: AgentId) -> Result<UsageTotals> {
        let row = self
            .fetch_one(
                sqlx::query(
                    "SELECT COUNT(u.id) AS requests, \
                            COALESCE(SUM(u.prompt_tokens), 0) AS prompt_tokens, \
                            COALESCE(SUM(u.completion_tokens), 0) AS completion_tokens, \
                            COALESCE(SUM(u.total_tokens), 0) AS total_tokens \
                     FROM token_usage u JOIN conversations c ON c.id = u.conversation_id \
                     WHERE c.agent_id = ?",
                )
                .bind(agent_id),
            )
            .await?;
        totals_from_row(&row)
    }
}

#[async_trait]
impl Gateway for Session {
    async fn get_conversation(&mut self, id: ConversationId) -> Result<Option<Conversation>> {
        let row = self
            .fetch_optional(sqlx::query("SELECT * FROM conversations WHERE id = ?").bind(id))
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn get_agent(&mut self, id: AgentId) -> Result<Option<Agent>> {
        let row = self
            .fetch_optional(sqlx::query("SELECT * FROM agents WHERE id = ?").bind(id))
            .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn create_message(
        &mut self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        if content.is_empty() {
            return Err(Error::invalid("message content cannot be empty"));
        }
        if self.get_conversation(conversation_id).await?.is_none() {
            return Err(Error::not_found("Conversation", conversation_id));
        }

        let last_at: Option<DateTime<Utc>> = self
            .fetch_optional(
                sqlx::query(
                    "SELECT created_at FROM messages WHERE conversation_id = ? \
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                )
                .bind(conversation_id),
            )
            .await?
            .map(|row| row.try_get("created_at"))
            .transpose()?;

        // Creation time alone must order the conversation, even if the clock steps back
        let now = Utc::now();
        let created_at = last_at.map_or(now, |last| last.max(now));

        let result = self
            .execute(
                sqlx::query(
                    "INSERT INTO messages (conversation_id, role, content, created_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(conversation_id)
                .bind(role.as_str())
                .bind(content)
                .bind(created_at),
            )
            .await?;

        Ok(Message {
            id: result.last_insert_rowid(),
            conversation_id,
            role,
            content: content.to_string(),
            created_at,
        })
    }

    async fn list_messages(&mut self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let rows = self
            .fetch_all(
                sqlx::query(
                    "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at, id",
                )
                .bind(conversation_id),
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn record_usage(
        &mut self,
        conversation_id: ConversationId,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        total_tokens: i64,
    ) -> Result<TokenUsage> {
        let now = Utc::now();
        let result = self
            .execute(
                sqlx::query(
                    "INSERT INTO token_usage \
                     (conversation_id, model, prompt_tokens, completion_tokens, total_tokens, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(conversation_id)
                .bind(model)
                .bind(prompt_tokens)
                .bind(completion_tokens)
                .bind(total_tokens)
                .bind(now),
            )
            .await?;

        Ok(TokenUsage {
            id: result.last_insert_rowid(),
            conversation_id,
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            created_at: now,
        })
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            debug!("Committed {} writes", self.pending);
        }
        self.pending = 0;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.tx.is_some() {
            debug!("Rolling back {} uncommitted writes", self.pending);
        }
    }
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent> {
    Ok(Agent {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        system_prompt: row.try_get("system_prompt")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role: String = row.try_get("role")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: role.parse()?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

fn usage_from_row(row: &SqliteRow) -> Result<TokenUsage> {
    Ok(TokenUsage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        model: row.try_get("model")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        created_at: row.try_get("created_at")?,
    })
}

fn totals_from_row(row: &SqliteRow) -> Result<UsageTotals> {
    Ok(UsageTotals {
        requests: row.try_get("requests")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
    })
}
