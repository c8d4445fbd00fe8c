//! Agent management

use chrono::Utc;
use tracing::info;

use crate::error::Error;
use crate::store::{Agent, AgentId, AgentPatch, Gateway, NewAgent, Store, DEFAULT_SYSTEM_PROMPT};
use crate::Result;

const MAX_NAME_CHARS: usize = 100;

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::invalid("Agent name cannot be empty or whitespace only"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(Error::invalid(format!(
            "Agent name must be at most {MAX_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

/// Creates, reads, updates and deletes agents.
#[derive(Clone)]
pub struct AgentService {
    store: Store,
}

impl AgentService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, input: NewAgent) -> Result<Agent> {
        let name = validate_name(&input.name)?;
        let system_prompt = input
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let mut session = self.store.session();
        let agent = session
            .insert_agent(&name, system_prompt, input.description.as_deref())
            .await?;
        session.commit().await?;

        info!(agent_id = agent.id, "Created agent {}", agent.name);
        Ok(agent)
    }

    /// All agents, newest first.
    pub async fn list(&self) -> Result<Vec<Agent>> {
        self.store.session().list_agents().await
    }

    pub async fn get(&self, id: AgentId) -> Result<Agent> {
        self.store
            .session()
            .get_agent(id)
            .await?
            .ok_or_else(|| Error::not_found("Agent", id))
    }

    /// Apply the fields present in `patch`.
    pub async fn update(&self, id: AgentId, patch: AgentPatch) -> Result<Agent> {
        let mut agent = self.get(id).await?;
        if patch.is_empty() {
            return Ok(agent);
        }

        if let Some(name) = patch.name.as_deref() {
            agent.name = validate_name(name)?;
        }
        if let Some(prompt) = patch.system_prompt {
            agent.system_prompt = prompt;
        }
        if let Some(description) = patch.description {
            agent.description = Some(description);
        }
        agent.updated_at = Utc::now();

        let mut session = self.store.session();
        let agent = session.update_agent(agent).await?;
        session.commit().await?;

        info!(agent_id = id, "Updated agent");
        Ok(agent)
    }

    /// Delete an agent along with its conversations and their messages.
    pub async fn delete(&self, id: AgentId) -> Result<()> {
        let mut session = self.store.session();
        if !session.delete_agent(id).await? {
            return Err(Error::not_found("Agent", id));
        }
        session.commit().await?;

        info!(agent_id = id, "Deleted agent");
        Ok(())
    }
}
