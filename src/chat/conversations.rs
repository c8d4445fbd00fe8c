//! Conversation management

use serde::Serialize;
use tracing::info;

use crate::error::Error;
use crate::store::{AgentId, Conversation, ConversationId, Gateway, Store};
use crate::Result;

const MAX_TITLE_CHARS: usize = 200;

/// A conversation together with how many messages it holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub message_count: i64,
}

#[derive(Clone)]
pub struct ConversationService {
    store: Store,
}

impl ConversationService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Start a conversation owned by `agent_id`. A blank title is dropped.
    pub async fn start(&self, agent_id: AgentId, title: Option<&str>) -> Result<Conversation> {
        let title = title.map(str::trim).filter(|t| !t.is_empty());
        if let Some(title) = title {
            if title.chars().count() > MAX_TITLE_CHARS {
                return Err(Error::invalid(format!(
                    "Conversation title must be at most {MAX_TITLE_CHARS} characters"
                )));
            }
        }

        let mut session = self.store.session();
        if session.get_agent(agent_id).await?.is_none() {
            return Err(Error::not_found("Agent", agent_id));
        }
        let conversation = session.insert_conversation(agent_id, title).await?;
        session.commit().await?;

        info!(
            conversation_id = conversation.id,
            agent_id, "Started conversation"
        );
        Ok(conversation)
    }

    /// Conversations of an agent, most recently updated first.
    pub async fn list_for_agent(&self, agent_id: AgentId) -> Result<Vec<ConversationSummary>> {
        let mut session = self.store.session();
        if session.get_agent(agent_id).await?.is_none() {
            return Err(Error::not_found("Agent", agent_id));
        }

        let conversations = session.list_conversations(agent_id).await?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let message_count = session.count_messages(conversation.id).await?;
            summaries.push(ConversationSummary {
                conversation,
                message_count,
            });
        }
        Ok(summaries)
    }

    pub async fn get(&self, id: ConversationId) -> Result<Conversation> {
        self.store
            .session()
            .get_conversation(id)
            .await?
            .ok_or_else(|| Error::not_found("Conversation", id))
    }

    /// Delete a conversation and its messages.
    pub async fn delete(&self, id: ConversationId) -> Result<()> {
        let mut session = self.store.session();
        if !session.delete_conversation(id).await? {
            return Err(Error::not_found("Conversation", id));
        }
        session.commit().await?;

        info!(conversation_id = id, "Deleted conversation");
        Ok(())
    }
}
