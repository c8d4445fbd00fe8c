//! Token usage reporting

use serde::Serialize;

use crate::error::Error;
use crate::store::{AgentId, ConversationId, Gateway, Store, TokenUsage, UsageTotals};
use crate::Result;

/// Everything recorded about the token spend of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationUsage {
    pub conversation_id: ConversationId,
    pub title: Option<String>,
    pub message_count: i64,
    pub totals: UsageTotals,
    pub records: Vec<TokenUsage>,
}

#[derive(Clone)]
pub struct UsageService {
    store: Store,
}

impl UsageService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Per-reply records of a conversation, oldest first, with their sum.
    pub async fn for_conversation(&self, id: ConversationId) -> Result<ConversationUsage> {
        let mut session = self.store.session();
        let conversation = session
            .get_conversation(id)
            .await?
            .ok_or_else(|| Error::not_found("Conversation", id))?;

        Ok(ConversationUsage {
            conversation_id: id,
            title: conversation.title,
            message_count: session.count_messages(id).await?,
            totals: session.usage_totals_for_conversation(id).await?,
            records: session.usage_for_conversation(id).await?,
        })
    }

    /// Usage summed over every conversation of an agent.
    pub async fn total_for_agent(&self, agent_id: AgentId) -> Result<UsageTotals> {
        let mut session = self.store.session();
        if session.get_agent(agent_id).await?.is_none() {
            return Err(Error::not_found("Agent", agent_id));
        }
        session.usage_totals_for_agent(agent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ConversationService;
    use crate::error::StatusCategory;
    use crate::store::Role;

    struct Seeded {
        store: Store,
        agent_id: AgentId,
        first: ConversationId,
        second: ConversationId,
    }

    async fn seeded() -> Seeded {
        let store = Store::in_memory().await.unwrap();
        let mut session = store.session();
        let agent = session.insert_agent("Counter", "Count.", None).await.unwrap();
        let first = session
            .insert_conversation(agent.id, Some("first"))
            .await
            .unwrap();
        let second = session.insert_conversation(agent.id, None).await.unwrap();

        session.create_message(first.id, Role::User, "q").await.unwrap();
        session.create_message(first.id, Role::Assistant, "a").await.unwrap();
        session.record_usage(first.id, "gpt-test", 10, 4, 14).await.unwrap();
        session.record_usage(first.id, "gpt-test", 20, 6, 26).await.unwrap();
        session.record_usage(second.id, "gpt-test", 3, 1, 4).await.unwrap();
        session.commit().await.unwrap();

        Seeded {
            store,
            agent_id: agent.id,
            first: first.id,
            second: second.id,
        }
    }

    #[tokio::test]
    async fn test_conversation_report_sums_its_records() {
        let seeded = seeded().await;
        let svc = UsageService::new(seeded.store.clone());

        let report = svc.for_conversation(seeded.first).await.unwrap();

        assert_eq!(report.title.as_deref(), Some("first"));
        assert_eq!(report.message_count, 2);
        assert_eq!(
            report.totals,
            UsageTotals {
                requests: 2,
                prompt_tokens: 30,
                completion_tokens: 10,
                total_tokens: 40,
            }
        );
        let per_reply: Vec<i64> = report.records.iter().map(|r| r.total_tokens).collect();
        assert_eq!(per_reply, vec![14, 26]);
    }

    #[tokio::test]
    async fn test_agent_total_spans_conversations() {
        let seeded = seeded().await;
        let svc = UsageService::new(seeded.store.clone());

        let totals = svc.total_for_agent(seeded.agent_id).await.unwrap();
        assert_eq!(totals.requests, 3);
        assert_eq!(totals.total_tokens, 44);
    }

    #[tokio::test]
    async fn test_deleting_conversation_drops_its_usage() {
        let seeded = seeded().await;
        let svc = UsageService::new(seeded.store.clone());

        ConversationService::new(seeded.store.clone())
            .delete(seeded.first)
            .await
            .unwrap();

        let totals = svc.total_for_agent(seeded.agent_id).await.unwrap();
        assert_eq!(totals.requests, 1);
        assert_eq!(totals.total_tokens, 4);
        assert_eq!(svc.for_conversation(seeded.second).await.unwrap().records.len(), 1);

        let err = svc.for_conversation(seeded.first).await.unwrap_err();
        assert_eq!(err.category(), StatusCategory::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let seeded = seeded().await;
        let svc = UsageService::new(seeded.store);

        assert!(matches!(svc.total_for_agent(77).await, Err(Error::NotFound(_))));
    }
}
