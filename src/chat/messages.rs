//! Message pipeline - one user turn in, one assistant turn out
//!
//! Stages of a send: validate, persist and commit the user message, rebuild
//! the context from stored history, call the model, persist and commit the
//! reply. The user message is committed before the model is called so it
//! survives any upstream failure, and no store lock is held while waiting on
//! the network.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::context::build_context;
use super::llm::{ChatOptions, LlmClient};
use crate::error::Error;
use crate::store::{
    ConversationId, Gateway, Message, Role, Store, TokenUsage, DEFAULT_SYSTEM_PROMPT,
};
use crate::Result;

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exchange {
    pub user: Message,
    pub assistant: Message,
    pub usage: TokenUsage,
}

/// Where a send currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    PersistingUserMessage,
    BuildingContext,
    CallingLlm,
    PersistingAssistantMessage,
    Committed,
    Failed,
}

/// One send over a gateway, tracking its stage.
struct Turn<'a, G: Gateway + ?Sized> {
    gateway: &'a mut G,
    conversation_id: ConversationId,
    stage: Stage,
}

impl<'a, G: Gateway + ?Sized> Turn<'a, G> {
    fn new(gateway: &'a mut G, conversation_id: ConversationId) -> Self {
        Self {
            gateway,
            conversation_id,
            stage: Stage::Validating,
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug!(conversation_id = self.conversation_id, ?stage, "Send stage");
        self.stage = stage;
    }

    async fn run(
        &mut self,
        llm: &LlmClient,
        options: &ChatOptions,
        content: &str,
    ) -> Result<Exchange> {
        let id = self.conversation_id;

        if content.trim().is_empty() {
            return Err(Error::invalid(
                "Message content cannot be empty or whitespace only",
            ));
        }

        let conversation = self
            .gateway
            .get_conversation(id)
            .await?
            .ok_or_else(|| Error::not_found("Conversation", id))?;

        let system_prompt = match self.gateway.get_agent(conversation.agent_id).await? {
            Some(agent) => agent.system_prompt,
            None => {
                warn!(
                    conversation_id = id,
                    agent_id = conversation.agent_id,
                    "Conversation has no agent, using default prompt"
                );
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
        };

        self.enter(Stage::PersistingUserMessage);
        let user = self.gateway.create_message(id, Role::User, content).await?;
        self.gateway.commit().await?;

        self.enter(Stage::BuildingContext);
        let history = self.gateway.list_messages(id).await?;
        let context = build_context(Some(&system_prompt), &history);

        self.enter(Stage::CallingLlm);
        let reply = llm.chat(&context, options).await?;
        info!(
            conversation_id = id,
            model = llm.model(),
            prompt_tokens = reply.usage.prompt_tokens,
            completion_tokens = reply.usage.completion_tokens,
            total_tokens = reply.usage.total_tokens,
            "Assistant replied"
        );

        self.enter(Stage::PersistingAssistantMessage);
        let assistant = self
            .gateway
            .create_message(id, Role::Assistant, &reply.content)
            .await?;
        let usage = self
            .gateway
            .record_usage(
                id,
                llm.model(),
                tokens(reply.usage.prompt_tokens),
                tokens(reply.usage.completion_tokens),
                tokens(reply.usage.total_tokens),
            )
            .await?;
        self.gateway.commit().await?;

        self.enter(Stage::Committed);
        Ok(Exchange {
            user,
            assistant,
            usage,
        })
    }
}

fn tokens(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Sends messages and reads conversation history.
pub struct MessageService {
    store: Store,
    llm: Arc<LlmClient>,
    options: ChatOptions,
    /// One lock per conversation with a send in flight
    turns: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl MessageService {
    pub fn new(store: Store, llm: Arc<LlmClient>) -> Self {
        Self {
            store,
            llm,
            options: ChatOptions::default(),
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Send `content` as the user and return both stored messages with the
    /// usage recorded for the reply.
    ///
    /// Sends to the same conversation run one at a time, in call order.
    /// On an LLM failure the user message stays stored and the LLM error is
    /// returned unchanged.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Exchange> {
        let lock = self.turn_lock(conversation_id).await;

        let result = {
            let _guard = lock.lock().await;
            let mut session = self.store.session();
            let mut turn = Turn::new(&mut session, conversation_id);

            let result = turn.run(&self.llm, &self.options, content).await;
            if let Err(e) = &result {
                warn!(
                    conversation_id,
                    stage = ?turn.stage,
                    "Send failed: {}", e
                );
                turn.enter(Stage::Failed);
            }
            result
        };

        self.release_turn(conversation_id, lock).await;
        result
    }

    /// History of a conversation, oldest first.
    pub async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let mut session = self.store.session();
        if session.get_conversation(conversation_id).await?.is_none() {
            return Err(Error::not_found("Conversation", conversation_id));
        }
        session.list_messages(conversation_id).await
    }

    async fn turn_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        let mut turns = self.turns.lock().await;
        turns.entry(conversation_id).or_default().clone()
    }

    async fn release_turn(&self, conversation_id: ConversationId, lock: Arc<Mutex<()>>) {
        let mut turns = self.turns.lock().await;
        // Only the map and this handle remain: nobody is queued behind us
        if Arc::strong_count(&lock) == 2 {
            turns.remove(&conversation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::llm::{ChatMessage, ChatTransport, ScriptedTransport, TransportFailure};
    use crate::chat::llm::{TransportRequest, TransportResponse};
    use crate::config::LlmConfig;
    use crate::error::{LlmError, StatusCategory};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixture {
        store: Store,
        conversation_id: ConversationId,
    }

    async fn fixture() -> Fixture {
        let store = Store::in_memory().await.unwrap();
        let mut session = store.session();
        let agent = session
            .insert_agent("Terse", "You are terse.", None)
            .await
            .unwrap();
        let conversation = session.insert_conversation(agent.id, None).await.unwrap();
        session.commit().await.unwrap();
        Fixture {
            store,
            conversation_id: conversation.id,
        }
    }

    fn service(store: &Store, transport: Arc<dyn ChatTransport>, max_retries: u32) -> MessageService {
        let config = LlmConfig::new("http://llm.test/v1", "test-model")
            .with_retries(max_retries, Duration::ZERO);
        MessageService::new(store.clone(), Arc::new(LlmClient::new(config, transport)))
    }

    #[tokio::test]
    async fn test_send_persists_user_then_assistant() {
        let fx = fixture().await;
        let body = r#"{"choices":[{"message":{"content":"Hello!"}}],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::status(200, body)]);
        let svc = service(&fx.store, transport.clone(), 2);

        let Exchange {
            user,
            assistant,
            usage,
        } = svc.send_message(fx.conversation_id, "Hi").await.unwrap();

        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "Hi");
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.content, "Hello!");
        assert!(assistant.id > user.id);

        assert_eq!(usage.conversation_id, fx.conversation_id);
        assert_eq!(usage.model, "test-model");
        assert_eq!(
            (usage.prompt_tokens, usage.completion_tokens, usage.total_tokens),
            (5, 2, 7)
        );
        let recorded = fx
            .store
            .session()
            .usage_for_conversation(fx.conversation_id)
            .await
            .unwrap();
        assert_eq!(recorded, vec![usage]);

        let stored = svc.list_messages(fx.conversation_id).await.unwrap();
        assert_eq!(stored, vec![user, assistant]);

        assert_eq!(
            transport.sent_messages(0),
            vec![
                ChatMessage::new(Role::System, "You are terse."),
                ChatMessage::new(Role::User, "Hi"),
            ]
        );
    }

    #[tokio::test]
    async fn test_blank_content_rejected_before_any_write() {
        let fx = fixture().await;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::reply("unused")]);
        let svc = service(&fx.store, transport.clone(), 2);

        for content in ["", "   ", "\n\t "] {
            let err = svc.send_message(fx.conversation_id, content).await.unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{content:?}");
            assert_eq!(err.category(), StatusCategory::InvalidInput);
        }

        assert_eq!(transport.attempts(), 0);
        assert!(svc.list_messages(fx.conversation_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_not_found() {
        let fx = fixture().await;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::reply("unused")]);
        let svc = service(&fx.store, transport.clone(), 2);

        let err = svc.send_message(404, "Hi").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(transport.attempts(), 0);

        let err = svc.list_messages(404).await.unwrap_err();
        assert_eq!(err.category(), StatusCategory::NotFound);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_user_message() {
        let fx = fixture().await;
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::status(503, "busy"),
            ScriptedTransport::status(503, "busy"),
            ScriptedTransport::status(503, "busy"),
        ]);
        let svc = service(&fx.store, transport.clone(), 2);

        let err = svc.send_message(fx.conversation_id, "Hi").await.unwrap_err();

        assert_eq!(transport.attempts(), 3);
        assert!(matches!(err, Error::Llm(LlmError::Upstream { status: 503, .. })));
        assert_eq!(err.category(), StatusCategory::UpstreamUnavailable);

        let stored = svc.list_messages(fx.conversation_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(stored[0].content, "Hi");

        let totals = fx
            .store
            .session()
            .usage_totals_for_conversation(fx.conversation_id)
            .await
            .unwrap();
        assert_eq!(totals.requests, 0);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_gateway_timeout() {
        let fx = fixture().await;
        let transport = ScriptedTransport::new(vec![Err(TransportFailure::TimedOut)]);
        let svc = service(&fx.store, transport.clone(), 3);

        let err = svc.send_message(fx.conversation_id, "Hi").await.unwrap_err();

        assert_eq!(err.category(), StatusCategory::UpstreamTimeout);
        assert_eq!(transport.attempts(), 1);
        let stored = svc.list_messages(fx.conversation_id).await.unwrap();
        assert!(stored.iter().all(|m| m.role == Role::User));
    }

    #[tokio::test]
    async fn test_follow_up_carries_full_history() {
        let fx = fixture().await;
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::reply("First answer"),
            ScriptedTransport::reply("Second answer"),
        ]);
        let svc = service(&fx.store, transport.clone(), 0);

        svc.send_message(fx.conversation_id, "First").await.unwrap();
        svc.send_message(fx.conversation_id, "Second").await.unwrap();

        assert_eq!(
            transport.sent_messages(1),
            vec![
                ChatMessage::new(Role::System, "You are terse."),
                ChatMessage::new(Role::User, "First"),
                ChatMessage::new(Role::Assistant, "First answer"),
                ChatMessage::new(Role::User, "Second"),
            ]
        );
        assert_eq!(svc.list_messages(fx.conversation_id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_missing_agent_uses_default_prompt() {
        let store = Store::in_memory().await.unwrap();
        store.allow_orphans().await.unwrap();
        let mut session = store.session();
        let orphan = session.insert_conversation(999, None).await.unwrap();
        session.commit().await.unwrap();

        let transport = ScriptedTransport::new(vec![ScriptedTransport::reply("ok")]);
        let svc = service(&store, transport.clone(), 0);
        svc.send_message(orphan.id, "Hi").await.unwrap();

        assert_eq!(transport.sent_messages(0)[0], ChatMessage::system(DEFAULT_SYSTEM_PROMPT));
    }

    /// Counts committed messages from a separate session while the call is in flight.
    struct PeekingTransport {
        store: Store,
        conversation_id: ConversationId,
        seen: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ChatTransport for PeekingTransport {
        async fn send(
            &self,
            _request: &TransportRequest,
        ) -> std::result::Result<TransportResponse, TransportFailure> {
            let visible = self
                .store
                .session()
                .list_messages(self.conversation_id)
                .await
                .unwrap()
                .len();
            self.seen.lock().unwrap().push(visible);
            ScriptedTransport::reply("done")
        }
    }

    #[tokio::test]
    async fn test_user_message_committed_before_llm_call() {
        let fx = fixture().await;
        let transport = Arc::new(PeekingTransport {
            store: fx.store.clone(),
            conversation_id: fx.conversation_id,
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let svc = service(&fx.store, transport.clone(), 0);

        svc.send_message(fx.conversation_id, "Hi").await.unwrap();

        assert_eq!(*transport.seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_concurrent_sends_to_one_conversation_alternate() {
        let fx = fixture().await;
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::reply("a1"),
            ScriptedTransport::reply("a2"),
            ScriptedTransport::reply("a3"),
        ]);
        let svc = Arc::new(service(&fx.store, transport.clone(), 0));

        let handles: Vec<_> = ["q1", "q2", "q3"]
            .into_iter()
            .map(|q| {
                let svc = svc.clone();
                let id = fx.conversation_id;
                tokio::spawn(async move { svc.send_message(id, q).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let roles: Vec<Role> = svc
            .list_messages(fx.conversation_id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            [Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert!(svc.turns.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_listing_is_idempotent() {
        let fx = fixture().await;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::reply("ok")]);
        let svc = service(&fx.store, transport, 0);
        svc.send_message(fx.conversation_id, "Hi").await.unwrap();

        let first = svc.list_messages(fx.conversation_id).await.unwrap();
        let second = svc.list_messages(fx.conversation_id).await.unwrap();
        assert_eq!(first, second);
    }
}
