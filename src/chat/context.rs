//! Context builder for completion requests.
//!
//! Turns an agent's system prompt and a conversation's stored history into
//! the role/content sequence sent to the model. Pure: no I/O, no clock.

use crate::store::Message;

use super::llm::ChatMessage;

/// Build the completion context.
///
/// A leading `system` entry is emitted only for a non-empty prompt; every
/// stored message follows verbatim, in stored order.
pub fn build_context(system_prompt: Option<&str>, history: &[Message]) -> Vec<ChatMessage> {
    let prompt = system_prompt.filter(|p| !p.is_empty());

    let mut context = Vec::with_capacity(history.len() + usize::from(prompt.is_some()));

    if let Some(prompt) = prompt {
        context.push(ChatMessage::system(prompt));
    }

    context.extend(
        history
            .iter()
            .map(|m| ChatMessage::new(m.role, m.content.clone())),
    );

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;
    use chrono::Utc;

    fn stored(id: i64, role: Role, content: &str) -> Message {
        Message {
            id,
            conversation_id: 1,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_terse_agent_first_turn() {
        let history = [stored(1, Role::User, "Hi")];
        let context = build_context(Some("You are terse."), &history);

        assert_eq!(
            context,
            vec![
                ChatMessage::new(Role::System, "You are terse."),
                ChatMessage::new(Role::User, "Hi"),
            ]
        );
    }

    #[test]
    fn test_prompt_adds_exactly_one_entry() {
        let history: Vec<Message> = (0..5)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                stored(i, role, &format!("turn {i}"))
            })
            .collect();

        let with_prompt = build_context(Some("persona"), &history);
        assert_eq!(with_prompt.len(), history.len() + 1);

        for (entry, message) in with_prompt[1..].iter().zip(&history) {
            assert_eq!(entry.role, message.role);
            assert_eq!(entry.content, message.content);
        }
    }

    #[test]
    fn test_empty_prompt_is_omitted() {
        let history = [stored(1, Role::User, "Hi"), stored(2, Role::Assistant, "Hello")];

        for prompt in [None, Some("")] {
            let context = build_context(prompt, &history);
            assert_eq!(context.len(), 2);
            assert!(context.iter().all(|m| m.role != Role::System));
        }
    }

    #[test]
    fn test_stored_system_messages_pass_through() {
        let history = [stored(1, Role::System, "be brief"), stored(2, Role::User, "Hi")];
        let context = build_context(None, &history);
        assert_eq!(context[0], ChatMessage::new(Role::System, "be brief"));
    }

    #[test]
    fn test_building_twice_is_identical() {
        let history = [stored(1, Role::User, "Hi")];
        assert_eq!(
            build_context(Some("p"), &history),
            build_context(Some("p"), &history)
        );
    }
}
