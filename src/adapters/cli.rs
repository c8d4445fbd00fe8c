//! CLI adapter — interactive chat over a single conversation.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use colored::*;

use crate::chat::MessageService;
use crate::store::{ConversationId, Message};
use crate::ui;
use crate::Result;

/// Read-eval-print loop bound to one conversation.
pub struct ChatRepl {
    messages: Arc<MessageService>,
    conversation_id: ConversationId,
}

impl ChatRepl {
    pub fn new(messages: Arc<MessageService>, conversation_id: ConversationId) -> Self {
        Self {
            messages,
            conversation_id,
        }
    }

    /// Send one message and return the assistant's reply.
    pub async fn run_once(&self, content: &str) -> Result<Message> {
        let exchange = self
            .messages
            .send_message(self.conversation_id, content)
            .await?;
        Ok(exchange.assistant)
    }

    /// Run the loop on stdin until EOF or an exit command.
    pub async fn run_interactive(&self) -> Result<()> {
        let stdin = io::stdin();
        self.run_with(|line| stdin.lock().read_line(line))
            .await
            .map(|_| ())
    }

    /// Drive the loop from `input`; returns how many messages were sent.
    pub async fn run_lines<R: BufRead>(&self, mut input: R) -> Result<usize> {
        self.run_with(|line| input.read_line(line)).await
    }

    /// Drive the loop with one `read_line` call per prompt.
    ///
    /// Nothing from `read_line` is held while a reply is awaited.
    pub async fn run_with<F>(&self, mut read_line: F) -> Result<usize>
    where
        F: FnMut(&mut String) -> io::Result<usize>,
    {
        let mut stdout = io::stdout();
        let mut sent = 0;

        loop {
            print!("\n{} ", "You:".blue().bold());
            stdout.flush()?;

            let mut line = String::new();
            if read_line(&mut line)? == 0 {
                break;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match line.to_lowercase().as_str() {
                "exit" | "quit" | "q" => {
                    println!("👋 Bye!");
                    break;
                }
                "/history" => {
                    self.print_history().await;
                    continue;
                }
                _ => {}
            }

            ui::print_thinking("Thinking");
            match self.run_once(line).await {
                Ok(reply) => {
                    sent += 1;
                    println!("\n{} {}", "Bot:".green().bold(), reply.content);
                }
                // The user message is kept even when the reply fails
                Err(e) => ui::print_error(&e.to_string()),
            }
        }

        Ok(sent)
    }

    async fn print_history(&self) {
        match self.messages.list_messages(self.conversation_id).await {
            Ok(history) if history.is_empty() => ui::print_step("No messages yet."),
            Ok(history) => history.iter().for_each(ui::print_message),
            Err(e) => ui::print_error(&e.to_string()),
        }
    }
}
