//! Fitting a conversation into the model's context window.
//!
//! [`PromptWindowBuilder`] turns the retained chat history plus the new user
//! turn into a single prompt string whose token count stays within
//! `context_size - reserved`, where `reserved` is kept free for the generated
//! answer.
//!
//! Two strategies exist, chosen by the engine's capabilities:
//!
//! - **Template**: the engine has a native chat template. The whole
//!   conversation is templated and counted; the oldest message is dropped
//!   until it fits. If the new turn alone does not fit, the request fails with
//!   [`Error::PromptTooLarge`].
//! - **Header**: the new turn is formatted with role headers and older turns
//!   are prepended newest-first while the count stays under the budget. The
//!   first turn that would overflow ends the walk. This strategy never fails
//!   on size.

use crate::engine::GenerationEngine;
use quill_core::{
    Error, Result,
    protocol::{ChatMessage, Role},
};

pub const ASSISTANT_HEADER: &str = "<|start_header_id|>assistant<|end_header_id|>";

/// Token budget of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    pub context_size: usize,
    /// Tokens kept free for generation.
    pub reserved: usize,
}

impl ContextWindow {
    pub const fn budget(&self) -> usize {
        self.context_size.saturating_sub(self.reserved)
    }
}

pub fn format_turn(role: Role, content: &str) -> String {
    format!(
        "<|start_header_id|>{}<|end_header_id|>{content}<|eot_id|>\n",
        role.as_str()
    )
}

pub struct PromptWindowBuilder<'a, E: ?Sized> {
    engine: &'a E,
    window: ContextWindow,
}

impl<'a, E: GenerationEngine + ?Sized> PromptWindowBuilder<'a, E> {
    pub const fn new(engine: &'a E, window: ContextWindow) -> Self {
        Self { engine, window }
    }

    /// Build the prompt for `content` following `history` (oldest first).
    pub fn build(&self, history: &[ChatMessage], content: &str) -> Result<String> {
        if self.engine.has_chat_template() {
            self.build_templated(history, content)
        } else {
            self.build_with_headers(history, content)
        }
    }

    fn build_templated(&self, history: &[ChatMessage], content: &str) -> Result<String> {
        let budget = self.window.budget();
        let mut messages: Vec<ChatMessage> = history.to_vec();
        messages.push(ChatMessage::user(content));

        loop {
            let prompt = self.engine.apply_template(&messages)?;
            let tokens = self.engine.token_count(&prompt)?;
            if tokens <= budget {
                return Ok(prompt);
            }
            if messages.len() == 1 {
                return Err(Error::PromptTooLarge { tokens, budget });
            }
            messages.remove(0);
        }
    }

    fn build_with_headers(&self, history: &[ChatMessage], content: &str) -> Result<String> {
        let budget = self.window.budget();
        let mut prompt = format_turn(Role::User, content);
        prompt.push_str(ASSISTANT_HEADER);

        for message in history.iter().rev() {
            let candidate = format!("{}{prompt}", format_turn(message.role, &message.content));
            if self.engine.token_count(&candidate)? >= budget {
                break;
            }
            prompt = candidate;
        }

        Ok(prompt)
    }
}
