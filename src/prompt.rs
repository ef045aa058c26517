//! Prompt formatting for a single conversation turn.

use crate::config::Identity;

/// Persona rules placed ahead of every turn.
pub fn system_prompt(assistant: &str) -> String {
    format!(
        "You are {assistant}, a helpful AI assistant. Follow these guidelines:\n\
         - Be concise yet thorough\n\
         - Use clear, simple language\n\
         - Format responses neatly with proper spacing\n\
         - If unsure, say \"I don't know\" rather than guessing\n\
         - For coding questions, provide complete examples\n\
         - Always maintain a helpful, professional tone"
    )
}

/// `<preamble>\n<user>: <message>\n<assistant>:`
pub fn format_turn(identity: &Identity, message: &str) -> String {
    format!(
        "{}\n{}: {}\n{}:",
        system_prompt(&identity.assistant),
        identity.user,
        message,
        identity.assistant
    )
}

/// Opening line of a new chat.
pub fn greeting(identity: &Identity) -> String {
    format!(
        "{}: Hello, {}! I'm here to assist you. How can I help you today?",
        identity.assistant, identity.user
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_turn_layout() {
        let identity = Identity::new("Ada", "Nova");
        let prompt = format_turn(&identity, "What is a KV cache?");

        assert!(prompt.starts_with("You are Nova, a helpful AI assistant."));
        assert!(prompt.ends_with("\nAda: What is a KV cache?\nNova:"));
        assert_eq!(prompt.lines().count(), 9);
    }

    #[test]
    fn test_preamble_has_no_indentation() {
        let preamble = system_prompt("Assistant");
        assert!(preamble.lines().all(|line| !line.starts_with(' ')));
        assert!(preamble.contains("say \"I don't know\" rather than guessing"));
    }

    #[test]
    fn test_greeting() {
        assert_eq!(
            greeting(&Identity::default()),
            "Assistant: Hello, User! I'm here to assist you. How can I help you today?"
        );
    }
}
