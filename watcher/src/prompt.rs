//! Instruction prompt rendering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Render the text prompt sent alongside the frames.
///
/// # Panics
///
/// Panics if `instructions` is empty.
pub fn render_instructions(instructions: &[String]) -> String {
    assert!(
        !instructions.is_empty(),
        "Instructions must be a non-empty list"
    );

    let bullets = instructions
        .iter()
        .map(|i| format!("* {i}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "\nYou are given the following instructions: \n\
         {bullets}\n\n\
         If the instructions are violated, you should alert the user.\n\
         You should also recommend the awareness level based on the image.\n\
         Please generate a structured response in raw JSON format:\n\
         - should_alert (boolean)\n\
         - reasoning (string)\n\
         - recommended_awareness_level (Enum AwarenessLevel; one of: LOW, MEDIUM, HIGH)\n\
         Always respond in English, regardless of the content in the images.\n        "
    )
}

/// Prompts rendered so far, keyed by the exact instruction list.
///
/// Instruction lists are fixed for the life of a watcher, so the map holds
/// one entry per instruction in practice.
#[derive(Debug, Default)]
pub struct PromptCache {
    rendered: Mutex<HashMap<Vec<String>, Arc<str>>>,
}

impl PromptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instructions: &[String]) -> Arc<str> {
        let mut rendered = match self.rendered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prompt) = rendered.get(instructions) {
            return Arc::clone(prompt);
        }
        let prompt: Arc<str> = render_instructions(instructions).into();
        rendered.insert(instructions.to_vec(), Arc::clone(&prompt));
        prompt
    }

    pub fn len(&self) -> usize {
        self.rendered.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_instructions_become_bullets() {
        let prompt = render_instructions(&list(&["Stay in the crib", "No standing"]));
        assert!(prompt.starts_with("\nYou are given the following instructions: \n"));
        assert!(prompt.contains("* Stay in the crib\n* No standing\n\nIf the instructions"));
        assert!(prompt.contains("one of: LOW, MEDIUM, HIGH)\n"));
        assert!(prompt.ends_with("regardless of the content in the images.\n        "));
    }

    #[test]
    #[should_panic(expected = "Instructions must be a non-empty list")]
    fn test_empty_instructions_panic() {
        render_instructions(&[]);
    }

    #[test]
    fn test_cache_renders_once_per_list() {
        let cache = PromptCache::new();
        let a = list(&["Stay in the crib"]);
        let b = list(&["No climbing"]);

        let first = cache.get(&a);
        let again = cache.get(&a);
        assert!(Arc::ptr_eq(&first, &again));

        cache.get(&b);
        assert_eq!(cache.len(), 2);
    }
}
