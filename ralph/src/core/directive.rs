//! Human-in-the-loop control directives.

/// A classified operator input, applied at an iteration boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Empty input: continue as planned.
    Proceed,
    /// Clear stagnation, observations and the dedup cache.
    Reset,
    /// Clear the current task pointer.
    Replan,
    /// Mark the current task skipped.
    Skip,
    /// Empty the conversation, keep the run state.
    Clear,
    /// Stop before the next model call.
    Quit,
    /// Repetition complaint: implicit reset plus the operator's text.
    Frustrated(String),
    /// Free text forwarded to the model as a user directive.
    Say(String),
}

const QUIT_WORDS: &[&str] = &["quit", "exit", "stop", "/quit", "/exit", "/stop"];

const FRUSTRATION_PHRASES: &[&str] = &[
    "don't repeat",
    "dont repeat",
    "stop repeating",
    "you already said",
    "you already did",
    "repeating yourself",
    "redundant",
    "same thing again",
];

/// Map raw operator input to a directive.
pub fn classify(input: &str) -> Directive {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Directive::Proceed;
    }
    let lower = trimmed.to_lowercase();
    if QUIT_WORDS.contains(&lower.as_str()) {
        return Directive::Quit;
    }
    match lower.as_str() {
        "/reset" => return Directive::Reset,
        "/replan" => return Directive::Replan,
        "/skip" => return Directive::Skip,
        "/clear" => return Directive::Clear,
        _ => {}
    }
    if FRUSTRATION_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return Directive::Frustrated(trimmed.to_string());
    }
    Directive::Say(trimmed.to_string())
}

impl Directive {
    /// Text injected into the next user turn, if any.
    pub fn prompt_note(&self) -> Option<String> {
        match self {
            Self::Proceed | Self::Quit => None,
            Self::Reset => Some(
                "The operator reset your loop state. Re-read the plan and continue with a fresh approach."
                    .to_string(),
            ),
            Self::Replan => Some(
                "The operator cleared the current task. Review the plan and choose the next task."
                    .to_string(),
            ),
            Self::Skip => Some(
                "The operator skipped the current task. Move on to the next pending task.".to_string(),
            ),
            Self::Clear => Some(
                "The conversation was cleared. Rely on the state summary below.".to_string(),
            ),
            Self::Frustrated(text) => Some(format!(
                "### USER DIRECTIVE ###\nThe operator says you are repeating yourself: \"{text}\"\nDo something different from your recent actions.\n######################"
            )),
            Self::Say(text) => Some(format!(
                "### USER DIRECTIVE ###\n{text}\n######################"
            )),
        }
    }
}
