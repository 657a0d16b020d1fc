//! Conversation context assembly.
//!
//! An immutable text bundle describing what the student is working on,
//! computed once per `start()` and handed to the transport as session
//! configuration. Never mutated after connect.

/// Subject, note excerpts, and "what the student is currently viewing".
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub subject: String,
    pub notes: Vec<String>,
    pub viewing: Option<String>,
}

impl ConversationContext {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_viewing(mut self, viewing: impl Into<String>) -> Self {
        self.viewing = Some(viewing.into());
        self
    }

    /// Render the system instruction handed to the remote tutor.
    pub fn system_instruction(&self) -> String {
        let mut out = format!(
            "You are a patient, encouraging voice tutor helping a student study {}. \
             Keep answers short and conversational, and ask a quick check-in question \
             once a concept lands.",
            self.subject
        );
        if !self.notes.is_empty() {
            out.push_str("\n\nThe student's notes:\n");
            for note in &self.notes {
                out.push_str("- ");
                out.push_str(note);
                out.push('\n');
            }
        }
        if let Some(viewing) = &self.viewing {
            out.push_str("\nThe student is currently looking at: ");
            out.push_str(viewing);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_includes_all_sections() {
        let context = ConversationContext::new("organic chemistry")
            .with_notes(vec!["SN1 vs SN2".to_string(), "Markovnikov's rule".to_string()])
            .with_viewing("reaction mechanism flowchart");
        let instruction = context.system_instruction();
        assert!(instruction.contains("organic chemistry"));
        assert!(instruction.contains("- SN1 vs SN2"));
        assert!(instruction.contains("Markovnikov's rule"));
        assert!(instruction.contains("currently looking at: reaction mechanism flowchart"));
    }

    #[test]
    fn instruction_omits_empty_sections() {
        let instruction = ConversationContext::new("algebra").system_instruction();
        assert!(!instruction.contains("notes"));
        assert!(!instruction.contains("currently looking at"));
    }
}
