//! Instruction templates handed to the text generator.
//!
//! Every prompt states whether a textbook excerpt was found. Without one the
//! model is told explicitly to answer from general knowledge.

use crate::context::page_list;
use crate::models::PromptOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Explain,
    Note,
    Questions,
    AnswerExercise,
}

impl PromptKind {
    pub fn command(self) -> &'static str {
        match self {
            Self::Explain => "explain",
            Self::Note => "note",
            Self::Questions => "questions",
            Self::AnswerExercise => "answer",
        }
    }

    pub fn subject_label(self) -> &'static str {
        match self {
            Self::Explain => "concept",
            Self::Note | Self::Questions => "topic",
            Self::AnswerExercise => "exercise_query",
        }
    }

    pub fn usage(self) -> String {
        format!(
            "Invalid command format. Use: /{} [{}] [textbook_id]",
            self.command(),
            self.subject_label()
        )
    }
}

/// Where the excerpt came from, for the citation line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grounding {
    Pages(Vec<u32>),
    Exercise,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest<'a> {
    pub kind: PromptKind,
    pub subject: &'a str,
    pub textbook_id: &'a str,
    pub context: &'a str,
    pub grounding: Grounding,
}

impl PromptRequest<'_> {
    pub fn is_grounded(&self) -> bool {
        !self.context.trim().is_empty() && self.grounding != Grounding::None
    }

    /// Appended to the model's answer before it goes back to the user.
    pub fn reference_line(&self) -> String {
        match (&self.grounding, self.is_grounded()) {
            (Grounding::Pages(pages), true) => format!("(Pages: {})", page_list(pages)),
            (Grounding::Exercise, true) => format!("(Source: textbook '{}')", self.textbook_id),
            _ => "(Textbook page not found)".to_string(),
        }
    }
}

pub fn build_prompt(request: &PromptRequest<'_>, options: &PromptOptions) -> String {
    let audience = options.audience.as_str();
    let subject = request.subject;
    let textbook = request.textbook_id;

    let task = match request.kind {
        PromptKind::Explain => format!(
            "Explain the concept of '{subject}' in detail and comprehensively, suitable for {audience}."
        ),
        PromptKind::Note => format!(
            "Prepare a short, concise but comprehensive study note on the topic of '{subject}'. \
             Focus on key points and make it easy to understand for {audience}. \
             Limit the note to around 5-6 key points if possible."
        ),
        PromptKind::Questions => format!(
            "Write 5 practice questions on the topic of '{subject}' for {audience}, \
             mixing recall and reasoning questions, and give a short answer key after the questions."
        ),
        PromptKind::AnswerExercise => format!(
            "Answer the textbook exercise/question '{subject}' step by step, in a way that {audience} can follow."
        ),
    };

    if !request.is_grounded() {
        return format!(
            "{task}\n\nNo matching excerpt was found in the textbook '{textbook}'. \
             Answer from general knowledge instead, and do not claim to quote the textbook."
        );
    }

    let source = match &request.grounding {
        Grounding::Pages(pages) => format!(
            "the following excerpt from pages {} of the textbook '{textbook}'",
            page_list(pages)
        ),
        _ => format!("the following excerpt from the textbook '{textbook}'"),
    };

    format!(
        "{task}\n\nBase your answer on {source}. The excerpt was extracted automatically \
         and may contain layout noise.\n\n---\n{}\n---",
        request.context.trim_end()
    )
}
