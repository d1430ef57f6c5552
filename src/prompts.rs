//! Prompt templates for the five writer/reviewer call sites.
//!
//! - **Clarification**: system prompt instructing the writer to ask questions
//!   one at a time and answer with the structured readiness payload
//! - **Snapshot**: condense the clarification transcript into requirements
//! - **Draft**: produce specification version 1
//! - **Review**: critique the current draft against the snapshot
//! - **Revise**: fold one round's aggregated feedback into the next version

/// System prompt for the clarification conversation. The reply contract
/// matches `signals::parse_writer_reply`.
pub const CLARIFICATION_SYSTEM_PROMPT: &str = r#"You are a specification writer interviewing a user about an idea they want turned into a document.

Ask clarifying questions one at a time. Probe scope, audience, constraints,
and success criteria. Stop asking once the requirements are clear enough to
draft from.

Every reply MUST be a single JSON object, nothing else:

{
  "ready": <true when requirements are clear enough to proceed, else false>,
  "message": "<your next question, or a short summary of what you understood>",
  "notes": "<optional working notes>"
}"#;

/// User-facing opener for the clarification conversation.
pub fn clarification_opening(idea: &str) -> String {
    format!("I want a specification written for the following idea:\n\n{idea}")
}

/// One writer call: transcript + idea -> requirements snapshot.
pub fn snapshot_prompt(idea: &str, transcript_text: &str) -> String {
    format!(
        "Condense the clarification conversation below into a requirements snapshot.\n\
         The snapshot replaces the conversation as the single statement of what the\n\
         user wants; make it self-contained, concrete, and free of open questions\n\
         that were answered.\n\n\
         # Idea\n\n{idea}\n\n\
         # Conversation\n\n{transcript_text}\n\n\
         Output only the snapshot in Markdown."
    )
}

/// One writer call: snapshot + idea + transcript -> draft version 1.
pub fn draft_prompt(idea: &str, snapshot: &str, transcript_text: &str) -> String {
    format!(
        "Write the first full draft of the document described below.\n\n\
         # Idea\n\n{idea}\n\n\
         # Requirements snapshot\n\n{snapshot}\n\n\
         # Clarification conversation (background only)\n\n{transcript_text}\n\n\
         Output only the draft in Markdown."
    )
}

/// One reviewer call: snapshot + current artifact. The transcript is never
/// forwarded here.
pub fn review_prompt(snapshot: &str, artifact: &str) -> String {
    format!(
        "You are an independent reviewer. Critique the draft below strictly against\n\
         the requirements snapshot: missing requirements, contradictions, unclear\n\
         sections, structural problems. Be specific and actionable; do not rewrite\n\
         the document.\n\n\
         # Requirements snapshot\n\n{snapshot}\n\n\
         # Current draft\n\n{artifact}\n\n\
         Output your findings in Markdown."
    )
}

/// One writer call: snapshot + current artifact + this round's aggregate.
pub fn revise_prompt(snapshot: &str, artifact: &str, feedback: &str) -> String {
    format!(
        "Revise the draft below, addressing the reviewer feedback while staying\n\
         faithful to the requirements snapshot. Apply every point you agree with;\n\
         where reviewers conflict, prefer the snapshot.\n\n\
         # Requirements snapshot\n\n{snapshot}\n\n\
         # Current draft\n\n{artifact}\n\n\
         # Reviewer feedback (this round)\n\n{feedback}\n\n\
         Output only the revised document in Markdown."
    )
}

/// Label one reviewer's section inside a round's aggregate bundle.
pub fn aggregate_section(model: &str, duration_ms: u64, feedback: &str) -> String {
    format!("## Reviewer: {model} ({duration_ms} ms)\n\n{feedback}\n")
}
