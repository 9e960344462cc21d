//! Grounded prompt construction.
//!
//! The instruction block is the only thing keeping the model from answering out of
//! its own training data, so both rules (context only, admit insufficient context)
//! must survive any edit to the template.

use crate::config::DEFAULT_ORGANIZATION;
use crate::models::RetrievedChunk;

const EMPTY_CONTEXT: &str = "(No relevant documents were found for this question.)";

#[derive(Debug, Clone)]
pub struct PromptComposer {
    organization: String,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new(DEFAULT_ORGANIZATION)
    }
}

impl PromptComposer {
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
        }
    }

    /// Deterministic: identical inputs always produce the identical prompt.
    pub fn compose(&self, question: &str, chunks: &[RetrievedChunk]) -> String {
        let org = &self.organization;
        let context = if chunks.is_empty() {
            EMPTY_CONTEXT.to_string()
        } else {
            format_context(chunks)
        };

        format!(
            "You are an AI assistant representing {org}.\n\
             Your role is to provide information about its work and mission based ONLY on the provided context.\n\
             \n\
             IMPORTANT INSTRUCTIONS:\n\
             1. When asked about yourself, respond as a representative of {org}.\n\
             2. Never mention that you are a language model or which company built you.\n\
             3. Only use information from the context below. Do not add outside knowledge.\n\
             4. If the context does not contain enough information to answer, say plainly that you do not have sufficient information to answer. Never guess.\n\
             5. If the question is not related to {org}, politely decline, state that you specialize in topics about {org}, and suggest asking about its work instead.\n\
             6. Keep responses professional, informative, and concise (3-5 sentences).\n\
             7. Use line breaks for readability.\n\
             \n\
             Context:\n\
             {context}\n\
             \n\
             Question: {question}\n\
             \n\
             Answer in a clear, professional manner:\n",
            question = question.trim(),
        )
    }
}

fn format_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "Document {}:\n{}\n[Source: {} | Score: {:.3}]",
                i + 1,
                chunk.text.trim(),
                chunk.source_id,
                chunk.score
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
