//! Prompts for the LLM-backed Structuring Adapter.
//!
//! Every prompt lives here so behaviour changes touch one file and tests can
//! inspect the text without a provider. Callers override the system prompt
//! via [`crate::config::ExtractionConfig::system_prompt`].

/// Default system prompt for turning one question block into JSON.
///
/// The `{option_keys}` placeholder is filled by [`structure_system_prompt`].
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You structure ONE multiple-choice exam question into JSON.

The user message contains the raw text of a single question, extracted from a PDF. It starts with the question marker (for example "QUESTÃO 07") and ends where the next question begins. Never use text from any other question.

Fields:

- "question": the label in the form "QUESTÃO XX" with a two-digit, zero-padded number.
- "image": true only if the text explicitly refers to a figure, chart, map or image. If the question cites a URL source and has no passage text, set true.
- "images": always an empty list; image files are attached by the caller.
- "passage_text": the reading passage that precedes the command, with "\n" between paragraphs. Empty string if there is none. Do NOT include the source reference here.
- "sources": references that appear directly in this question, at most 5.
  * For a URL, return two strings: the URL itself, then ONLY the access date ("13 out. 2023", not "Acesso em: 13 out. 2023"). Never return the raw "Disponível em: ..." sentence.
  * For books, articles and other references, return the complete reference as ONE string.
  * Empty list if there is no source.
- "statement": the command of the question (what the candidate must answer).
- "options": an object with exactly the keys {option_keys}, each mapped to the full option text without the letter prefix.
- "correct_option": one of {option_keys}, or "" if you cannot tell.

Output rules:
- Output ONLY the JSON object.
- Do NOT wrap it in ```json fences.
- Do NOT add explanations or comments.
- Transcribe text faithfully; fix only line-break hyphenation."#;

/// Extra instruction sent on a retry, after a failed or malformed reply.
pub const RESTATE_INSTRUCTION: &str = "Your previous reply could not be used. Reply again with a single JSON object that has exactly the fields question, image, images, passage_text, sources, statement, options and correct_option. No prose, no fences.";

/// System prompt with the allowed option keys substituted.
pub fn structure_system_prompt(option_keys: &[char]) -> String {
    DEFAULT_SYSTEM_PROMPT.replace("{option_keys}", &format_keys(option_keys))
}

/// User message carrying the question block and an optional answer hint.
pub fn structure_user_message(block_text: &str, answer_hint: Option<char>) -> String {
    match answer_hint {
        Some(key) => format!(
            "Question text:\n{block_text}\n\nAnswer key for this question: {key}"
        ),
        None => format!("Question text:\n{block_text}"),
    }
}

fn format_keys(keys: &[char]) -> String {
    keys.iter()
        .map(|k| format!("\"{k}\""))
        .collect::<Vec<_>>()
        .join(", ")
}
