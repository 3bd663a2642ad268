//! Prompt text assembled into model requests.

pub const CHAT_SYSTEM_PROMPT: &str = "\
You are a customer support assistant. Answer using the provided context \
when it is relevant, be concise, and never invent order or account \
details. If you cannot help, or the customer explicitly asks for a \
person, call the request_human_support tool with a specific reason.";

pub const KNOWLEDGE_BANK_HEADER: &str = "Knowledge bank";
pub const PAST_CONVERSATIONS_HEADER: &str = "Past conversations";
pub const STYLE_EXAMPLES_HEADER: &str = "Style examples";

pub const SUBJECT_PROMPT: &str = "\
Generate a brief, clear subject line (max 50 chars) that summarizes the \
main point of these messages. Respond with only the subject line, no \
other text.";

pub const SUMMARY_PROMPT: &str = "\
Summarize this support conversation as at most three short bullet \
points, one per line, no markers. Cover the customer's problem, what was \
done, and anything still pending.";

/// Terminal text when the loop hits its iteration cap without resolving.
pub const FALLBACK_REPLY: &str =
    "Let me get a human to help with this. Someone from our team will follow up shortly.";

/// Returned without a model call when the conversation already belongs to
/// a human.
pub const HUMAN_PENDING_REPLY: &str =
    "Our support team will respond to your message shortly. Thank you for your patience.";

pub fn section(header: &str, entries: &[String]) -> String {
    let mut rendered = String::from(header);
    rendered.push('\n');
    rendered.push_str(&entries.join("\n\n"));
    rendered
}

#[cfg(test)]
mod tests {
    use super::section;

    #[test]
    fn section_renders_header_then_entries() {
        let rendered = section("Knowledge bank", &["first".to_string(), "second".to_string()]);
        assert_eq!(rendered, "Knowledge bank\nfirst\n\nsecond");
    }
}
