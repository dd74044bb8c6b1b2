//! Helpers shared by every prompt the pipeline builds.

/// Special tokens a chat template could interpret as turn boundaries.
const CONTROL_TOKENS: &[&str] = &["<|im_start|>", "<|im_end|>", "<|endoftext|>", "<|eot_id|>"];

/// Remove chat-template control tokens from untrusted text (user queries,
/// document passages) before it is embedded in a prompt.
pub fn sanitize_for_prompt(text: &str) -> String {
    let mut out = text.to_string();
    for token in CONTROL_TOKENS {
        if out.contains(token) {
            out = out.replace(token, "");
        }
    }
    out
}

pub fn truncate_to_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Slice from the first `open` to the last `close`, if both exist in order.
/// Models routinely wrap JSON in prose or markdown fences.
pub fn extract_delimited(content: &str, open: char, close: char) -> Option<&str> {
    let start = content.find(open)?;
    let end = content.rfind(close)?;
    (end > start).then(|| &content[start..=end])
}
