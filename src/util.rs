//! Shared utility functions.

/// Pull the structured JSON object out of an agent's raw stdout.
///
/// Headless CLI agents rarely print bare JSON: the payload usually arrives
/// wrapped in a ```` ```json ```` fence, preceded by prose, or followed by a
/// trailer. Fenced blocks are searched first (the fence marks the payload
/// unambiguously); only when no fence yields an object does brace-scanning
/// fall back to the whole text. Scanning is string-aware, so braces inside
/// JSON string values (a commit message, a shell command) don't unbalance
/// the match.
pub fn extract_json_object(raw: &str) -> Option<String> {
    for block in fenced_blocks(raw) {
        if let Some(object) = scan_object(block) {
            return Some(object);
        }
    }
    scan_object(raw)
}

/// Contents of every fenced code block, ignoring the info string (```json,
/// ```JSON, or plain ```).
fn fenced_blocks(raw: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        let Some(close) = body.find("```") else { break };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks
}

/// Find the first balanced top-level JSON object in `text`. Tracks string
/// literals and escapes so embedded braces are not counted.
fn scan_object(text: &str) -> Option<String> {
    let open = text.find('{')?;
    let mut nesting = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[open..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => nesting += 1,
            '}' if !in_string => {
                nesting -= 1;
                if nesting == 0 {
                    return Some(text[open..open + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
