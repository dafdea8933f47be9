use crate::SessionConfig;

const DEFAULT_TOOL_OUTPUT_LIMIT: usize = 20_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncationMode {
    HeadTail,
    Tail,
}

pub fn default_truncation_mode_for_tool(tool_name: &str) -> TruncationMode {
    match tool_name {
        "grep_search" | "glob" | "edit_file" | "write_file" => TruncationMode::Tail,
        _ => TruncationMode::HeadTail,
    }
}

pub fn truncate_tool_output(output: &str, tool_name: &str, config: &SessionConfig) -> String {
    let max_chars = config
        .tool_output_limits
        .get(tool_name)
        .copied()
        .unwrap_or(DEFAULT_TOOL_OUTPUT_LIMIT);
    truncate_chars(output, max_chars, default_truncation_mode_for_tool(tool_name))
}

pub fn truncate_chars(output: &str, max_chars: usize, mode: TruncationMode) -> String {
    let char_count = output.chars().count();
    if char_count <= max_chars {
        return output.to_string();
    }

    let removed = char_count.saturating_sub(max_chars);
    match mode {
        TruncationMode::HeadTail => {
            let head = max_chars / 2;
            let tail = max_chars.saturating_sub(head);
            format!(
                "{}\n\n[output truncated: {} characters removed from the middle]\n\n{}",
                take_head(output, head),
                removed,
                take_tail(output, tail)
            )
        }
        TruncationMode::Tail => format!(
            "[output truncated: first {} characters removed]\n\n{}",
            removed,
            take_tail(output, max_chars)
        ),
    }
}

/// Keeps at most `max_bytes` of `bytes`, cutting on a char boundary.
pub fn truncate_utf8_lossy(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_bytes {
        return text.into_owned();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output capped at {} bytes]", &text[..end], max_bytes)
}

fn take_head(input: &str, char_count: usize) -> String {
    input.chars().take(char_count).collect()
}

fn take_tail(input: &str, char_count: usize) -> String {
    let total = input.chars().count();
    input
        .chars()
        .skip(total.saturating_sub(char_count))
        .collect()
}
