//! Wire-format rendering for the per-PR review comment (spec.md §6):
//! one `<details>` block per application, and length-aware splitting
//! that never leaves an unbalanced code fence in any segment.

use crate::types::{CheckResult, Message, State};

/// Renders one application's `<details>` block. `checkSummary` is the
/// check's own summary line; `checkDetails` is its full body.
pub fn render_app_block(app_name: &str, results: &[CheckResult]) -> String {
    let state = results
        .iter()
        .filter(|r| r.counts_toward_aggregate())
        .map(|r| r.state)
        .max()
        .unwrap_or(State::None);

    let mut out = format!("## Application Checks: `{app_name}` {}\n", state.to_emoji());
    for r in results {
        out.push_str(&format!(
            "<details><summary>{} {} {}</summary>\n\n{}\n\n</details>\n",
            r.summary,
            r.state.to_word(),
            r.state.to_emoji(),
            r.details
        ));
    }
    out
}

/// Renders the full comment body: one block per non-deleted app, apps
/// sorted by name for a stable diff between successive updates.
pub fn render_full(message: &Message) -> String {
    let mut names: Vec<&String> = message
        .apps
        .keys()
        .filter(|n| !message.deleted.contains(*n))
        .collect();
    names.sort();

    let mut out = String::new();
    for name in names {
        if let Some(results) = message.apps.get(name) {
            out.push_str(&render_app_block(name, results));
            out.push('\n');
        }
    }
    out
}

const CONTINUATION_MARKER: &str = "> Continued from previous comment";

/// Splits `body` into segments no longer than `max_len`, preserving
/// code-fence balance: a split point that falls inside a ```` ```lang ````
/// block closes the fence before the split and reopens it with the same
/// language on the next segment. Each continuation segment is prefixed
/// with `CONTINUATION_MARKER` and a link to the first comment.
pub fn split_preserving_fences(body: &str, max_len: usize, first_comment_url: &str) -> Vec<String> {
    if body.len() <= max_len {
        return vec![body.to_string()];
    }

    let continuation_header = |url: &str| format!("{CONTINUATION_MARKER} ({url})\n\n");

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut open_fence: Option<String> = None;
    let mut is_first_segment = true;

    let finalize = |current: &mut String, open_fence: &Option<String>| {
        if open_fence.is_some() {
            current.push_str("```\n");
        }
    };

    let reopen = |open_fence: &Option<String>| -> String {
        match open_fence {
            Some(lang) => format!("```{lang}\n"),
            None => String::new(),
        }
    };

    for line in body.lines() {
        let trimmed = line.trim_start();
        let is_fence_line = trimmed.starts_with("```");

        let header_len = if is_first_segment {
            0
        } else {
            continuation_header(first_comment_url).len() + reopen(&open_fence).len()
        };

        if !current.is_empty() && header_len + current.len() + line.len() + 1 > max_len {
            finalize(&mut current, &open_fence);
            segments.push(std::mem::take(&mut current));
            is_first_segment = false;

            current.push_str(&continuation_header(first_comment_url));
            current.push_str(&reopen(&open_fence));
        }

        current.push_str(line);
        current.push('\n');

        if is_fence_line {
            if open_fence.is_some() {
                open_fence = None;
            } else {
                open_fence = Some(trimmed.trim_start_matches('`').trim().to_string());
            }
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

/// Whether every ```` ``` ```` fence in `segment` is balanced (an even
/// count of fence-opening lines).
pub fn fences_are_balanced(segment: &str) -> bool {
    segment.lines().filter(|l| l.trim_start().starts_with("```")).count() % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckResult;

    fn result(name: &str, state: State) -> CheckResult {
        CheckResult {
            check_name: name.into(),
            state,
            summary: format!("{name} summary"),
            details: format!("{name} details"),
            no_changes_detected: false,
        }
    }

    #[test]
    fn render_app_block_uses_max_state_emoji() {
        let block = render_app_block("app1", &[result("diff", State::Success), result("policy", State::Warning)]);
        assert!(block.starts_with("## Application Checks: `app1` ⚠️"));
        assert!(block.contains("diff summary"));
        assert!(block.contains("policy summary"));
    }

    #[test]
    fn short_body_is_not_split() {
        let segments = split_preserving_fences("hello world", 1000, "https://example.com/c/1");
        assert_eq!(segments, vec!["hello world".to_string()]);
    }

    #[test]
    fn split_inside_fence_is_rebalanced() {
        let mut body = String::new();
        body.push_str("intro line\n");
        body.push_str("```yaml\n");
        for i in 0..200 {
            body.push_str(&format!("line-{i}: value\n"));
        }
        body.push_str("```\n");
        body.push_str("outro line\n");

        let segments = split_preserving_fences(&body, 400, "https://example.com/c/1");
        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(fences_are_balanced(segment), "unbalanced segment: {segment}");
        }
        // continuation segments carry the marker and reopen the fence.
        assert!(segments[1].contains("> Continued from previous comment"));
    }

    #[test]
    fn all_split_segments_respect_fence_balance_regardless_of_length_budget() {
        let mut body = "```json\n".to_string();
        for i in 0..50 {
            body.push_str(&format!("\"k{i}\": \"v\",\n"));
        }
        body.push_str("```\n");

        for max_len in [50usize, 120, 300, 1000] {
            let segments = split_preserving_fences(&body, max_len, "https://example.com/c/1");
            for segment in &segments {
                assert!(fences_are_balanced(segment));
            }
        }
    }
}
