//! Prompt recognition.
//!
//! cdb prints one of a few fixed prompts when it is idle. A prompt only counts
//! when it starts a line and nothing follows it yet.

use std::sync::LazyLock;

use regex::Regex;

static PROMPT_AT_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:\d+:\d+> |kd> |0: kd> |NoTarget> )\z").expect("prompt regex is valid")
});

/// Returns true when `buffer` ends in an idle debugger prompt.
pub fn ends_with_prompt(buffer: &str) -> bool {
    PROMPT_AT_END.is_match(buffer)
}
