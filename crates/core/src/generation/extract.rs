//! Code and hyperparameter extraction from generated text.
//!
//! Models answer in markdown:
//! ````text
//! ```python
//! class Net(nn.Module): ...
//! ```
//! ```json
//! {"lr": 0.01, "momentum": 0.9}
//! ```
//! ````
//!
//! Code is the first fence tagged `python`/`py` or untagged. Hyperparameters
//! are the first `json` fence, else the first flat `{...}` outside fences.

use regex::Regex;
use std::sync::LazyLock;

// Opening fence with optional language tag, body up to the closing fence
static FENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n(.*?)```")
        .expect("FENCE_REGEX pattern is invalid - this is a build-time error")
});

// Innermost object without nested braces
static FLAT_OBJECT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{[^{}]*\}").expect("FLAT_OBJECT_REGEX pattern is invalid - this is a build-time error")
});

fn fences(text: &str) -> impl Iterator<Item = (String, &str)> {
    FENCE_REGEX.captures_iter(text).filter_map(|cap| {
        let tag = cap.get(1)?.as_str().to_ascii_lowercase();
        let body = cap.get(2)?.as_str().trim();
        Some((tag, body))
    })
}

/// First Python (or untagged) code block.
pub fn extract_code(text: &str) -> Option<String> {
    fences(text)
        .find(|(tag, body)| matches!(tag.as_str(), "python" | "py" | "") && !body.is_empty())
        .map(|(_, body)| body.to_string())
}

/// Hyperparameter object text, not yet validated as JSON.
pub fn extract_hyperparameters(text: &str) -> Option<String> {
    if let Some((_, body)) = fences(text).find(|(tag, body)| tag == "json" && !body.is_empty()) {
        return Some(body.to_string());
    }
    let prose = FENCE_REGEX.replace_all(text, "");
    FLAT_OBJECT_REGEX
        .find(&prose)
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "Here you go.\n```python\nimport torch\nclass Net:\n    pass\n```\n\
                        ```json\n{\"lr\": 0.01}\n```\n";

    #[test]
    fn extracts_python_and_json_fences() {
        assert_eq!(
            extract_code(GOOD).as_deref(),
            Some("import torch\nclass Net:\n    pass")
        );
        assert_eq!(extract_hyperparameters(GOOD).as_deref(), Some("{\"lr\": 0.01}"));
    }

    #[test]
    fn untagged_fence_counts_as_code() {
        let text = "```\nx = 1\n```";
        assert_eq!(extract_code(text).as_deref(), Some("x = 1"));
    }

    #[test]
    fn skips_non_python_fences_for_code() {
        let text = "```bash\npip install torch\n```\n```py\nprint(1)\n```";
        assert_eq!(extract_code(text).as_deref(), Some("print(1)"));
    }

    #[test]
    fn inline_object_outside_fences() {
        let text = "```python\nd = {'inside': 1}\n```\nUse {'lr': 0.1, 'batch': 64} for training.";
        assert_eq!(
            extract_hyperparameters(text).as_deref(),
            Some("{'lr': 0.1, 'batch': 64}")
        );
    }

    #[test]
    fn nothing_to_extract() {
        let text = "I cannot help with that.";
        assert_eq!(extract_code(text), None);
        assert_eq!(extract_hyperparameters(text), None);
    }

    #[test]
    fn unterminated_fence_is_ignored() {
        let text = "```python\nclass Net:\n";
        assert_eq!(extract_code(text), None);
    }
}
