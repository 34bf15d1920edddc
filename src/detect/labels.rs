use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// Parse a class-names file: one label per line.
///
/// Blank lines and `#` lines are skipped and a trailing `# comment` is
/// stripped. A file without a single label is an error.
pub fn parse_labels(contents: &str) -> Result<Vec<String>> {
    let labels: Vec<String> = contents
        .lines()
        .map(|line| match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if labels.is_empty() {
        return Err(anyhow!("labels file contains no class names"));
    }
    Ok(labels)
}

pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read labels from {}", path.display()))?;
    parse_labels(&contents).with_context(|| format!("parse labels in {}", path.display()))
}

/// Label for `class_id`, or `class_{id}` when the names file is shorter than
/// the model's class count.
pub(crate) fn label_for(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", class_id))
}
