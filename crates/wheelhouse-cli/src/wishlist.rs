//! The plaintext wishlist format (spec.md §6): one package per line,
//! `#`-prefixed and blank lines ignored, surrounding whitespace stripped.
//! Too small a grammar to warrant its own crate.

use std::path::Path;

pub fn parse_wishlist(path: &Path) -> std::io::Result<Vec<String>> {
    let raw = fs_err::read_to_string(path)?;
    Ok(parse_wishlist_str(&raw))
}

fn parse_wishlist_str(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        let parsed = parse_wishlist_str(
            "click\n\n# a comment\n  requests  \n#another\nflask\n",
        );
        assert_eq!(parsed, vec!["click", "requests", "flask"]);
    }
}
