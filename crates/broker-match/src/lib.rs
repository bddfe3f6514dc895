#![deny(unsafe_code)]
//! Pure, stateless matching functions for capability scopes and resource globs.

/// Returns `true` if colon-segmented scope pattern `pattern` covers `scope`.
///
/// Matching is not symmetric: a pattern ending in `:*` (or the bare `*`) covers
/// anything under its prefix, but a concrete scope never covers a wildcard.
pub fn scope_matches(pattern: &str, scope: &str) -> bool {
    if pattern == scope {
        return true;
    }
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return scope == prefix || scope.starts_with(&format!("{prefix}:"));
    }

    let pattern_segments: Vec<&str> = pattern.split(':').collect();
    let scope_segments: Vec<&str> = scope.split(':').collect();
    if pattern_segments.len() != scope_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(scope_segments.iter())
        .all(|(p, s)| *p == "*" || p == s)
}

/// Returns `true` if glob pattern `pattern` matches `resource`.
///
/// `*` matches any substring (including `/`), `?` matches exactly one
/// character, and every other regex metacharacter is treated literally.
pub fn resource_matches(pattern: &str, resource: &str) -> bool {
    compile_resource_pattern(pattern).is_match(resource)
}

fn compile_resource_pattern(pattern: &str) -> regex::Regex {
    let mut anchored = String::with_capacity(pattern.len() * 2 + 2);
    anchored.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => anchored.push_str(".*"),
            '?' => anchored.push('.'),
            _ => anchored.push_str(&regex::escape(&ch.to_string())),
        }
    }
    anchored.push('$');
    // Every character is either escaped or one of the two wildcards, so the
    // resulting pattern always compiles.
    regex::Regex::new(&anchored).expect("anchored resource pattern always compiles")
}
