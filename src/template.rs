use crate::event::{EventVariables, Placeholder};

/// Substitutes `{name}` placeholders with percent-encoded event variables.
/// Unknown or missing variables become empty; text that is not a well-formed
/// placeholder is copied as is.
pub fn resolve(template: &str, variables: &EventVariables) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match placeholder_name(after) {
            Some(name) => {
                if let Some(value) = Placeholder::from_name(name).and_then(|p| variables.get(p)) {
                    out.push_str(&urlencoding::encode(value));
                }
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn placeholder_name(s: &str) -> Option<&str> {
    let close = s.find('}')?;
    let name = &s[..close];
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(name)
    } else {
        None
    }
}
