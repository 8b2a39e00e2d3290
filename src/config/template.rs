//! Path templates
//!
//! Placeholders: `{stream}` (full identifier), `{app}` (first segment),
//! `{name}` (last segment), `{format}` (format tag). A template naming
//! neither `{stream}` nor `{name}` is a directory and the stream identifier
//! is joined below it.

use std::path::PathBuf;

use crate::error::ResolveError;
use crate::format::RecordFormat;

/// Render `template` for `stream` and append `ext`
pub fn render(
    template: &str,
    stream: &str,
    format: RecordFormat,
    ext: &str,
) -> Result<PathBuf, ResolveError> {
    let segments = split_stream(stream)?;

    let mut out = String::with_capacity(template.len() + stream.len() + ext.len());
    let mut names_stream = false;
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or(ResolveError::UnclosedPlaceholder)?;
        let name = &after[..close];

        match name {
            "stream" => {
                names_stream = true;
                out.push_str(stream);
            }
            "name" => {
                names_stream = true;
                out.push_str(segments[segments.len() - 1]);
            }
            "app" => {
                if segments.len() < 2 {
                    return Err(ResolveError::MissingSubstitution("app"));
                }
                out.push_str(segments[0]);
            }
            "format" => out.push_str(format.as_str()),
            other => return Err(ResolveError::UnknownPlaceholder(other.to_string())),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);

    let path = if names_stream {
        out.push_str(ext);
        PathBuf::from(out)
    } else {
        PathBuf::from(out).join(format!("{}{}", stream, ext))
    };
    Ok(path)
}

/// Split a stream identifier into path segments, rejecting traversal
fn split_stream(stream: &str) -> Result<Vec<&str>, ResolveError> {
    if stream.is_empty() {
        return Err(ResolveError::EmptyStream);
    }
    let segments: Vec<&str> = stream.split('/').collect();
    if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
        return Err(ResolveError::InvalidSegment(stream.to_string()));
    }
    Ok(segments)
}
