//! Turns joined root/server/database strings into safe filesystem paths.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::path::PathBuf;

/// Characters replaced with `_` everywhere after the drive/UNC prefix.
pub const RESERVED_CHARS: [char; 6] = [':', '?', '"', '<', '>', '|'];
const PRESERVED_PREFIX_LEN: usize = 2;
const REPLACEMENT: char = '_';

/// Separator convention of the target filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStyle {
    /// `\` canonical, `/` alternate.
    Windows,
    /// `/` canonical, `\` alternate.
    Unix,
}

impl PathStyle {
    pub const fn native() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    pub const fn separator(self) -> char {
        match self {
            Self::Windows => '\\',
            Self::Unix => '/',
        }
    }

    pub const fn alternate_separator(self) -> char {
        match self {
            Self::Windows => '/',
            Self::Unix => '\\',
        }
    }

    fn is_separator(self, c: char) -> bool {
        c == self.separator() || c == self.alternate_separator()
    }
}

/// Sanitizes `raw` using the separators of the host platform.
pub fn sanitize_path(raw: &str) -> Result<String> {
    sanitize_path_with(raw, PathStyle::native())
}

pub fn sanitize_path_with(raw: &str, style: PathStyle) -> Result<String> {
    let split_at = raw
        .char_indices()
        .nth(PRESERVED_PREFIX_LEN)
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    let (prefix, rest) = raw.split_at(split_at);
    if prefix.chars().count() < PRESERVED_PREFIX_LEN {
        return Err(Error::Configuration(format!(
            "path {raw:?} is too short, it must start with a drive or root prefix"
        )));
    }

    let separator = style.separator();
    let mut out = String::with_capacity(raw.len());
    out.push_str(prefix);
    let mut previous_was_separator = false;
    for c in rest.chars() {
        let c = if c == style.alternate_separator() {
            separator
        } else if RESERVED_CHARS.contains(&c) {
            REPLACEMENT
        } else {
            c
        };

        if c == separator && previous_was_separator {
            continue;
        }
        previous_was_separator = c == separator;
        out.push(c);
    }

    Ok(out)
}

/// Replaces directory separators inside a single name so it stays one path segment.
///
/// Named instances (`HOST\INSTANCE`) would otherwise nest a directory. Empty, `.`
/// and `..` names would resolve outside their own directory and become `_`.
pub fn path_segment(name: &str, style: PathStyle) -> String {
    if matches!(name, "" | "." | "..") {
        return REPLACEMENT.to_string();
    }
    name.chars()
        .map(|c| if style.is_separator(c) { REPLACEMENT } else { c })
        .collect()
}

/// Joins `root` and every segment with the canonical separator, then sanitizes.
pub fn safe_join<S: AsRef<str>>(root: &str, segments: &[S], style: PathStyle) -> Result<PathBuf> {
    let separator = style.separator().to_string();
    let raw = std::iter::once(root.to_string())
        .chain(segments.iter().map(|s| path_segment(s.as_ref(), style)))
        .collect::<Vec<_>>()
        .join(&separator);
    sanitize_path_with(&raw, style).map(PathBuf::from)
}
