//! Request and path filtering shared by the policy handlers.

use std::borrow::Cow;
use std::path::Path;

use crate::config::PolicyConfig;
use crate::request::{IoRequest, RequestorMode};

#[derive(Debug, Clone)]
pub struct PathFilter {
    max_path_chars: usize,
    prefixes: Vec<String>,
    suffixes: Vec<String>,
    case_insensitive: bool,
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn fold(case_insensitive: bool, s: &str) -> Cow<'_, str> {
    if case_insensitive {
        Cow::Owned(s.to_lowercase())
    } else {
        Cow::Borrowed(s)
    }
}

impl PathFilter {
    /// Builds the filter from policy settings. `internal` directories are
    /// always excluded in addition to the configured prefixes.
    pub fn new(config: &PolicyConfig, internal: &[&Path]) -> Self {
        let ci = config.case_insensitive;
        let configured = config.excluded_prefixes.iter().map(String::as_str);
        let internal = internal.iter().map(|p| p.to_str().unwrap_or_default());

        Self {
            max_path_chars: config.max_path_chars,
            prefixes: configured
                .chain(internal)
                .filter(|p| !p.is_empty())
                .map(|p| fold(ci, p.trim_end_matches(is_separator)).into_owned())
                .collect(),
            suffixes: config
                .excluded_suffixes
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| fold(ci, s).into_owned())
                .collect(),
            case_insensitive: ci,
        }
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let path = fold(self.case_insensitive, path);

        let under_prefix = self.prefixes.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str())
                .map(|rest| rest.is_empty() || rest.starts_with(is_separator))
                .unwrap_or(false)
        });

        under_prefix || self.suffixes.iter().any(|s| path.ends_with(s.as_str()))
    }

    /// Non-empty, shorter than the wire limit, and not excluded.
    pub fn accepts_path(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        if path.encode_utf16().count() >= self.max_path_chars {
            return false;
        }
        !self.is_excluded(path)
    }

    /// Kernel-mode callers and nested filesystem-internal requests are not tracked.
    pub fn ignores_requestor(&self, req: &IoRequest) -> bool {
        req.requestor_mode == RequestorMode::Kernel || req.nested
    }
}
