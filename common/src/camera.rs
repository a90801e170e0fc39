//! Camera definitions – `name:pattern:url` triples from the config file.
//!
//! A definition is validated here so that the recorder core only ever sees
//! complete cameras with bounded fields and a usable filename pattern.

use std::fmt::Write;

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::warn;

/// Longest accepted camera name, in bytes.
pub const NAME_MAX_LEN: usize = 255;
/// Longest accepted filename pattern, in bytes.
pub const PATTERN_MAX_LEN: usize = 255;
/// Longest accepted source URL, in bytes.
pub const URL_MAX_LEN: usize = 4096;

/// Why a camera definition was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CameraDefError {
    #[error("camera definition incomplete (expected name:pattern:url): '{0}'")]
    Incomplete(String),

    #[error("camera name longer than {NAME_MAX_LEN} bytes: '{0}'")]
    NameTooLong(String),

    #[error("filename pattern longer than {PATTERN_MAX_LEN} bytes: '{0}'")]
    PatternTooLong(String),

    #[error("camera definition has neither a name nor a filename pattern: '{0}'")]
    Anonymous(String),

    #[error("source URL longer than {URL_MAX_LEN} bytes: '{0}'")]
    UrlTooLong(String),

    #[error("source URL missing in camera definition: '{0}'")]
    MissingUrl(String),

    #[error("invalid strftime pattern '{0}'")]
    InvalidPattern(String),
}

/// One camera to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDef {
    pub name: String,
    /// strftime pattern for segment file names (without extension).
    pub pattern: String,
    pub url: String,
}

impl CameraDef {
    /// Build a camera, deriving `<name>_%Y%m%d_%H%M%S` when no pattern is given.
    pub fn new(name: &str, pattern: Option<&str>, url: &str) -> Result<Self, CameraDefError> {
        let pattern = pattern.filter(|p| !p.is_empty());
        let repr = format!("{name}:{}:{url}", pattern.unwrap_or_default());

        if name.len() > NAME_MAX_LEN {
            return Err(CameraDefError::NameTooLong(name.to_string()));
        }
        if let Some(p) = pattern {
            if p.len() > PATTERN_MAX_LEN {
                return Err(CameraDefError::PatternTooLong(p.to_string()));
            }
        }
        if name.is_empty() && pattern.is_none() {
            return Err(CameraDefError::Anonymous(repr));
        }
        if url.len() > URL_MAX_LEN {
            return Err(CameraDefError::UrlTooLong(url.to_string()));
        }
        if url.is_empty() {
            return Err(CameraDefError::MissingUrl(repr));
        }

        let pattern = match pattern {
            Some(p) => p.to_string(),
            None => {
                let generated = format!("{name}_%Y%m%d_%H%M%S");
                warn!("Generated filename pattern '{generated}' for camera '{name}'");
                generated
            }
        };
        if !is_valid_pattern(&pattern) {
            return Err(CameraDefError::InvalidPattern(pattern));
        }

        Ok(Self {
            name: name.to_string(),
            pattern,
            url: url.to_string(),
        })
    }

    /// Parse a `name:pattern:url` definition.
    ///
    /// Only the first two `:` separate fields, so the URL keeps its own
    /// scheme and port separators.
    pub fn parse(def: &str) -> Result<Self, CameraDefError> {
        let def = def.trim();
        let mut parts = def.splitn(3, ':');
        let (Some(name), Some(pattern), Some(url)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CameraDefError::Incomplete(def.to_string()));
        };
        Self::new(name.trim(), Some(pattern.trim()), url.trim())
    }

    /// Label used in logs: the name, or the pattern for anonymous cameras.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.pattern
        } else {
            &self.name
        }
    }
}

/// A pattern is usable when every specifier parses and it formats against a
/// local wall-clock time, which rules out offsets and zone names (`%z`, `%Z`).
fn is_valid_pattern(pattern: &str) -> bool {
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return false;
    }
    let mut rendered = String::new();
    write!(rendered, "{}", NaiveDateTime::default().format(pattern)).is_ok()
}
