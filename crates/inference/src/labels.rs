use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("failed to read label file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("label map is empty")]
    Empty,

    #[error("malformed class names metadata: {0}")]
    Malformed(String),

    #[error("class ids must be contiguous from 0, expected {expected} but found {found}")]
    NonContiguous { expected: usize, found: usize },
}

/// Class names indexed by the detector's class id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    pub fn new<I, S>(names: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(LabelError::Empty);
        }
        Ok(Self { names })
    }

    /// One class name per line; blank lines are skipped.
    pub fn parse_lines(text: &str) -> Result<Self, LabelError> {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty()),
        )
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| LabelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_lines(&text)
    }

    /// Parse the `names` entry Ultralytics writes into exported model
    /// metadata, e.g. `{0: 'Broken', 1: 'Chalky'}`.
    pub fn from_ultralytics_names(text: &str) -> Result<Self, LabelError> {
        let body = text
            .trim()
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| LabelError::Malformed("expected a {id: 'name'} mapping".into()))?;

        let mut entries = Vec::new();
        let mut rest = body.trim_start();

        while !rest.is_empty() {
            let (key, after_key) = rest
                .split_once(':')
                .ok_or_else(|| LabelError::Malformed(format!("missing ':' near `{}`", rest)))?;
            let id: usize = key
                .trim()
                .parse()
                .map_err(|_| LabelError::Malformed(format!("invalid class id `{}`", key.trim())))?;

            let (name, after_name) = take_quoted(after_key.trim_start())?;
            entries.push((id, name));

            rest = after_name.trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        }

        entries.sort_by_key(|(id, _)| *id);
        for (expected, (found, _)) in entries.iter().enumerate() {
            if *found != expected {
                return Err(LabelError::NonContiguous {
                    expected,
                    found: *found,
                });
            }
        }

        Self::new(entries.into_iter().map(|(_, name)| name))
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Split a leading single- or double-quoted literal off `input`.
fn take_quoted(input: &str) -> Result<(String, &str), LabelError> {
    let mut chars = input.char_indices();
    let quote = match chars.next() {
        Some((_, q @ ('\'' | '"'))) => q,
        _ => {
            return Err(LabelError::Malformed(format!(
                "expected quoted class name near `{}`",
                input
            )));
        }
    };

    let mut value = String::new();
    let mut escaped = false;
    for (idx, c) in chars {
        if escaped {
            value.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Ok((value, &input[idx + c.len_utf8()..]));
        } else {
            value.push(c);
        }
    }

    Err(LabelError::Malformed("unterminated class name".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_ultralytics_names() {
        let labels = LabelMap::from_ultralytics_names(
            "{0: 'Broken', 1: 'Chalky', 2: 'Organic Foreign Matters', 3: \"Good\"}",
        )
        .unwrap();

        assert_eq!(labels.len(), 4);
        assert_eq!(labels.get(0), Some("Broken"));
        assert_eq!(labels.get(2), Some("Organic Foreign Matters"));
        assert_eq!(labels.get(3), Some("Good"));
        assert_eq!(labels.get(4), None);
    }

    #[test]
    fn test_parse_ultralytics_names_out_of_order_and_escaped() {
        let labels =
            LabelMap::from_ultralytics_names("{1: 'Farmer\\'s pick', 0: 'Damaged',}").unwrap();
        assert_eq!(labels.names(), &["Damaged", "Farmer's pick"]);
    }

    #[test]
    fn test_parse_ultralytics_names_rejects_gaps() {
        let err = LabelMap::from_ultralytics_names("{0: 'Broken', 2: 'Chalky'}").unwrap_err();
        assert!(matches!(
            err,
            LabelError::NonContiguous {
                expected: 1,
                found: 2
            }
        ));
    }

    #[test]
    fn test_parse_ultralytics_names_rejects_garbage() {
        assert!(matches!(
            LabelMap::from_ultralytics_names("['Broken']"),
            Err(LabelError::Malformed(_))
        ));
        assert!(matches!(
            LabelMap::from_ultralytics_names("{0: 'Broken"),
            Err(LabelError::Malformed(_))
        ));
        assert!(matches!(
            LabelMap::from_ultralytics_names("{zero: 'Broken'}"),
            Err(LabelError::Malformed(_))
        ));
        assert!(matches!(
            LabelMap::from_ultralytics_names("{}"),
            Err(LabelError::Empty)
        ));
    }

    #[test]
    fn test_from_file_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Broken\n\n  Chalky  \nGood").unwrap();

        let labels = LabelMap::from_file(file.path()).unwrap();
        assert_eq!(labels.names(), &["Broken", "Chalky", "Good"]);
    }

    #[test]
    fn test_from_missing_file() {
        let err = LabelMap::from_file("/nonexistent/labels.txt").unwrap_err();
        assert!(matches!(err, LabelError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/labels.txt"));
    }
}
