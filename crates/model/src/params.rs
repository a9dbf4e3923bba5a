//! Run parameters attached to a job execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved parameter key: the job name supplied by external submission
/// tooling. Values under this key are whitespace-trimmed before storage.
pub const SUBMITTER_JOB_NAME_PARAM: &str = "forgebatch.submitter.jobName";

/// Reserved parameter key: the job id supplied by external submission
/// tooling. Values under this key are whitespace-trimmed before storage.
pub const SUBMITTER_JOB_ID_PARAM: &str = "forgebatch.submitter.jobId";

/// Name/value run parameters for one job execution.
///
/// Stored verbatim except for the two reserved submitter keys, whose values
/// are trimmed of surrounding whitespace on insert (submission front ends
/// have a habit of padding them).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, String>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, applying reserved-key trimming.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let value = if key == SUBMITTER_JOB_NAME_PARAM || key == SUBMITTER_JOB_ID_PARAM {
            value.trim().to_string()
        } else {
            value
        };
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = JobParameters::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_are_trimmed() {
        let mut params = JobParameters::new();
        params.insert(SUBMITTER_JOB_NAME_PARAM, "  nightly-load \t");
        params.insert(SUBMITTER_JOB_ID_PARAM, " 42\n");
        assert_eq!(params.get(SUBMITTER_JOB_NAME_PARAM), Some("nightly-load"));
        assert_eq!(params.get(SUBMITTER_JOB_ID_PARAM), Some("42"));
    }

    #[test]
    fn other_values_are_stored_verbatim() {
        let mut params = JobParameters::new();
        params.insert("input.path", "  /data/in  ");
        assert_eq!(params.get("input.path"), Some("  /data/in  "));
    }

    #[test]
    fn from_iterator_applies_trimming_too() {
        let params: JobParameters = [
            (SUBMITTER_JOB_NAME_PARAM, " padded "),
            ("chunk.size", "500"),
        ]
        .into_iter()
        .collect();
        assert_eq!(params.get(SUBMITTER_JOB_NAME_PARAM), Some("padded"));
        assert_eq!(params.get("chunk.size"), Some("500"));
        assert_eq!(params.len(), 2);
    }
}
