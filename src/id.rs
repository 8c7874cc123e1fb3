use std::fmt::{Debug, Display};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Identifies one import job, e.g. `imp_1767225600_4821`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[sqlx(transparent)]
pub struct ImportId(String);

impl ImportId {
    pub fn generate() -> Self {
        let suffix: u32 = rand::thread_rng().gen_range(1000..=9999);
        ImportId(format!(
            "imp_{}_{}",
            chrono::Utc::now().timestamp(),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Record store group holding a directly scheduled record set.
    pub fn direct_group(&self) -> String {
        self.0.clone()
    }

    /// Record store group holding the records parsed from one source file.
    pub fn file_group(&self, file_index: usize) -> String {
        format!("{}_file_{}", self.0, file_index)
    }

    /// Work group tag shared by every queued unit of this job.
    pub fn tag(&self) -> &str {
        &self.0
    }
}

impl Display for ImportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for ImportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ImportId({})", self.0)
    }
}

impl From<String> for ImportId {
    fn from(id: String) -> Self {
        ImportId(id)
    }
}

impl From<&str> for ImportId {
    fn from(id: &str) -> Self {
        ImportId(id.to_string())
    }
}

impl Serialize for ImportId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ImportId {
    fn deserialize<D>(deserializer: D) -> Result<ImportId, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.trim().is_empty() {
            return Err(serde::de::Error::custom("import id must not be empty"));
        }
        Ok(ImportId(s))
    }
}
