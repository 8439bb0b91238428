use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque string identifier with a type-level brand. Generated ids are
/// `{prefix}_{uuid v7}` so they sort by creation time; ids arriving from
/// outside (thread ids chosen by the agent runtime, exported span ids) are
/// wrapped verbatim with `from_raw`.
macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ThreadId, "thread");
branded_id!(CheckpointId, "cp");
branded_id!(SpanId, "span");
branded_id!(TraceId, "trace");

/// Short random hex suffix used when deriving thread ids for forks.
pub fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl ThreadId {
    /// Thread id for a resumed continuation of `self`.
    pub fn resumed(&self) -> Self {
        Self(format!("{}_resume_{}", self.0, short_suffix()))
    }

    /// Thread id for a named branch of `self`.
    pub fn branched(&self, branch_name: &str) -> Self {
        Self(format!("{}_{}", self.0, branch_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_id_has_prefix() {
        let id = CheckpointId::new();
        assert!(id.as_str().starts_with("cp_"), "got: {id}");
    }

    #[test]
    fn span_id_has_prefix() {
        let id = SpanId::new();
        assert!(id.as_str().starts_with("span_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = CheckpointId::new();
        let b = CheckpointId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<CheckpointId> = (0..100).map(|_| CheckpointId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = ThreadId::from_raw("t1");
        assert_eq!(id.as_str(), "t1");
        assert_eq!(id.to_string(), "t1");
    }

    #[test]
    fn resumed_thread_id_keeps_source_prefix() {
        let id = ThreadId::from_raw("t1").resumed();
        assert!(id.as_str().starts_with("t1_resume_"), "got: {id}");
        assert_eq!(id.as_str().len(), "t1_resume_".len() + 8);
    }

    #[test]
    fn branched_thread_id() {
        let id = ThreadId::from_raw("t1").branched("alt");
        assert_eq!(id.as_str(), "t1_alt");
    }

    #[test]
    fn serde_is_transparent() {
        let id = ThreadId::from_raw("t1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"t1\"");
    }
}
