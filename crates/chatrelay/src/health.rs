//! Lifecycle status reported by `/health`.

use serde::{Deserialize, Serialize};

/// Where the relay is in its lifecycle. Only `Ready` admits chat requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    #[default]
    Unknown,
    /// Backend session still coming up.
    Starting,
    Ready,
    /// Backend session lost for good; a restart is needed.
    Defunct,
}

impl Health {
    pub fn is_ready(&self) -> bool {
        *self == Health::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ready_admits_requests() {
        assert!(Health::Ready.is_ready());
        for h in [Health::Unknown, Health::Starting, Health::Defunct] {
            assert!(!h.is_ready(), "{h:?}");
        }
        assert_eq!(Health::default(), Health::Unknown);
    }

    #[test]
    fn wire_names() {
        insta::assert_json_snapshot!(
            [Health::Unknown, Health::Starting, Health::Ready, Health::Defunct],
            @r#"
        [
          "UNKNOWN",
          "STARTING",
          "READY",
          "DEFUNCT"
        ]
        "#
        );
        assert_eq!(
            serde_json::from_str::<Health>("\"DEFUNCT\"").unwrap(),
            Health::Defunct
        );
    }
}
