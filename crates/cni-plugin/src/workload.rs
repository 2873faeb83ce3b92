//! Workload configuration from annotations.
//!
//! Annotations arrive through the runtime's `runtimeConfig.podAnnotations`
//! when forwarded; absent or unparseable values fall back to defaults, so a
//! workload with no annotations gets an overlay identity with the daemon's
//! settings.

use std::collections::HashMap;

pub const ANNOTATION_ENABLED: &str = "tailscale.com/enabled";
pub const ANNOTATION_TAGS: &str = "tailscale.com/tags";
pub const ANNOTATION_HOSTNAME: &str = "tailscale.com/hostname";
pub const ANNOTATION_EPHEMERAL: &str = "tailscale.com/ephemeral";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadConfig {
    /// Whether this workload joins the overlay at all. Default true.
    pub enabled: bool,
    /// Tags for this workload's node; empty means daemon-level tags.
    pub tags: Vec<String>,
    /// Hostname override; empty means the derived cluster-namespace-name.
    pub hostname: String,
    /// Parsed for completeness; node keys are always minted non-ephemeral
    /// so crash recovery keeps working.
    pub ephemeral: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tags: Vec::new(),
            hostname: String::new(),
            ephemeral: false,
        }
    }
}

impl WorkloadConfig {
    pub fn from_annotations(annotations: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = annotations.get(ANNOTATION_ENABLED) {
            if let Ok(enabled) = value.trim().parse::<bool>() {
                config.enabled = enabled;
            }
        }

        if let Some(value) = annotations.get(ANNOTATION_TAGS) {
            config.tags = value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(value) = annotations.get(ANNOTATION_HOSTNAME) {
            config.hostname = value.trim().to_string();
        }

        if let Some(value) = annotations.get(ANNOTATION_EPHEMERAL) {
            if let Ok(ephemeral) = value.trim().parse::<bool>() {
                config.ephemeral = ephemeral;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_annotations_use_defaults() {
        let config = WorkloadConfig::from_annotations(&HashMap::new());
        assert!(config.enabled);
        assert!(config.tags.is_empty());
        assert!(config.hostname.is_empty());
        assert!(!config.ephemeral);
    }

    #[test]
    fn enabled_false_is_parsed() {
        let config =
            WorkloadConfig::from_annotations(&annotations(&[(ANNOTATION_ENABLED, "false")]));
        assert!(!config.enabled);
    }

    #[test]
    fn unparseable_enabled_falls_back_to_default() {
        let config =
            WorkloadConfig::from_annotations(&annotations(&[(ANNOTATION_ENABLED, "yes please")]));
        assert!(config.enabled);
    }

    #[test]
    fn tags_are_split_and_trimmed() {
        let config = WorkloadConfig::from_annotations(&annotations(&[(
            ANNOTATION_TAGS,
            " tag:web , tag:prod ,, ",
        )]));
        assert_eq!(config.tags, vec!["tag:web", "tag:prod"]);
    }

    #[test]
    fn hostname_is_trimmed() {
        let config = WorkloadConfig::from_annotations(&annotations(&[(
            ANNOTATION_HOSTNAME,
            "  my-host  ",
        )]));
        assert_eq!(config.hostname, "my-host");
    }

    #[test]
    fn ephemeral_true_is_parsed() {
        let config =
            WorkloadConfig::from_annotations(&annotations(&[(ANNOTATION_EPHEMERAL, "true")]));
        assert!(config.ephemeral);
    }

    #[test]
    fn unparseable_ephemeral_falls_back_to_default() {
        let config =
            WorkloadConfig::from_annotations(&annotations(&[(ANNOTATION_EPHEMERAL, "maybe")]));
        assert!(!config.ephemeral);
    }
}
