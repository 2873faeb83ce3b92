//! `CNI_ARGS` parsing: a semicolon-delimited `KEY=VALUE` list carrying the
//! workload identity.

use std::collections::HashMap;

use crate::error::PluginError;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct K8sArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
}

impl K8sArgs {
    pub fn parse(args: &str) -> Result<Self, PluginError> {
        let mut map = HashMap::new();
        for pair in args.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PluginError::Args(format!("malformed CNI_ARGS entry {pair:?}")))?;
            map.insert(key.to_string(), value.to_string());
        }
        Ok(Self {
            pod_name: map.remove("K8S_POD_NAME").unwrap_or_default(),
            pod_namespace: map.remove("K8S_POD_NAMESPACE").unwrap_or_default(),
            pod_uid: map.remove("K8S_POD_UID").unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_args() {
        let args =
            K8sArgs::parse("K8S_POD_NAME=nginx;K8S_POD_NAMESPACE=default;K8S_POD_UID=abc-123")
                .unwrap();
        assert_eq!(args.pod_name, "nginx");
        assert_eq!(args.pod_namespace, "default");
        assert_eq!(args.pod_uid, "abc-123");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let args = K8sArgs::parse(
            "IgnoreUnknown=1;K8S_POD_NAME=web;K8S_POD_NAMESPACE=media;K8S_POD_UID=u1",
        )
        .unwrap();
        assert_eq!(args.pod_name, "web");
        assert_eq!(args.pod_namespace, "media");
    }

    #[test]
    fn empty_string_yields_defaults() {
        let args = K8sArgs::parse("").unwrap();
        assert_eq!(args, K8sArgs::default());
    }

    #[test]
    fn trailing_semicolons_are_tolerated() {
        let args = K8sArgs::parse("K8S_POD_NAME=web;;").unwrap();
        assert_eq!(args.pod_name, "web");
    }

    #[test]
    fn entry_without_equals_is_an_error() {
        assert!(K8sArgs::parse("K8S_POD_NAME").is_err());
    }

    #[test]
    fn value_may_contain_equals() {
        let args = K8sArgs::parse("K8S_POD_NAME=a=b").unwrap();
        assert_eq!(args.pod_name, "a=b");
    }
}
