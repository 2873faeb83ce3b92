//! Hostname derivation for overlay nodes.
//!
//! A node's hostname is `{cluster}-{namespace}-{workload}` after stripping
//! the scheduler-generated suffixes from the workload name and sanitizing
//! the result into DNS-label form. Derivation is pure: the same inputs
//! always produce the same hostname.

use std::sync::LazyLock;

use regex::Regex;

/// Prefix of every per-container TUN link owned by this daemon.
pub const TUN_PREFIX: &str = "ts-";

/// ReplicaSet pods: `{name}-{8..10 alnum hash}-{5 alnum random}`.
static REPLICASET_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)-[a-z0-9]{8,10}-[a-z0-9]{5}$").unwrap());

/// Deployment/ReplicaSet without the random tail: `{name}-{8..10 alnum hash}`.
static DEPLOYMENT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)-[a-z0-9]{8,10}$").unwrap());

/// StatefulSet ordinals (`-0` .. `-999`) are part of the identity and kept.
static ORDINAL_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-\d{1,3}$").unwrap());

static INVALID_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9-]").unwrap());
static DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").unwrap());

/// Strip scheduler-generated suffixes from a workload name.
///
/// Ordinal suffixes are checked first so stateful workloads keep their
/// identity: `web-0` must not lose its `-0`.
pub fn strip_workload_suffixes(name: &str) -> &str {
    if ORDINAL_SUFFIX.is_match(name) {
        return name;
    }
    if let Some(caps) = REPLICASET_SUFFIX.captures(name) {
        if let Some(m) = caps.get(1) {
            return &name[m.range()];
        }
    }
    if let Some(caps) = DEPLOYMENT_SUFFIX.captures(name) {
        if let Some(m) = caps.get(1) {
            return &name[m.range()];
        }
    }
    name
}

/// Reduce a string to a valid hostname: lowercase, `[a-z0-9-]` only,
/// collapsed dashes, trimmed, at most 63 characters.
pub fn sanitize(s: &str) -> String {
    let lowered = s.to_lowercase();
    let replaced = INVALID_CHARS.replace_all(&lowered, "-");
    let collapsed = DASH_RUNS.replace_all(&replaced, "-");
    let trimmed = collapsed.trim_matches('-');
    trimmed.chars().take(63).collect()
}

/// Derive the node hostname for a workload.
pub fn derive(cluster: &str, namespace: &str, workload_name: &str) -> String {
    let clean = strip_workload_suffixes(workload_name);
    sanitize(&format!("{cluster}-{namespace}-{clean}"))
}

/// Deterministic TUN link name for a container: `ts-` plus up to the first
/// eight characters of the container id.
pub fn tun_name(container_id: &str) -> String {
    let suffix: String = container_id.chars().take(8).collect();
    format!("{TUN_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_suffixes_table() {
        let cases = [
            ("nginx-deployment-7b5d9c6f8-xyz12", "nginx-deployment"),
            ("plex-7b5d9c6f8-abcde", "plex"),
            ("redis-statefulset-0", "redis-statefulset-0"),
            ("cassandra-3", "cassandra-3"),
            ("api-server-5f7d8c9b2a", "api-server"),
            ("my-pod", "my-pod"),
        ];
        for (input, want) in cases {
            assert_eq!(strip_workload_suffixes(input), want, "input: {input}");
        }
    }

    #[test]
    fn sanitize_table() {
        let cases = [
            ("my-pod", "my-pod"),
            ("MY-POD", "my-pod"),
            ("MyPod-Name", "mypod-name"),
            ("my_pod_name", "my-pod-name"),
            ("my.pod.name", "my-pod-name"),
            ("my@pod#name!", "my-pod-name"),
            ("my--pod---name", "my-pod-name"),
            ("-my-pod", "my-pod"),
            ("my-pod-", "my-pod"),
            ("-my-pod-", "my-pod"),
            ("pod-123-abc", "pod-123-abc"),
            ("", ""),
            ("@#$%^&*()", ""),
        ];
        for (input, want) in cases {
            assert_eq!(sanitize(input), want, "input: {input}");
        }
    }

    #[test]
    fn sanitize_truncates_to_63() {
        let long = "a".repeat(78);
        assert_eq!(sanitize(&long), "a".repeat(63));

        let exactly = "a".repeat(63);
        assert_eq!(sanitize(&exactly), exactly);
    }

    #[test]
    fn derive_is_pure_and_composed() {
        let a = derive("minikube", "default", "nginx-deployment-7b5d9c6f8-xyz12");
        let b = derive("minikube", "default", "nginx-deployment-7b5d9c6f8-xyz12");
        assert_eq!(a, b);
        assert_eq!(a, "minikube-default-nginx-deployment");
    }

    #[test]
    fn derive_sanitizes_inputs() {
        assert_eq!(derive("K8S", "Team_A", "My-Pod"), "k8s-team-a-my-pod");
    }

    #[test]
    fn tun_name_truncates_container_id() {
        assert_eq!(tun_name("0123456789abcdef"), "ts-01234567");
        assert_eq!(tun_name("abc"), "ts-abc");
    }

    #[test]
    fn tun_name_matches_prefix() {
        assert!(tun_name("deadbeefcafe").starts_with(TUN_PREFIX));
    }
}
