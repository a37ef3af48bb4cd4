//! Picks a default resolver address for the health checker to probe,
//! distinguishing a containerised deployment (where the resolver is
//! typically reached through an embedded or sidecar DNS server) from a
//! bare-metal/VM deployment (where it is the loopback resolver).

use std::net::SocketAddr;

const DOCKERENV_MARKER: &str = "/.dockerenv";
const CGROUP_PATH: &str = "/proc/1/cgroup";
const CONTAINERISED_DEFAULT: &str = "127.0.0.11:53";
const HOST_DEFAULT: &str = "127.0.0.1:53";

/// True if the process looks like it's running inside a container: either
/// the well-known Docker marker file exists, or the init process's cgroup
/// membership names a known container runtime.
pub fn is_containerized() -> bool {
    if std::path::Path::new(DOCKERENV_MARKER).exists() {
        return true;
    }
    match std::fs::read_to_string(CGROUP_PATH) {
        Ok(contents) => {
            contents.contains("docker") || contents.contains("kubepods") || contents.contains("containerd")
        }
        Err(_) => false,
    }
}

/// The resolver address to probe when the operator hasn't configured one
/// explicitly.
pub fn default_resolver_address() -> SocketAddr {
    let addr = if is_containerized() {
        CONTAINERISED_DEFAULT
    } else {
        HOST_DEFAULT
    };
    addr.parse().expect("default resolver health address is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_addresses_parse() {
        let _: SocketAddr = CONTAINERISED_DEFAULT.parse().unwrap();
        let _: SocketAddr = HOST_DEFAULT.parse().unwrap();
    }

    #[test]
    fn host_default_used_when_no_markers_present() {
        // This test process isn't running inside a container, so the
        // marker/cgroup checks should both come back negative and the
        // function should fall through to the host default. If the CI
        // sandbox itself is containerised this assertion legitimately
        // flips, so we only assert internal consistency here.
        let detected = is_containerized();
        let expected = if detected { CONTAINERISED_DEFAULT } else { HOST_DEFAULT };
        assert_eq!(default_resolver_address(), expected.parse().unwrap());
    }
}
