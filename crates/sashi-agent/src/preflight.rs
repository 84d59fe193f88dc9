//! System-readiness checks run before the daemon starts serving.
//!
//! The daemon refuses to start unless the cgroup rules engine is active
//! and configured for sashi users, the cpu/memory cgroup mounts exist,
//! and no reboot is pending for this package. Without these, instance
//! resource limits would silently not apply.

use std::path::Path;

use regex::Regex;
use tracing::error;

use crate::shell::run_shell_capture;

const CGRULE_ACTIVE_CMD: &str = concat!(
    "service=$(grep \"ExecStart.*=.*/cgrulesengd$\" /etc/systemd/system/*.service",
    " | head -1 | awk -F : ' { print $1 } ') && [ ! -z $service ]",
    " && systemctl is-active $(basename $service)"
);
const CGRULE_CPU_DIR: &str = "/sys/fs/cgroup/cpu";
const CGRULE_MEM_DIR: &str = "/sys/fs/cgroup/memory";
const CGRULE_CONF: &str = "/etc/cgrules.conf";
const CGRULE_PATTERN: &str = r"(^|\n)(\s*)@sashiuser(\s+)cpu,memory(\s+)%u-cg(\s*)($|\n)";
const REBOOT_FILE: &str = "/run/reboot-required.pkgs";
const REBOOT_PATTERN: &str = r"(^|\n)(\s*)sashimono(\s*)($|\n)";

/// Whether the host is ready to run instances.
///
/// Logs the first failing check and returns `false`; the caller treats
/// that as a fatal init error.
pub async fn system_ready() -> bool {
    match run_shell_capture(CGRULE_ACTIVE_CMD).await {
        Ok(state) if state.starts_with("active") => {}
        _ => {
            error!("cgrules service is inactive");
            return false;
        }
    }

    if !Path::new(CGRULE_CPU_DIR).is_dir() || !Path::new(CGRULE_MEM_DIR).is_dir() {
        error!("cgroup cpu or memory mount does not exist");
        return false;
    }

    let Ok(rules) = std::fs::read_to_string(CGRULE_CONF) else {
        error!("cannot read {CGRULE_CONF}");
        return false;
    };
    if !cgrules_configured(&rules) {
        error!("cgrules entry for sashi users is missing");
        return false;
    }

    if let Ok(pending) = std::fs::read_to_string(REBOOT_FILE) {
        if reboot_pending(&pending) {
            error!("a reboot is pending for this package");
            return false;
        }
    }

    true
}

/// Whether the cgroup rules file carries the sashi-user line.
#[must_use]
pub fn cgrules_configured(rules: &str) -> bool {
    Regex::new(CGRULE_PATTERN).expect("static pattern").is_match(rules)
}

/// Whether the pending-reboot file names this package.
#[must_use]
pub fn reboot_pending(pending: &str) -> bool {
    Regex::new(REBOOT_PATTERN).expect("static pattern").is_match(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgrules_pattern_matches_expected_line() {
        assert!(cgrules_configured("@sashiuser cpu,memory %u-cg\n"));
        assert!(cgrules_configured("# header\n  @sashiuser\tcpu,memory\t%u-cg  \nother\n"));
        assert!(!cgrules_configured("@otheruser cpu,memory %u-cg\n"));
        assert!(!cgrules_configured(""));
    }

    #[test]
    fn reboot_pattern_requires_exact_package() {
        assert!(reboot_pending("libc6\nsashimono\n"));
        assert!(!reboot_pending("libc6\nsashimono-extras\n"));
        assert!(!reboot_pending(""));
    }
}
