//! Build metadata stamped by `build.rs`, shown in the daemon's startup banner.

const BUILD_ID: Option<&str> = option_env!("FLEET_BUILD_ID");
const GIT_REVISION: Option<&str> = option_env!("FLEET_BUILD_GIT");

/// Build time and git revision, e.g. `2025-10-05 15:47:12 UTC | v1.2.3-8a4f1d2`.
pub fn build_id() -> &'static str {
    BUILD_ID.unwrap_or("unknown build")
}

pub fn git_revision() -> &'static str {
    GIT_REVISION.unwrap_or("unknown")
}

/// One-line banner for a binary.
pub fn banner(package: &str, version: &str) -> String {
    format!("{} {} ({})", package, version, build_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_names_binary_and_build() {
        let line = banner("fleetd", "0.1.0");
        assert!(line.starts_with("fleetd 0.1.0 ("));
        assert!(line.contains(build_id()));
        assert!(!git_revision().is_empty());
    }
}
