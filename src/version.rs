// Version and build information

/// Build information captured by build.rs
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub build_date: &'static str,
    pub git_hash: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
}

/// Get current build information
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_date: option_env!("BUILD_DATE").unwrap_or("unknown"),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown"),
        target: option_env!("BUILD_TARGET").unwrap_or("unknown"),
        profile: option_env!("BUILD_PROFILE").unwrap_or("unknown"),
    }
}

impl BuildInfo {
    pub fn format_display(&self) -> String {
        if self.git_hash == "unknown" {
            format!("unitpanel v{}", self.version)
        } else {
            format!("unitpanel v{} ({})", self.version, self.git_hash)
        }
    }

    pub fn format_build_info(&self) -> String {
        format!(
            "Build: {}\nTarget: {}\nProfile: {}\nGit: {}",
            self.build_date, self.target, self.profile, self.git_hash
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_starts_with_name_and_version() {
        let info = build_info();
        assert!(info
            .format_display()
            .starts_with(&format!("unitpanel v{}", env!("CARGO_PKG_VERSION"))));
    }

    #[test]
    fn test_build_info_lists_fields() {
        let text = build_info().format_build_info();
        for field in ["Build:", "Target:", "Profile:", "Git:"] {
            assert!(text.contains(field));
        }
    }
}
