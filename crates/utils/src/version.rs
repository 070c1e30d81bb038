use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1,
        BUILD_INFO.git_dirty == Some("true"),
    )
});

fn format_version(image_version: &str, commit_sha1: Option<&str>, git_dirty: bool) -> String {
    format!(
        "{}-{}{}",
        image_version,
        commit_sha1.unwrap_or("unknown"),
        if git_dirty { "-dirty" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn version_without_git_metadata() {
        assert_eq!(format_version("latest", None, false), "latest-unknown");
    }

    #[test]
    fn version_marks_dirty_tree() {
        assert_eq!(
            format_version("v0.2.0", Some("3f2a9c1"), true),
            "v0.2.0-3f2a9c1-dirty"
        );
    }
}
