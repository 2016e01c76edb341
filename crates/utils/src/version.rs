use std::sync::LazyLock;

/// Name of the controller binary, as shown in `--help` and startup logs.
pub const BINARY_NAME: &str = "parallel-ep";

/// Crate the binary is built from.
pub const COMPONENT: &str = "endpoint-controller";

pub const BUILD_TIMESTAMP: Option<&str> = option_env!("VERGEN_BUILD_TIMESTAMP");

/// `<release>-<short sha>[-dirty]`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    render(
        env!("PARALLEL_EP_RELEASE"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_GIT_DIRTY") == Some("true"),
    )
});

/// One-line banner logged at startup.
pub static BANNER: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{BINARY_NAME} ({COMPONENT}) {} built {}",
        &*VERSION,
        BUILD_TIMESTAMP.unwrap_or("at an unknown time")
    )
});

fn render(release: &str, sha: Option<&str>, dirty: bool) -> String {
    let sha = sha.map(|sha| &sha[..sha.len().min(12)]).unwrap_or("unknown");
    let dirty = if dirty { "-dirty" } else { "" };
    format!("{release}-{sha}{dirty}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_release_and_short_sha() {
        similar_asserts::assert_eq!(
            render("v0.4.0", Some("4f2c9e1d8a7b6c5d4e3f"), false),
            "v0.4.0-4f2c9e1d8a7b"
        );
        similar_asserts::assert_eq!(render("dev", None, true), "dev-unknown-dirty");
    }

    #[test]
    fn banner_names_the_binary() {
        assert!(BANNER.starts_with("parallel-ep (endpoint-controller) "));
        assert!(BANNER.contains(&*VERSION));
    }
}
