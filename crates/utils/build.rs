use std::env;

/// Release tag stamped by the image build; local builds fall back to `dev`.
const RELEASE_ENV: &str = "PARALLEL_EP_RELEASE";

fn main() {
    if let Err(err) = emit_build_metadata() {
        println!("cargo:warning=parallel-ep build metadata unavailable: {err}");
    }

    let release = env::var(RELEASE_ENV)
        .ok()
        .filter(|release| !release.trim().is_empty())
        .unwrap_or_else(|| "dev".to_string());
    println!("cargo:rustc-env=PARALLEL_EP_RELEASE={release}");
    println!("cargo:rerun-if-env-changed={RELEASE_ENV}");
}

fn emit_build_metadata() -> anyhow::Result<()> {
    let mut git = vergen_git2::Git2Builder::default();
    git.sha(true);
    git.dirty(true);
    git.commit_date(true);

    let mut build = vergen_git2::BuildBuilder::default();
    build.build_timestamp(true);

    vergen_git2::Emitter::default()
        .add_instructions(&build.build()?)?
        .add_instructions(&git.build()?)?
        .emit()
}
