use std::process::Command;

fn main() {
    println!(
        "cargo:rustc-env=WEFT_BUILD_TIMESTAMP={}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    );

    // Revision string for `weft version`; plain version builds outside git.
    let revision = Command::new("git")
        .args(["describe", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|rev| rev.trim().to_string())
        .filter(|rev| !rev.is_empty())
        .unwrap_or_else(|| "unreleased".to_string());
    println!("cargo:rustc-env=WEFT_GIT_REV={}", revision);

    println!("cargo:rerun-if-changed=.git/HEAD");
}
