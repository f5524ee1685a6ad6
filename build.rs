// build.rs

//! Stamps the version reported by `--version` and on HTTP error pages.
//! Packagers may override it with `PMPROXY_VERSION`.

fn main() {
    let version = std::env::var("PMPROXY_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| std::env::var("CARGO_PKG_VERSION").ok())
        .unwrap_or_else(|| "dev".to_string());

    println!("cargo:rustc-env=PMPROXY_BUILD_VERSION={version}");
    println!("cargo:rerun-if-env-changed=PMPROXY_VERSION");
}
