//! Build script for knfw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `knfw --version`.

fn main() {
    // Re-run build if the packager overrides the default nft binary
    println!("cargo:rerun-if-env-changed=KNFW_SYSTEM_NFT_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
