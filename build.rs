// build.rs

fn main() {
    // Generate build info for the kubevirt_info gauge
    if let Err(e) = vergen::EmitBuilder::builder()
        .all_build()
        .git_branch()
        .git_sha(true)
        .emit()
    {
        println!("cargo:warning=Unable to generate build info: {}", e);
    }
}
