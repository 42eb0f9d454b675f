use std::process::{Command, Stdio};

/// Runs git with `args` and returns its trimmed output, if it succeeded.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .stderr(Stdio::inherit())
        .output()
        .ok()?;

    if !output.status.success() {
        println!("cargo:warning=`git {}` failed: {}", args.join(" "), output.status);
        return None;
    }

    Some(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

fn emit(var: &str, value: Option<String>) {
    let value = value.unwrap_or_else(|| "unknown".to_owned());
    println!("cargo:rustc-env={var}={value}");
    println!("cargo:rerun-if-env-changed={var}");
}

fn main() {
    emit(
        "MIRRORGATE_GIT_VERSION",
        git(&["describe", "--always", "--dirty=-modified"]),
    );
    emit("MIRRORGATE_RELEASE", git(&["rev-parse", "HEAD"]));
}
