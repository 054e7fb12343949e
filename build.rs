use std::process::Command;

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let build_date = command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .unwrap_or_else(|| "unknown".to_owned());
    let revision = command_output("git", &["rev-parse", "--short", "HEAD"])
        .unwrap_or_else(|| "unversioned".to_owned());

    println!("cargo:rustc-env=DRONEWIRE_BUILD_DATE_UTC={build_date}");
    println!("cargo:rustc-env=DRONEWIRE_REVISION={revision}");
}
