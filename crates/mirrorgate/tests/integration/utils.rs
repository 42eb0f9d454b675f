use std::fs;
use std::path::{Path, PathBuf};

/// The path to the server binary under test.
pub fn binary() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_mirrorgate"))
}

/// Writes a configuration file below `root` that serves `root/htdocs` on `bind`.
///
/// `/mirror/**/*` always redirects to `http://mirror.example.com`, everything else is served
/// locally.
pub fn write_config(root: &Path, bind: &str) -> PathBuf {
    let path = root.join("config.yml");
    let config = format!(
        "bind: {bind}
root_dir: {htdocs}
access_log:
  dir: {logs}
  filename: access_%Y.log
  flush_interval: 10ms
admin:
  user: op
  password: secret
logging:
  level: debug
  format: simplified
redirects:
  - patterns: ['/mirror/**/*']
    targets:
      - weight: 1
        base_url: http://mirror.example.com
  - patterns: ['/**/*']
    targets:
      - weight: 1
",
        htdocs = root.join("htdocs").display(),
        logs = root.join("logs").display(),
    );
    fs::write(&path, config).unwrap();
    path
}
