use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use colored::*;
use log::{Level, LevelFilter};

static LOGGER: Logger = Logger;
struct Logger;

const BASE_MODULES: &[&str] = &["wgtopo", "wgtopo_engine", "wgtopo_shared", "wgtopo_keystore"];

fn target_is_base(target: &str) -> bool {
    BASE_MODULES
        .iter()
        .any(|module| module == &target || target.starts_with(&format!("{module}::")))
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
            && (log::max_level() == LevelFilter::Trace || target_is_base(metadata.target()))
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let level_str = match record.level() {
                Level::Error => "[E]".red(),
                Level::Warn => "[!]".yellow(),
                Level::Info => "[*]".dimmed(),
                Level::Debug => "[D]".blue(),
                Level::Trace => "[T]".purple(),
            };
            eprintln!("{} {}", level_str, record.args());
        }
    }

    fn flush(&self) {}
}

/// `RUST_LOG` switches to the env-driven logger; otherwise verbosity comes
/// from `-v` flags and output goes through the compact colored format.
pub fn init_logger(verbosity: u8) {
    if std::env::var_os("RUST_LOG").is_some() {
        pretty_env_logger::init();
        return;
    }
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_max_level(level);
    log::set_logger(&LOGGER).expect("logger is only installed once");
}

/// Writes a config file with owner-only permissions; private keys are in
/// there.
pub fn write_private(path: &Path, contents: &str) -> Result<(), io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = File::create(path)?;
    file.set_permissions(Permissions::from_mode(0o600))?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_files_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confs").join("a.conf");
        write_private(&path, "[Interface]\n").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Interface]\n");
    }
}
