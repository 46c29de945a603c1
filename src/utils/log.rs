use crate::config::LoggingConfig;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const LOG_DIR: &str = "logs";

/// Opens `logs/<filename>` for appending, creating the directory first.
fn open_log_file(filename: &str) -> io::Result<File> {
    let log_dir = Path::new(LOG_DIR);
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }
    let path: PathBuf = log_dir.join(filename);
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writes every log line to stderr and to a log file.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Installs the global logger. `RUST_LOG` overrides the level picked from
/// `config.verbose` and the command line `verbosity`.
pub fn init_logging(config: &LoggingConfig, verbosity: u8) -> io::Result<()> {
    let level = match (config.verbose, verbosity) {
        (_, 2..) => "debug",
        (true, _) | (_, 1) => "info",
        _ => "warn",
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    if let Some(filename) = &config.log_file {
        let file = open_log_file(filename)?;
        builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
    }
    // A logger may already be installed (tests, embedding drivers)
    let _ = builder.try_init();
    Ok(())
}

/// Appends a timestamped block to `logs/<filename>`.
pub fn log_with_header(filename: &str, header: &str, message: &str) -> io::Result<()> {
    let mut file = open_log_file(filename)?;
    writeln!(
        file,
        "\n===== {} ({}) =====",
        header,
        Local::now().to_rfc3339()
    )?;
    writeln!(file, "{}", message)?;
    writeln!(file, "====================")?;
    file.flush()
}
