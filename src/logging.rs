// Logging setup
//
// env_logger writes every record to stderr, and also to a log file once one
// is attached. The logger is installed before the config is read so records
// from loading it are not lost.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// Log target shared between env_logger and the frame-loop driver
#[derive(Clone, Default)]
pub struct LogSink {
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    /// Copy every following record into `path`. The file is truncated.
    pub fn attach(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        writeln!(file, "=== RT Frame Core Log ===")?;
        writeln!(file, "Started: {:?}", SystemTime::now())?;
        writeln!(file)?;

        *self.file.lock() = Some(file);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.file.lock().is_some()
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.lock().as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.lock().as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Install the global logger: Info by default, RUST_LOG overrides.
pub fn init() -> LogSink {
    let sink = LogSink::default();
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Pipe(Box::new(sink.clone())))
        .init();
    sink
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rt_frame_core_{}_{}.log", name, std::process::id()))
    }

    #[test]
    fn records_reach_attached_file() {
        let path = temp_log("attached");
        let mut sink = LogSink::default();
        assert!(!sink.is_attached());

        writeln!(sink, "before attach").unwrap();
        sink.attach(&path).unwrap();
        assert!(sink.is_attached());

        // env_logger writes through its own clone of the sink
        let mut logger_side = sink.clone();
        writeln!(logger_side, "[INFO] Renderer ready").unwrap();
        logger_side.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(contents.starts_with("=== RT Frame Core Log ==="));
        assert!(contents.contains("[INFO] Renderer ready"));
        assert!(!contents.contains("before attach"));
    }

    #[test]
    fn attach_truncates_previous_run() {
        let path = temp_log("truncate");
        std::fs::write(&path, "stale record from last run\n").unwrap();

        let sink = LogSink::default();
        sink.attach(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(!contents.contains("stale record"));
    }

    #[test]
    fn unwritable_path_is_reported() {
        let sink = LogSink::default();
        let path = std::env::temp_dir().join("rt_frame_core_missing_dir").join("nested").join("x.log");
        assert!(sink.attach(&path).is_err());
        assert!(!sink.is_attached());
    }
}
