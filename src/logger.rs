use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{Local, NaiveDate};
use crossbeam_channel::{bounded, Sender, TrySendError};

/// Lines per file before rotating to a suffixed sibling.
const MAX_LINES: usize = 50_000;

const SUFFIX: &str = ".log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Level::Debug,
            1 => Level::Info,
            2 => Level::Warn,
            _ => Level::Error,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Level::Debug => "[debug]",
            Level::Info => "[info] ",
            Level::Warn => "[warn] ",
            Level::Error => "[error]",
        }
    }
}

struct LogFile {
    dir: PathBuf,
    file: Option<File>,
    today: NaiveDate,
    line_count: usize,
    file_index: usize,
    max_lines: usize,
}

impl LogFile {
    fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut lf = Self {
            dir: dir.to_path_buf(),
            file: None,
            today: Local::now().date_naive(),
            line_count: 0,
            file_index: 0,
            max_lines: MAX_LINES,
        };
        lf.reopen()?;
        Ok(lf)
    }

    fn file_name(&self) -> PathBuf {
        let date = self.today.format("%Y_%m_%d");
        let name = if self.file_index == 0 {
            format!("{date}{SUFFIX}")
        } else {
            format!("{date}-{}{SUFFIX}", self.file_index)
        };
        self.dir.join(name)
    }

    fn reopen(&mut self) -> io::Result<()> {
        if let Some(f) = self.file.as_mut() {
            let _ = f.flush();
        }
        self.file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_name())?,
        );
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let today = Local::now().date_naive();
        if today != self.today {
            self.today = today;
            self.file_index = 0;
            self.line_count = 0;
            self.reopen()?;
        } else if self.line_count >= self.max_lines {
            self.file_index += 1;
            self.line_count = 0;
            self.reopen()?;
        }
        self.line_count += 1;
        self.file.as_mut().unwrap().write_all(line.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

struct Inner {
    enabled: bool,
    level: Level,
    file: Option<Arc<Mutex<LogFile>>>,
    sender: Option<Sender<String>>,
    writer: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Disconnect the channel so the writer drains and exits.
        self.sender.take();
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap().flush();
        }
    }
}

/// Single-writer log handle, cheap to clone and threaded through the
/// server rather than hidden behind a global.
///
/// With a queue size of zero every record is written synchronously under
/// the file mutex. Otherwise records go through a bounded queue drained
/// by one background thread; a producer that finds the queue full writes
/// its record synchronously instead of blocking. Files rotate when the
/// calendar day changes or the per-file line count reaches the limit.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    pub fn init(dir: impl AsRef<Path>, level: Level, queue_size: usize) -> io::Result<Self> {
        let file = Arc::new(Mutex::new(LogFile::open(dir.as_ref())?));

        let (sender, writer) = if queue_size > 0 {
            let (tx, rx) = bounded::<String>(queue_size);
            let sink = file.clone();
            let handle = std::thread::Builder::new()
                .name("breakwater-logger".into())
                .spawn(move || {
                    while let Ok(line) = rx.recv() {
                        let _ = sink.lock().unwrap().write_line(&line);
                    }
                })?;
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Ok(Self {
            inner: Arc::new(Inner {
                enabled: true,
                level,
                file: Some(file),
                sender,
                writer,
            }),
        })
    }

    /// A logger that drops every record. Stands in when logging is
    /// switched off in the config.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Inner {
                enabled: false,
                level: Level::Error,
                file: None,
                sender: None,
                writer: None,
            }),
        }
    }

    pub fn log(&self, level: Level, msg: &str) {
        if !self.inner.enabled || level < self.inner.level {
            return;
        }
        let line = format!(
            "{} {} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level.tag(),
            msg
        );
        match &self.inner.sender {
            Some(tx) => match tx.try_send(line) {
                Ok(()) => {}
                // Queue full or writer gone: degrade to a direct write.
                Err(TrySendError::Full(line)) | Err(TrySendError::Disconnected(line)) => {
                    self.write_sync(&line);
                }
            },
            None => self.write_sync(&line),
        }
    }

    fn write_sync(&self, line: &str) {
        if let Some(file) = &self.inner.file {
            let _ = file.lock().unwrap().write_line(line);
        }
    }

    pub fn flush(&self) {
        if let Some(file) = &self.inner.file {
            let _ = file.lock().unwrap().flush();
        }
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        self.log(Level::Debug, msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.log(Level::Info, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.log(Level::Warn, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.log(Level::Error, msg.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_mode_writes_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = Logger::init(dir.path(), Level::Debug, 0).unwrap();
        log.info("server up");
        log.debug("detail");
        log.flush();

        let name = format!("{}{SUFFIX}", Local::now().format("%Y_%m_%d"));
        let content = fs::read_to_string(dir.path().join(name)).unwrap();
        assert!(content.contains("[info]  server up"));
        assert!(content.contains("[debug] detail"));
    }

    #[test]
    fn level_filter_drops_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = Logger::init(dir.path(), Level::Warn, 0).unwrap();
        log.info("dropped");
        log.warn("kept");
        log.flush();

        let name = format!("{}{SUFFIX}", Local::now().format("%Y_%m_%d"));
        let content = fs::read_to_string(dir.path().join(name)).unwrap();
        assert!(!content.contains("dropped"));
        assert!(content.contains("kept"));
    }

    #[test]
    fn async_mode_drains_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = Logger::init(dir.path(), Level::Debug, 64).unwrap();
            for i in 0..200 {
                log.info(format!("record {i}"));
            }
        } // drop joins the writer

        let name = format!("{}{SUFFIX}", Local::now().format("%Y_%m_%d"));
        let content = fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(content.lines().count(), 200);
        assert!(content.contains("record 199"));
    }

    #[test]
    fn line_count_rotation_moves_to_suffixed_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut lf = LogFile::open(dir.path()).unwrap();
        lf.max_lines = 5;
        for i in 0..12 {
            lf.write_line(&format!("line {i}\n")).unwrap();
        }
        lf.flush().unwrap();

        let date = Local::now().format("%Y_%m_%d");
        let base = fs::read_to_string(dir.path().join(format!("{date}{SUFFIX}"))).unwrap();
        let second = fs::read_to_string(dir.path().join(format!("{date}-1{SUFFIX}"))).unwrap();
        let third = fs::read_to_string(dir.path().join(format!("{date}-2{SUFFIX}"))).unwrap();
        assert_eq!(base.lines().count(), 5);
        assert_eq!(second.lines().count(), 5);
        assert_eq!(third.lines().count(), 2);
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let log = Logger::disabled();
        log.error("into the void");
        log.flush();
    }
}
