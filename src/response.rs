use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};

use crate::buffer::Buffer;

fn status_reason(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

fn content_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(idx) => &path[idx..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

/// Assembles one response: status line and headers into the write
/// buffer, the body as a read-only private mapping of the resolved file.
///
/// At most one mapping is outstanding; `init` drops the previous one
/// before anything else, and dropping the response releases it on every
/// exit path.
pub struct HttpResponse {
    code: u16,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    mmap: Option<Mmap>,
    file_len: u64,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            code: 0,
            keep_alive: false,
            path: String::new(),
            src_dir: PathBuf::new(),
            mmap: None,
            file_len: 0,
        }
    }

    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: u16) {
        self.unmap();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path.to_string();
        self.src_dir = src_dir.to_path_buf();
        self.file_len = 0;
    }

    pub fn unmap(&mut self) {
        self.mmap = None;
        self.file_len = 0;
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// The mapped body, when the file mapped successfully.
    pub fn file(&self) -> Option<&[u8]> {
        self.mmap.as_deref()
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    fn resolved(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    pub fn make_response(&mut self, buff: &mut Buffer) {
        match fs::metadata(self.resolved()) {
            Err(_) => self.code = 404,
            Ok(meta) if meta.is_dir() => self.code = 404,
            // 200 requires the file to be world-readable.
            Ok(meta) if meta.mode() & 0o004 == 0 => self.code = 403,
            Ok(meta) => {
                if self.code == 200 {
                    self.file_len = meta.len();
                }
            }
        }
        self.swap_in_error_page();
        self.add_state_line(buff);
        self.add_header(buff);
        self.add_content(buff);
    }

    /// Non-200 codes serve their canonical page instead of the
    /// requested path.
    fn swap_in_error_page(&mut self) {
        if let Some(page) = error_page(self.code) {
            self.path = page.to_string();
            self.file_len = fs::metadata(self.resolved()).map(|m| m.len()).unwrap_or(0);
        }
    }

    fn add_state_line(&mut self, buff: &mut Buffer) {
        let reason = match status_reason(self.code) {
            Some(reason) => reason,
            None => {
                self.code = 400;
                status_reason(400).unwrap()
            }
        };
        buff.append(format!("HTTP/1.1 {} {}\r\n", self.code, reason).as_bytes());
    }

    fn add_header(&mut self, buff: &mut Buffer) {
        buff.append(b"Connection: ");
        if self.keep_alive {
            buff.append(b"keep-alive\r\n");
            buff.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buff.append(b"close\r\n");
        }
        buff.append(format!("Content-type: {}\r\n", content_type(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buff: &mut Buffer) {
        let file = match File::open(self.resolved()) {
            Ok(f) => f,
            Err(_) => {
                self.error_content(buff, "File NotFound!");
                return;
            }
        };
        // Read-only private mapping; the raw bytes become the second
        // element of the connection's scatter-gather vector.
        match unsafe { MmapOptions::new().map_copy_read_only(&file) } {
            Ok(map) => {
                self.file_len = map.len() as u64;
                self.mmap = Some(map);
                buff.append(format!("Content-length: {}\r\n\r\n", self.file_len).as_bytes());
            }
            Err(_) => self.error_content(buff, "File NotFound!"),
        }
    }

    /// Inline HTML body for when no page could be mapped.
    pub fn error_content(&mut self, buff: &mut Buffer, message: &str) {
        self.unmap();
        let reason = status_reason(self.code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>breakwater</em></body></html>",
            self.code, reason, message
        );
        buff.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buff.append(body.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_page(dir: &Path, name: &str, contents: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        let mut perm = f.metadata().unwrap().permissions();
        perm.set_mode(0o644);
        f.set_permissions(perm).unwrap();
    }

    fn response_text(buff: &mut Buffer) -> String {
        buff.retrieve_all_to_string()
    }

    #[test]
    fn existing_file_is_served_with_length_and_mapping() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "index.html", "hello");

        let mut resp = HttpResponse::new();
        let mut buff = Buffer::new();
        resp.init(dir.path(), "/index.html", false, 200);
        resp.make_response(&mut buff);

        let head = response_text(&mut buff);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.ends_with("Content-length: 5\r\n\r\n"));
        assert_eq!(resp.file(), Some(&b"hello"[..]));
        assert_eq!(resp.file_len(), 5);
    }

    #[test]
    fn keep_alive_adds_the_max_timeout_header() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "index.html", "hi");

        let mut resp = HttpResponse::new();
        let mut buff = Buffer::new();
        resp.init(dir.path(), "/index.html", true, 200);
        resp.make_response(&mut buff);

        let head = response_text(&mut buff);
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
    }

    #[test]
    fn missing_file_serves_the_404_page() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "404.html", "gone");

        let mut resp = HttpResponse::new();
        let mut buff = Buffer::new();
        resp.init(dir.path(), "/missing.html", false, 200);
        resp.make_response(&mut buff);

        assert_eq!(resp.code(), 404);
        let head = response_text(&mut buff);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(resp.file(), Some(&b"gone"[..]));
    }

    #[test]
    fn directory_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let mut resp = HttpResponse::new();
        let mut buff = Buffer::new();
        resp.init(dir.path(), "/sub", false, 200);
        resp.make_response(&mut buff);
        assert_eq!(resp.code(), 404);
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "secret.html", "top");
        let path = dir.path().join("secret.html");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();

        let mut resp = HttpResponse::new();
        let mut buff = Buffer::new();
        resp.init(dir.path(), "/secret.html", false, 200);
        resp.make_response(&mut buff);
        assert_eq!(resp.code(), 403);
    }

    #[test]
    fn missing_error_page_falls_back_to_inline_html() {
        let dir = tempfile::tempdir().unwrap();

        let mut resp = HttpResponse::new();
        let mut buff = Buffer::new();
        resp.init(dir.path(), "/nope", false, 200);
        resp.make_response(&mut buff);

        assert_eq!(resp.code(), 404);
        assert!(resp.file().is_none());
        let text = response_text(&mut buff);
        assert!(text.contains("<html>"));
        assert!(text.contains("404 : Not Found"));
    }

    #[test]
    fn reinit_drops_the_previous_mapping() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "a.html", "aaaa");

        let mut resp = HttpResponse::new();
        let mut buff = Buffer::new();
        resp.init(dir.path(), "/a.html", false, 200);
        resp.make_response(&mut buff);
        assert!(resp.file().is_some());

        resp.init(dir.path(), "/a.html", false, 200);
        assert!(resp.file().is_none());
        assert_eq!(resp.file_len(), 0);
    }
}
