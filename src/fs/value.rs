//! Typed value files over shared cells.
//!
//! Each file renders one primitive as text on read and parses trimmed text
//! on write. A rejected write leaves the cell unchanged; a successful write
//! reports the full input length as consumed.

use std::str::FromStr;

use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use regex::Regex;
use tokio::sync::watch;

use crate::{
    error::{FsError, FsResult},
    message::Cell,
};

/// Default mode for value files.
pub(crate) const MODE_RW: u32 = 0o666;

pub(crate) fn check_readable(mode: u32) -> FsResult<()> {
    if mode & 0o444 == 0 {
        return Err(FsError::PermissionDenied);
    }
    Ok(())
}

pub(crate) fn check_writable(mode: u32) -> FsResult<()> {
    if mode & 0o222 == 0 {
        return Err(FsError::PermissionDenied);
    }
    Ok(())
}

/// Decodes the write payload as UTF-8 and trims ASCII whitespace.
fn write_text(data: &[u8]) -> FsResult<&str> {
    let text = std::str::from_utf8(data).map_err(|_| FsError::OutOfRange)?;
    Ok(text.trim_ascii())
}

/// A file over a shared string cell.
#[derive(Debug, Clone)]
pub struct StrFile {
    cell: Cell<String>,
    mode: u32,
}

impl StrFile {
    pub fn new(cell: Cell<String>) -> Self {
        Self {
            cell,
            mode: MODE_RW,
        }
    }

    /// Like [`StrFile::new`] with explicit mode bits.
    pub fn with_mode(cell: Cell<String>, mode: u32) -> Self {
        Self { cell, mode }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        Ok(self.cell.read().as_bytes().to_vec())
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let text = write_text(data)?;
        self.cell.set(text.to_owned());
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> u64 {
        self.cell.read().len() as u64
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}

/// A file over a shared i32 cell, rendered as decimal.
#[derive(Debug, Clone)]
pub struct IntFile {
    cell: Cell<i32>,
    mode: u32,
}

impl IntFile {
    pub fn new(cell: Cell<i32>) -> Self {
        Self {
            cell,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        Ok(self.cell.read().to_string().into_bytes())
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let value: i32 = write_text(data)?.parse().map_err(|_| FsError::OutOfRange)?;
        self.cell.set(value);
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> u64 {
        self.cell.read().to_string().len() as u64
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}

/// A file over a shared i64 cell, rendered as decimal.
#[derive(Debug, Clone)]
pub struct Int64File {
    cell: Cell<i64>,
    mode: u32,
}

impl Int64File {
    pub fn new(cell: Cell<i64>) -> Self {
        Self {
            cell,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        Ok(self.cell.read().to_string().into_bytes())
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let value: i64 = write_text(data)?.parse().map_err(|_| FsError::OutOfRange)?;
        self.cell.set(value);
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> u64 {
        self.cell.read().to_string().len() as u64
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}

/// A file over a shared bool cell, rendered as `"0"` or `"1"`.
///
/// An optional change sink notifies the intercept dispatcher; only writes
/// that alter the value publish, and in-flight notifications coalesce.
#[derive(Debug, Clone)]
pub struct BoolFile {
    cell: Cell<bool>,
    mode: u32,
    change: Option<watch::Sender<bool>>,
}

impl BoolFile {
    pub fn new(cell: Cell<bool>) -> Self {
        Self {
            cell,
            mode: MODE_RW,
            change: None,
        }
    }

    /// Like [`BoolFile::new`] with a change sink.
    pub fn with_change(cell: Cell<bool>, change: watch::Sender<bool>) -> Self {
        Self {
            cell,
            mode: MODE_RW,
            change: Some(change),
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        Ok(if *self.cell.read() { b"1".to_vec() } else { b"0".to_vec() })
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let value = match write_text(data)? {
            "0" => false,
            "1" => true,
            _ => return Err(FsError::OutOfRange),
        };
        let changed = {
            let mut cell = self.cell.write();
            let changed = *cell != value;
            *cell = value;
            changed
        };
        if changed && let Some(change) = &self.change {
            change.send_replace(value);
        }
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> u64 {
        1
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}

/// A file over a shared regex cell, rendered as the pattern source.
#[derive(Debug, Clone)]
pub struct RegexFile {
    cell: Cell<Regex>,
    mode: u32,
}

impl RegexFile {
    pub fn new(cell: Cell<Regex>) -> Self {
        Self {
            cell,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        Ok(self.cell.read().as_str().as_bytes().to_vec())
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let pattern = Regex::new(write_text(data)?).map_err(|_| FsError::OutOfRange)?;
        self.cell.set(pattern);
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> u64 {
        self.cell.read().as_str().len() as u64
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}

/// A file over a shared URI cell, rendered in string form.
#[derive(Debug, Clone)]
pub struct UriFile {
    cell: Cell<Uri>,
    mode: u32,
}

impl UriFile {
    pub fn new(cell: Cell<Uri>) -> Self {
        Self {
            cell,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        Ok(self.cell.read().to_string().into_bytes())
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let uri = Uri::from_str(write_text(data)?).map_err(|_| FsError::OutOfRange)?;
        self.cell.set(uri);
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> u64 {
        self.cell.read().to_string().len() as u64
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}

/// A string file over the first value of one header in a shared map.
///
/// The map cell is shared with the message, so the file observes headers
/// that appear or vanish when the wrapping message is replaced.
#[derive(Debug, Clone)]
pub struct HeaderFile {
    headers: Cell<HeaderMap>,
    name: HeaderName,
    mode: u32,
}

impl HeaderFile {
    pub fn new(headers: Cell<HeaderMap>, name: HeaderName) -> Self {
        Self {
            headers,
            name,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        let headers = self.headers.read();
        let value = headers.get(&self.name).ok_or(FsError::NotFound)?;
        Ok(value.as_bytes().to_vec())
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        let value = HeaderValue::from_str(write_text(data)?).map_err(|_| FsError::OutOfRange)?;
        self.headers.write().insert(self.name.clone(), value);
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> FsResult<u64> {
        let headers = self.headers.read();
        let value = headers.get(&self.name).ok_or(FsError::NotFound)?;
        Ok(value.len() as u64)
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_write_then_read() {
        let cell = Cell::new(false);
        let file = BoolFile::new(cell.clone());
        assert_eq!(file.write(b"1\n").unwrap(), 2);
        assert_eq!(file.read().unwrap(), b"1");
        assert!(*cell.read());
    }

    #[test]
    fn bool_rejects_other_text() {
        let file = BoolFile::new(Cell::new(true));
        assert!(matches!(file.write(b"yes"), Err(FsError::OutOfRange)));
        assert_eq!(file.read().unwrap(), b"1");
    }

    #[test]
    fn bool_change_sink_fires_only_on_change() {
        let (tx, rx) = watch::channel(false);
        let file = BoolFile::with_change(Cell::new(false), tx);
        file.write(b"0").unwrap();
        assert!(!rx.has_changed().unwrap());
        file.write(b"1").unwrap();
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn int_round_trip_and_rejection() {
        let cell = Cell::new(0i64);
        let file = Int64File::new(cell.clone());
        file.write(b"  42\n").unwrap();
        assert_eq!(file.read().unwrap(), b"42");
        assert_eq!(file.size(), 2);
        assert!(matches!(file.write(b"4x2"), Err(FsError::OutOfRange)));
        assert_eq!(*cell.read(), 42);
    }

    #[test]
    fn regex_parse_failure_keeps_previous_pattern() {
        let file = RegexFile::new(Cell::new(Regex::new("^a+$").unwrap()));
        assert!(matches!(file.write(b"["), Err(FsError::OutOfRange)));
        assert_eq!(file.read().unwrap(), b"^a+$");
    }

    #[test]
    fn uri_round_trip() {
        let file = UriFile::new(Cell::new(Uri::from_static("http://a/x")));
        file.write(b"http://example.com/path?q=1\n").unwrap();
        assert_eq!(file.read().unwrap(), b"http://example.com/path?q=1");
    }

    #[test]
    fn header_file_reads_first_value_and_writes_back() {
        let mut map = HeaderMap::new();
        map.append("x-test", HeaderValue::from_static("one"));
        map.append("x-test", HeaderValue::from_static("two"));
        let cell = Cell::new(map);
        let file = HeaderFile::new(cell.clone(), HeaderName::from_static("x-test"));
        assert_eq!(file.read().unwrap(), b"one");
        file.write(b"three\n").unwrap();
        assert_eq!(cell.read().get("x-test").unwrap(), "three");
    }

    #[test]
    fn header_file_missing_header_is_not_found() {
        let file = HeaderFile::new(Cell::new(HeaderMap::new()), HeaderName::from_static("gone"));
        assert!(matches!(file.read(), Err(FsError::NotFound)));
    }

    #[test]
    fn read_only_mode_rejects_writes() {
        let file = StrFile::with_mode(Cell::new("fixed".to_owned()), 0o444);
        assert!(matches!(file.write(b"nope"), Err(FsError::PermissionDenied)));
        assert_eq!(file.read().unwrap(), b"fixed");
    }
}
