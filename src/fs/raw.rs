//! Raw dump files: the full wire form of a message, readable and writable.

use crate::{
    error::{FsError, FsResult},
    fs::value::{MODE_RW, check_readable, check_writable},
    message::{Request, Response},
};

/// Wire-form view of a request.
///
/// Writing a parseable request replaces every field of the underlying
/// message in place, so the other nodes over the same message observe the
/// new values.
#[derive(Debug, Clone)]
pub struct RawRequestFile {
    request: Request,
    mode: u32,
}

impl RawRequestFile {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        self.request.to_wire().map_err(|_| FsError::NoData)
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        self.request
            .replace_from_wire(data)
            .map_err(|_| FsError::OutOfRange)?;
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> FsResult<u64> {
        let wire = self.request.to_wire().map_err(|_| FsError::NoData)?;
        Ok(wire.len() as u64)
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}

/// Wire-form view of a response; the parse is bound to the owning request.
#[derive(Debug, Clone)]
pub struct RawResponseFile {
    response: Response,
    mode: u32,
}

impl RawResponseFile {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            mode: MODE_RW,
        }
    }

    pub(crate) fn read(&self) -> FsResult<Vec<u8>> {
        check_readable(self.mode)?;
        self.response.to_wire().map_err(|_| FsError::NoData)
    }

    pub(crate) fn write(&self, data: &[u8]) -> FsResult<usize> {
        check_writable(self.mode)?;
        self.response
            .replace_from_wire(data)
            .map_err(|_| FsError::OutOfRange)?;
        Ok(data.len())
    }

    pub(crate) fn size(&self) -> FsResult<u64> {
        let wire = self.response.to_wire().map_err(|_| FsError::NoData)?;
        Ok(wire.len() as u64)
    }

    pub(crate) fn mode(&self) -> u32 {
        self.mode
    }
}
