// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Positional writes into the destination file.

use std::{fs::File, io};

/// A sink that accepts writes at absolute offsets, so concurrent workers
/// never share a cursor.
pub trait WriterAt: Send + Sync + 'static {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Reserve `size` bytes up front. Best effort.
    fn preallocate(&self, _size: u64) -> io::Result<()> { Ok(()) }
}

impl WriterAt for File {
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.seek_write(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn preallocate(&self, size: u64) -> io::Result<()> { self.set_len(size) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.bin");
        let file = File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.preallocate(8).unwrap();
        file.write_at(b"5678", 4).unwrap();
        file.write_at(b"1234", 0).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"12345678");
    }
}
