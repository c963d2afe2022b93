//! src/file_device/archive.rs
//! SARC and BEA archive readers . Both present themselves as ordinary [`super::FileDevice`]s —
//! their "path" is just an entry name inside the archive's own dictionary,
//! looked up by hash instead of walking a host directory.

use memmap2::Mmap;

use crate::file_device::{hash_path, FileDevice, OpenFile};
use crate::glue::result::{Code, Module, Result, ResultCode};

/// `SARC`: hashed-name entry lookup returning `(data-pointer, data-size)`.
/// No decompression; entries are stored uncompressed .
pub struct SarcArchive {
    data: Mmap,
    entries: std::collections::HashMap<u32, (u32, u32)>,
}

impl SarcArchive {
    /// `entries` is `(name_hash, offset, size)` triples, already parsed from
    /// the archive's header by the caller — header layout is archive-format
    /// plumbing the resource pipeline owns, not this reader's concern.
    pub fn from_mmap(data: Mmap, entries: impl IntoIterator<Item = (u32, u32, u32)>) -> Self {
        Self {
            data,
            entries: entries.into_iter().map(|(h, o, s)| (h, (o, s))).collect(),
        }
    }

    fn find(&self, relative_path: &str) -> Option<(u32, u32)> {
        self.entries.get(&hash_path(relative_path)).copied()
    }
}

struct SliceFile {
    bytes: Vec<u8>,
}

impl OpenFile for SliceFile {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return Ok(0);
        }
        let available = &self.bytes[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn write(&mut self, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(ResultCode::new(Module::Res, Code::InvalidFile))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl FileDevice for SarcArchive {
    fn open_file(&self, relative_path: &str) -> Result<Box<dyn OpenFile>> {
        let (offset, size) = self.find(relative_path).ok_or_else(|| ResultCode::new(Module::Res, Code::FileNotFound))?;
        let (offset, size) = (offset as usize, size as usize);
        let slice = self
            .data
            .get(offset..offset + size)
            .ok_or_else(|| ResultCode::new(Module::Res, Code::InvalidFile))?;
        Ok(Box::new(SliceFile { bytes: slice.to_vec() }))
    }

    fn file_size(&self, relative_path: &str) -> Result<u64> {
        self.find(relative_path)
            .map(|(_, size)| size as u64)
            .ok_or_else(|| ResultCode::new(Module::Res, Code::FileNotFound))
    }

    fn file_exists(&self, relative_path: &str) -> bool {
        self.find(relative_path).is_some()
    }

    fn open_directory(&self, _relative_path: &str) -> Result<Vec<String>> {
        Err(ResultCode::new(Module::Res, Code::PathNotFound))
    }
}

/// Per-file compression as declared in a BEA entry (: "per-file
/// compression type (None, Zstandard, Zlib — Zlib is not supported and
/// must be rejected)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaCompression {
    None,
    Zstandard,
    Zlib,
}

#[derive(Debug, Clone, Copy)]
pub struct BeaEntry {
    pub offset: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub alignment: u32,
    pub compression: BeaCompression,
}

/// `BEA`: a fixed relocatable header indexed by dictionary entry, looked up
/// by either path string or numeric index .
pub struct BeaArchive {
    data: Mmap,
    by_path: std::collections::HashMap<u32, BeaEntry>,
    by_index: Vec<BeaEntry>,
}

impl BeaArchive {
    pub fn from_mmap(data: Mmap, entries: impl IntoIterator<Item = (String, BeaEntry)>) -> Self {
        let mut by_path = std::collections::HashMap::new();
        let mut by_index = Vec::new();
        for (path, entry) in entries {
            by_path.insert(hash_path(&path), entry);
            by_index.push(entry);
        }
        Self { data, by_path, by_index }
    }

    pub fn entry_by_index(&self, index: usize) -> Option<&BeaEntry> {
        self.by_index.get(index)
    }

    fn find(&self, relative_path: &str) -> Option<&BeaEntry> {
        self.by_path.get(&hash_path(relative_path))
    }

    /// Decodes one entry's bytes, rejecting Zlib outright .
    fn decode(&self, entry: &BeaEntry) -> Result<Vec<u8>> {
        let start = entry.offset as usize;
        let end = start + entry.compressed_size as usize;
        let raw = self.data.get(start..end).ok_or_else(|| ResultCode::new(Module::Res, Code::InvalidFile))?;
        match entry.compression {
            BeaCompression::None => Ok(raw.to_vec()),
            BeaCompression::Zstandard => {
                zstd::stream::decode_all(raw).map_err(|_| ResultCode::new(Module::Res, Code::InvalidFile))
            }
            BeaCompression::Zlib => Err(ResultCode::new(Module::Res, Code::InvalidFile)),
        }
    }
}

impl FileDevice for BeaArchive {
    fn open_file(&self, relative_path: &str) -> Result<Box<dyn OpenFile>> {
        let entry = self.find(relative_path).ok_or_else(|| ResultCode::new(Module::Res, Code::FileNotFound))?;
        Ok(Box::new(SliceFile { bytes: self.decode(entry)? }))
    }

    fn file_size(&self, relative_path: &str) -> Result<u64> {
        self.find(relative_path)
            .map(|e| e.uncompressed_size as u64)
            .ok_or_else(|| ResultCode::new(Module::Res, Code::FileNotFound))
    }

    fn file_exists(&self, relative_path: &str) -> bool {
        self.find(relative_path).is_some()
    }

    fn open_directory(&self, _relative_path: &str) -> Result<Vec<String>> {
        Err(ResultCode::new(Module::Res, Code::PathNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn mmap_of(bytes: &[u8]) -> Mmap {
        let mut file = tempfile_like();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        unsafe { Mmap::map(&file).unwrap() }
    }

    fn tempfile_like() -> std::fs::File {
        let path = std::env::temp_dir().join(format!("ukern-archive-test-{}-{}", std::process::id(), rand::random::<u32>()));
        std::fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path).unwrap()
    }

    #[test]
    fn sarc_looks_up_entries_by_name_hash() {
        let payload = b"uncompressed-entry-bytes";
        let mmap = mmap_of(payload);
        let archive = SarcArchive::from_mmap(mmap, vec![(hash_path("a/b.txt"), 0, payload.len() as u32)]);
        assert!(archive.file_exists("a/b.txt"));
        let mut file = archive.open_file("a/b.txt").unwrap();
        let mut buf = vec![0u8; payload.len()];
        let n = file.read(0, &mut buf).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&buf, payload);
    }

    #[test]
    fn bea_rejects_zlib_compression() {
        let mmap = mmap_of(b"irrelevant-bytes-here");
        let entry = BeaEntry { offset: 0, compressed_size: 4, uncompressed_size: 4, alignment: 1, compression: BeaCompression::Zlib };
        let archive = BeaArchive::from_mmap(mmap, vec![("z.bin".to_string(), entry)]);
        assert!(archive.open_file("z.bin").is_err());
    }

    #[test]
    fn bea_passes_through_uncompressed_entries() {
        let payload = b"plain";
        let mmap = mmap_of(payload);
        let entry = BeaEntry { offset: 0, compressed_size: payload.len() as u32, uncompressed_size: payload.len() as u32, alignment: 1, compression: BeaCompression::None };
        let archive = BeaArchive::from_mmap(mmap, vec![("p.bin".to_string(), entry)]);
        let mut file = archive.open_file("p.bin").unwrap();
        let mut buf = vec![0u8; payload.len()];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, payload);
    }
}
