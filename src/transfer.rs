//! Streaming directory transfer.
//!
//! Moves a directory tree between filesystems without a rename and without
//! staging an archive on disk. A producer walks the source tree and writes
//! a tar stream into a bounded channel; a consumer reads the stream and
//! recreates each entry under the destination. Both sides run on blocking
//! threads so a slow consumer applies backpressure to the walk.
//!
//! ```text
//! walkdir ──→ tar::Builder ──→ [bounded channel] ──→ tar::Archive ──→ dest
//! ```
//!
//! Entries are emitted in walk order, so a directory always precedes its
//! children and the first path of a hard-linked inode precedes its links.
//! Partial output is left in place on failure.

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::fs::{self, File, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Size of a chunk handed from producer to consumer.
const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks that may be in flight before the producer blocks.
const CHANNEL_DEPTH: usize = 16;

/// Unit of the archive stream. An `Err` ends the stream with that error.
type Chunk = io::Result<Vec<u8>>;

/// `Write` half of the archive stream.
struct ChannelWriter {
    tx: Sender<Chunk>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: Sender<Chunk>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx
            .send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer hung up"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// `Read` half of the archive stream.
struct ChannelReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Chunk>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                // Producer finished and dropped its sender.
                Err(_) => return Ok(0),
            }
        }

        let n = (self.current.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Copy the tree rooted at `src` into `dest`, creating `dest` if needed.
///
/// Directories, regular files, hard links and symlinks are recreated with
/// their modes. Other node types are skipped.
pub async fn copy_dir(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref().to_path_buf();
    let dest = dest.as_ref().to_path_buf();

    let meta = tokio::fs::metadata(&src).await?;
    if !meta.is_dir() {
        return Err(Error::Transfer(format!(
            "source is not a directory: {}",
            src.display()
        )));
    }
    tokio::fs::create_dir_all(&dest).await?;

    info!(src = %src.display(), dest = %dest.display(), "Copying directory");

    let (tx, rx) = crossbeam_channel::bounded(CHANNEL_DEPTH);
    let producer = tokio::task::spawn_blocking(move || produce(&src, tx));
    let consumer = tokio::task::spawn_blocking(move || consume(ChannelReader::new(rx), &dest));

    let (produced, consumed) = tokio::join!(producer, consumer);
    let produced =
        produced.map_err(|e| Error::Transfer(format!("archive producer task failed: {}", e)))?;
    let consumed =
        consumed.map_err(|e| Error::Transfer(format!("archive consumer task failed: {}", e)))?;

    match (produced, consumed) {
        // A broken pipe only means the consumer stopped reading.
        (Err(e), _) if e.kind() != io::ErrorKind::BrokenPipe => Err(e.into()),
        (_, consumed) => consumed,
    }
}

/// Producer side: stream `src` as a tar archive. On failure the error is
/// also pushed into the stream so the consumer stops with it.
fn produce(src: &Path, tx: Sender<Chunk>) -> io::Result<()> {
    let error_tx = tx.clone();
    let result = write_archive(src, ChannelWriter::new(tx));

    if let Err(ref e) = result {
        if e.kind() != io::ErrorKind::BrokenPipe {
            let _ = error_tx.send(Err(io::Error::new(e.kind(), e.to_string())));
        }
    }
    result
}

fn write_archive(src: &Path, writer: ChannelWriter) -> io::Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    // First archived path of each multiply-linked inode.
    let mut inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let meta = entry.metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            debug!(path = %rel.display(), "Archiving directory");
            builder.append_dir(rel, entry.path())?;
        } else if file_type.is_file() {
            if meta.nlink() > 1 {
                let inode = (meta.dev(), meta.ino());
                if let Some(target) = inodes.get(&inode) {
                    debug!(path = %rel.display(), target = %target.display(), "Archiving hard link");
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_size(0);
                    header.set_mode(meta.mode());
                    header.set_mtime(meta.mtime().max(0) as u64);
                    builder.append_link(&mut header, rel, target)?;
                    continue;
                }
                inodes.insert(inode, rel.to_path_buf());
            }
            debug!(path = %rel.display(), "Archiving file");
            builder.append_path_with_name(entry.path(), rel)?;
        } else if file_type.is_symlink() {
            debug!(path = %rel.display(), "Archiving symlink");
            builder.append_path_with_name(entry.path(), rel)?;
        } else {
            debug!(path = %rel.display(), "Skipping special file");
        }
    }

    let mut writer = builder.into_inner()?;
    writer.flush()
}

/// Reject absolute paths and `..` so entries stay under the destination.
fn safe_relative(path: &Path) -> io::Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsafe archive path: {}", path.display()),
                ))
            }
        }
    }
    Ok(out)
}

/// Consumer side: materialize the archive under `dest`.
fn consume<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    // Directory modes are applied last so read-only directories can still
    // receive their children.
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = safe_relative(&entry.path()?)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let path = dest.join(&rel);
        let mode = entry.header().mode()?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                debug!(path = %path.display(), "Creating directory");
                fs::create_dir_all(&path)?;
                dir_modes.push((path, mode));
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                debug!(path = %path.display(), "Writing file");
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&path)?;
                io::copy(&mut entry, &mut file)?;
                fs::set_permissions(&path, Permissions::from_mode(mode))?;
            }
            tar::EntryType::Link => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| Error::Transfer(format!("hard link without target: {}", rel.display())))?;
                let target = dest.join(safe_relative(&target)?);
                debug!(path = %path.display(), target = %target.display(), "Linking file");
                fs::hard_link(&target, &path)?;
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| Error::Transfer(format!("symlink without target: {}", rel.display())))?;
                debug!(path = %path.display(), target = %target.display(), "Creating symlink");
                std::os::unix::fs::symlink(&target, &path)?;
            }
            other => {
                debug!(path = %path.display(), entry_type = ?other, "Skipping unsupported entry");
            }
        }
    }

    for (path, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&path, Permissions::from_mode(mode))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_roundtrip_bytes() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let handle = std::thread::spawn(move || {
            let mut writer = ChannelWriter::new(tx);
            let data = vec![7u8; CHUNK_SIZE * 3 + 17];
            writer.write_all(&data).unwrap();
            writer.flush().unwrap();
        });

        let mut reader = ChannelReader::new(rx);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        handle.join().unwrap();

        assert_eq!(out.len(), CHUNK_SIZE * 3 + 17);
        assert!(out.iter().all(|b| *b == 7));
    }

    #[test]
    fn test_reader_surfaces_injected_error() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        tx.send(Ok(vec![1, 2, 3])).unwrap();
        tx.send(Err(io::Error::new(io::ErrorKind::Other, "walk failed")))
            .unwrap();
        drop(tx);

        let mut reader = ChannelReader::new(rx);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.to_string(), "walk failed");
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_writer_reports_hung_up_consumer() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        let mut writer = ChannelWriter::new(tx);
        writer.write_all(b"data").unwrap();
        let err = writer.flush().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(
            safe_relative(Path::new("./d/a.txt")).unwrap(),
            PathBuf::from("d/a.txt")
        );
        assert!(safe_relative(Path::new("../etc/passwd")).is_err());
        assert!(safe_relative(Path::new("/etc/passwd")).is_err());
    }
}
