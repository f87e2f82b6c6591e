//! Transparent compression for sequence inputs and tabular outputs.
//!
//! Readers are wrapped with a decompressor chosen from the file extension
//! first, then from the leading magic bytes, so a `reads.fq` that is secretly
//! gzip still opens correctly. Writers are chosen from the extension only.
//!
//! ## Codecs
//! - **Gzip** (`.gz`) via `flate2`: always available; multi-member streams
//!   (as produced by `cat a.gz b.gz`) are read to the end.
//! - **Zstd** (`.zst`): feature `compression-zstd`
//! - **Bzip2** (`.bz2`): feature `compression-bzip2`
//! - **Xz** (`.xz`): feature `compression-xz`
//!
//! ```no_run
//! use ampbeam::io::compression::{create_writer, open_reader};
//! use std::io::{BufRead, Write};
//! # fn main() -> anyhow::Result<()> {
//! let mut w = create_writer("out/prediction.tsv.gz")?;
//! writeln!(w, "Access\tSequence")?;
//! drop(w);
//!
//! let r = open_reader("out/prediction.tsv.gz")?;
//! assert_eq!(r.lines().count(), 1);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use std::fs::{File, create_dir_all};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Boxed decompressing reader handed to parsers.
pub type DynBufRead = Box<dyn BufRead + Send>;

/// Boxed compressing writer.
pub type DynWrite = Box<dyn Write + Send>;

/// A supported compression format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    #[cfg(feature = "compression-zstd")]
    Zstd,
    #[cfg(feature = "compression-bzip2")]
    Bzip2,
    #[cfg(feature = "compression-xz")]
    Xz,
}

/// Every codec compiled into this build, in detection order.
const CODECS: &[Codec] = &[
    Codec::Gzip,
    #[cfg(feature = "compression-zstd")]
    Codec::Zstd,
    #[cfg(feature = "compression-bzip2")]
    Codec::Bzip2,
    #[cfg(feature = "compression-xz")]
    Codec::Xz,
];

impl Codec {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => "zstd",
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => "bzip2",
            #[cfg(feature = "compression-xz")]
            Codec::Xz => "xz",
        }
    }

    const fn extensions(self) -> &'static [&'static str] {
        match self {
            Codec::Gzip => &[".gz", ".gzip"],
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => &[".zst", ".zstd"],
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => &[".bz2", ".bzip2"],
            #[cfg(feature = "compression-xz")]
            Codec::Xz => &[".xz"],
        }
    }

    const fn magic(self) -> &'static [u8] {
        match self {
            Codec::Gzip => &[0x1f, 0x8b],
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => b"BZh",
            #[cfg(feature = "compression-xz")]
            Codec::Xz => &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00],
        }
    }

    /// Codec implied by the file name, compared case-insensitively.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Option<Codec> {
        let name = path.as_ref().to_string_lossy().to_lowercase();
        CODECS
            .iter()
            .copied()
            .find(|codec| codec.extensions().iter().any(|ext| name.ends_with(ext)))
    }

    /// Codec whose signature prefixes `head`.
    #[must_use]
    pub fn sniff(head: &[u8]) -> Option<Codec> {
        CODECS.iter().copied().find(|codec| head.starts_with(codec.magic()))
    }

    fn wrap_reader(self, reader: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(match self {
            Codec::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
            #[cfg(feature = "compression-xz")]
            Codec::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
        })
    }

    fn wrap_writer(self, writer: Box<dyn Write + Send>) -> io::Result<Box<dyn Write + Send>> {
        Ok(match self {
            Codec::Gzip => Box::new(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::default(),
            )),
            #[cfg(feature = "compression-zstd")]
            Codec::Zstd => Box::new(zstd::stream::write::Encoder::new(writer, 3)?.auto_finish()),
            #[cfg(feature = "compression-bzip2")]
            Codec::Bzip2 => Box::new(bzip2::write::BzEncoder::new(
                writer,
                bzip2::Compression::default(),
            )),
            #[cfg(feature = "compression-xz")]
            Codec::Xz => Box::new(xz2::write::XzEncoder::new(writer, 6)),
        })
    }
}

/// Wrap an already-open reader, detecting compression from `path_hint` or content.
///
/// # Errors
/// Returns an error if the stream header cannot be read or the decoder fails to start.
pub fn wrap_reader<R: Read + Send + 'static>(reader: R, path_hint: impl AsRef<Path>) -> Result<DynBufRead> {
    let path_hint = path_hint.as_ref();
    if let Some(codec) = Codec::from_path(path_hint) {
        let inner = codec
            .wrap_reader(Box::new(reader))
            .with_context(|| format!("start {} decoder for {}", codec.name(), path_hint.display()))?;
        return Ok(Box::new(BufReader::new(inner)));
    }

    let mut buffered = BufReader::new(reader);
    let head = buffered
        .fill_buf()
        .with_context(|| format!("peek header of {}", path_hint.display()))?;
    let detected = Codec::sniff(head);
    match detected {
        Some(codec) => {
            let inner = codec
                .wrap_reader(Box::new(buffered))
                .with_context(|| format!("start {} decoder for {}", codec.name(), path_hint.display()))?;
            Ok(Box::new(BufReader::new(inner)))
        }
        None => Ok(Box::new(buffered)),
    }
}

/// Open `path` for buffered reading, decompressing if needed.
///
/// # Errors
/// Returns an error if the file cannot be opened or its decoder fails to start.
pub fn open_reader(path: impl AsRef<Path>) -> Result<DynBufRead> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    wrap_reader(f, path)
}

/// Create `path` (and its parent directories) for writing, compressing by extension.
///
/// The compressor writes its trailer when the returned writer is dropped;
/// call `flush` first to surface buffered write errors.
///
/// # Errors
/// Returns an error if the file or its parent directories cannot be created.
pub fn create_writer(path: impl AsRef<Path>) -> Result<DynWrite> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let buffered: Box<dyn Write + Send> = Box::new(BufWriter::new(f));
    match Codec::from_path(path) {
        Some(codec) => codec
            .wrap_writer(buffered)
            .with_context(|| format!("start {} encoder for {}", codec.name(), path.display())),
        None => Ok(buffered),
    }
}
