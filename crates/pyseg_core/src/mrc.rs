//! MRC/MAP volume header probing.
//!
//! # Responsibility
//! - Report volume dimensions without loading voxel data.
//! - List the distinct values of small label volumes.
//!
//! # Invariants
//! - Header byte order follows the machine stamp (word 54); little-endian is
//!   assumed when the stamp is unset.
//! - A header with space group 0 and `nz > 1` is an image stack: it reports
//!   `z = 1, n = nz`.

use crate::error::ErrorKind;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = 1024;
const MACHINE_STAMP_OFFSET: usize = 212;

/// Extensions the PySeg programs read directly.
pub const MRC_EXTENSIONS: &[&str] = &["mrc", "map"];

/// Volume size in voxels plus number of images in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDims {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub n: u32,
}

impl VolumeDims {
    pub fn new(x: u32, y: u32, z: u32, n: u32) -> Self {
        Self { x, y, z, n }
    }

    pub fn xyz(&self) -> (u32, u32, u32) {
        (self.x, self.y, self.z)
    }
}

/// Depth of a volume, treating MRC image stacks as one volume.
pub fn manage_dims(file_name: &str, dims: VolumeDims) -> u32 {
    if has_mrc_extension(file_name) && dims.z == 1 && dims.n != 1 {
        dims.n
    } else {
        dims.z
    }
}

pub fn has_mrc_extension(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MRC_EXTENSIONS.contains(&ext))
}

/// Header probing failures.
#[derive(Debug)]
pub enum MrcError {
    Io { path: PathBuf, source: std::io::Error },
    InvalidHeader { path: PathBuf, message: String },
    UnsupportedMode { path: PathBuf, mode: i32 },
}

impl MrcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::InvalidHeader { .. } | Self::UnsupportedMode { .. } => ErrorKind::Format,
        }
    }
}

impl Display for MrcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::InvalidHeader { path, message } => {
                write!(f, "invalid MRC header in {}: {message}", path.display())
            }
            Self::UnsupportedMode { path, mode } => {
                write!(f, "unsupported MRC data mode {mode} in {}", path.display())
            }
        }
    }
}

impl Error for MrcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Source of volume dimensions.
///
/// Implemented by the MRC reader; tests substitute fixed tables.
pub trait VolumeProbe {
    fn dimensions(&self, path: &Path) -> Result<VolumeDims, MrcError>;
}

/// Reads dimensions from MRC headers on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct MrcHeaderProbe;

impl VolumeProbe for MrcHeaderProbe {
    fn dimensions(&self, path: &Path) -> Result<VolumeDims, MrcError> {
        read_dimensions(path)
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    nx: i32,
    ny: i32,
    nz: i32,
    mode: i32,
    ispg: i32,
    nsymbt: i32,
    big_endian: bool,
}

fn read_header(path: &Path) -> Result<Header, MrcError> {
    let io_err = |source| MrcError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut raw = [0u8; HEADER_LEN];
    file.read_exact(&mut raw).map_err(|source| match source.kind() {
        std::io::ErrorKind::UnexpectedEof => MrcError::InvalidHeader {
            path: path.to_path_buf(),
            message: "file shorter than 1024 bytes".to_string(),
        },
        _ => io_err(source),
    })?;

    // 0x11 0x11 in the first stamp byte marks big-endian writers.
    let big_endian = raw[MACHINE_STAMP_OFFSET] == 0x11;
    let word = |index: usize| {
        let bytes = &raw[index * 4..index * 4 + 4];
        if big_endian {
            BigEndian::read_i32(bytes)
        } else {
            LittleEndian::read_i32(bytes)
        }
    };

    let header = Header {
        nx: word(0),
        ny: word(1),
        nz: word(2),
        mode: word(3),
        ispg: word(22),
        nsymbt: word(23),
        big_endian,
    };
    if header.nx <= 0 || header.ny <= 0 || header.nz <= 0 {
        return Err(MrcError::InvalidHeader {
            path: path.to_path_buf(),
            message: format!(
                "non-positive dimensions {} x {} x {}",
                header.nx, header.ny, header.nz
            ),
        });
    }
    Ok(header)
}

/// Reads `(x, y, z, n)` from an MRC header.
pub fn read_dimensions(path: impl AsRef<Path>) -> Result<VolumeDims, MrcError> {
    let header = read_header(path.as_ref())?;
    let (nx, ny, nz) = (header.nx as u32, header.ny as u32, header.nz as u32);
    if header.ispg == 0 && nz > 1 {
        Ok(VolumeDims::new(nx, ny, 1, nz))
    } else {
        Ok(VolumeDims::new(nx, ny, nz, 1))
    }
}

/// Returns the sorted distinct voxel values of an integer label volume.
///
/// Float volumes (mode 2) are accepted when their values are integral;
/// fractional values are truncated.
pub fn read_label_values(path: impl AsRef<Path>) -> Result<Vec<i64>, MrcError> {
    let path = path.as_ref();
    let header = read_header(path)?;
    let io_err = |source| MrcError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let data_offset = HEADER_LEN as u64 + header.nsymbt.max(0) as u64;
    file.seek(SeekFrom::Start(data_offset)).map_err(io_err)?;
    let mut reader = BufReader::new(file);

    let voxels = header.nx as u64 * header.ny as u64 * header.nz as u64;
    let mut values = BTreeSet::new();
    for _ in 0..voxels {
        let value = if header.big_endian {
            read_voxel::<BigEndian>(&mut reader, header.mode)
        } else {
            read_voxel::<LittleEndian>(&mut reader, header.mode)
        };
        match value {
            Ok(Some(value)) => {
                values.insert(value);
            }
            Ok(None) => {
                return Err(MrcError::UnsupportedMode {
                    path: path.to_path_buf(),
                    mode: header.mode,
                })
            }
            Err(source) => return Err(io_err(source)),
        }
    }
    Ok(values.into_iter().collect())
}

fn read_voxel<B: ByteOrder>(reader: &mut impl Read, mode: i32) -> std::io::Result<Option<i64>> {
    let value = match mode {
        0 => i64::from(reader.read_i8()?),
        1 => i64::from(reader.read_i16::<B>()?),
        2 => reader.read_f32::<B>()? as i64,
        6 => i64::from(reader.read_u16::<B>()?),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::{
        has_mrc_extension, manage_dims, read_dimensions, read_label_values, MrcError, VolumeDims,
        HEADER_LEN, MACHINE_STAMP_OFFSET,
    };
    use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    /// Writes a minimal little-endian MRC file.
    fn write_test_volume(
        path: impl AsRef<Path>,
        dims: (u32, u32, u32),
        space_group: i32,
        voxels: &[i16],
    ) -> std::io::Result<()> {
        let mut header = [0u8; HEADER_LEN];
        LittleEndian::write_i32(&mut header[0..4], dims.0 as i32);
        LittleEndian::write_i32(&mut header[4..8], dims.1 as i32);
        LittleEndian::write_i32(&mut header[8..12], dims.2 as i32);
        LittleEndian::write_i32(&mut header[12..16], 1);
        LittleEndian::write_i32(&mut header[88..92], space_group);
        header[208..212].copy_from_slice(b"MAP ");
        header[MACHINE_STAMP_OFFSET] = 0x44;
        header[MACHINE_STAMP_OFFSET + 1] = 0x44;

        let mut file = std::io::BufWriter::new(File::create(path)?);
        file.write_all(&header)?;
        for voxel in voxels {
            file.write_i16::<LittleEndian>(*voxel)?;
        }
        file.flush()
    }

    #[test]
    fn reads_volume_dimensions() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("vol.mrc");
        write_test_volume(&path, (4, 3, 2), 1, &[0; 24]).expect("write volume");
        assert_eq!(read_dimensions(&path).expect("header"), VolumeDims::new(4, 3, 2, 1));
    }

    #[test]
    fn reports_image_stacks_as_single_slices() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("stack.mrc");
        write_test_volume(&path, (2, 2, 5), 0, &[0; 20]).expect("write stack");
        let dims = read_dimensions(&path).expect("header");
        assert_eq!(dims, VolumeDims::new(2, 2, 1, 5));
        assert_eq!(manage_dims("stack.mrc", dims), 5);
        assert_eq!(manage_dims("stack.em", dims), 1);
    }

    #[test]
    fn lists_distinct_label_values() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("labels.mrc");
        write_test_volume(&path, (2, 2, 2), 1, &[0, 2, 2, 1, 0, 0, 3, 1]).expect("write labels");
        assert_eq!(read_label_values(&path).expect("labels"), vec![0, 1, 2, 3]);
    }

    #[test]
    fn short_file_is_invalid_header() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("short.mrc");
        std::fs::write(&path, [0u8; 10]).expect("write short file");
        let err = read_dimensions(&path).expect_err("short file must fail");
        assert!(matches!(err, MrcError::InvalidHeader { .. }));
    }

    #[test]
    fn recognizes_mrc_extensions() {
        assert!(has_mrc_extension("/a/b.mrc"));
        assert!(has_mrc_extension("b.map"));
        assert!(!has_mrc_extension("b.rec"));
    }
}
