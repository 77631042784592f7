//! Persisting a master's blocks and reading them back under any assignment.
//!
//! Layout for a base path `P`:
//!
//! - `P.meta.json` (written by rank 0): format version, total block count,
//!   number of writer ranks and the optional domain.
//! - `P.rank{r}.blocks` (one per writer rank):
//!
//! ```text
//! BlocksHeader | BlockRecord* | index: Vec<IndexEntry> | BlocksTrailer
//! ```
//!
//! Records and the index are `bincode`; header and trailer are fixed
//! little-endian Pod structs. The trailer locates the index, and the index
//! maps every gid in the file to its record, so a reader with a different
//! assigner finds its blocks by scanning indexes only.

use crate::algs::communicator::Communicator;
use crate::block_error::BlockError;
use crate::master::Master;
use crate::partitioning::assigner::Assigner;
use crate::storage::BlockCodec;
use crate::topology::bounds::{Bounds, Coordinate};
use crate::topology::gid::Gid;
use crate::topology::link::LinkTopology;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

const BLOCKS_FORMAT_VERSION: u32 = 1;
const BLOCKS_MAGIC: [u8; 8] = *b"BLKPAR\0\x01";

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct BlocksHeader {
    magic: [u8; 8],
    version_le: u32,
    rank_le: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct BlocksTrailer {
    index_offset_le: u64,
    index_len_le: u64,
    count_le: u64,
    magic: [u8; 8],
}

const_assert_eq!(size_of::<BlocksHeader>(), 16);
const_assert_eq!(size_of::<BlocksTrailer>(), 32);

/// Contents of `P.meta.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlocksMetadata<T> {
    pub version: u32,
    pub nblocks: usize,
    pub writers: usize,
    pub domain: Option<Bounds<T>>,
}

#[derive(Serialize, Deserialize)]
struct BlockRecord<L> {
    gid: usize,
    link: L,
    payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct IndexEntry {
    gid: usize,
    offset: u64,
    len: u64,
}

pub fn meta_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.meta.json", path.display()))
}

pub fn rank_path(path: &Path, rank: usize) -> PathBuf {
    PathBuf::from(format!("{}.rank{rank}.blocks", path.display()))
}

fn io_at(path: &Path) -> impl Fn(std::io::Error) -> BlockError + '_ {
    move |source| BlockError::StorageIo {
        path: path.to_path_buf(),
        source,
    }
}

/// Write every block of `master` under `path`, plus the optional `domain`.
///
/// Collective: all ranks call it. Blocks that are externalized are loaded one
/// at a time. Output of a failed write must be treated as corrupt.
pub fn write_blocks<B, C, L, T>(
    path: impl AsRef<Path>,
    master: &mut Master<B, C, L>,
    domain: Option<&Bounds<T>>,
    codec: &BlockCodec<B>,
) -> Result<(), BlockError>
where
    B: Send,
    C: Communicator,
    L: LinkTopology,
    T: Coordinate,
{
    let path = path.as_ref();
    let (rank, size) = (master.comm().rank(), master.comm().size());
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(io_at(dir))?;
    }

    let file_path = rank_path(path, rank);
    let io = io_at(&file_path);
    let mut out = BufWriter::new(File::create(&file_path).map_err(&io)?);
    let header = BlocksHeader {
        magic: BLOCKS_MAGIC,
        version_le: BLOCKS_FORMAT_VERSION.to_le(),
        rank_le: (rank as u32).to_le(),
    };
    out.write_all(bytemuck::bytes_of(&header)).map_err(&io)?;

    let mut offset = size_of::<BlocksHeader>() as u64;
    let mut index = Vec::with_capacity(master.size());
    for i in 0..master.size() {
        let gid = master
            .gid(i)
            .ok_or_else(|| BlockError::Configuration(format!("block {i} vanished during write")))?;
        let record = master.with_block(i, |block, link| {
            Ok(bincode::serialize(&BlockRecord {
                gid: gid.get(),
                link: link.clone(),
                payload: codec.save(block)?,
            })?)
        })?;
        out.write_all(&record).map_err(&io)?;
        index.push(IndexEntry {
            gid: gid.get(),
            offset,
            len: record.len() as u64,
        });
        offset += record.len() as u64;
    }
    let index_bytes = bincode::serialize(&index)?;
    out.write_all(&index_bytes).map_err(&io)?;
    let trailer = BlocksTrailer {
        index_offset_le: offset.to_le(),
        index_len_le: (index_bytes.len() as u64).to_le(),
        count_le: (index.len() as u64).to_le(),
        magic: BLOCKS_MAGIC,
    };
    out.write_all(bytemuck::bytes_of(&trailer)).map_err(&io)?;
    out.flush().map_err(&io)?;

    let mut total = [index.len() as u64];
    master.comm().allreduce_sum(&mut total)?;
    if rank == 0 {
        let meta = BlocksMetadata {
            version: BLOCKS_FORMAT_VERSION,
            nblocks: total[0] as usize,
            writers: size,
            domain: domain.cloned(),
        };
        let meta_file = meta_path(path);
        fs::write(&meta_file, serde_json::to_vec_pretty(&meta)?).map_err(io_at(&meta_file))?;
    }
    master.comm().barrier()?;
    log::info!(
        "[rank {rank}] wrote {} of {} blocks to {}",
        index.len(),
        total[0],
        file_path.display()
    );
    Ok(())
}

fn read_index(file: &mut File, file_path: &Path) -> Result<Vec<IndexEntry>, BlockError> {
    let io = io_at(file_path);
    let len = file.metadata().map_err(&io)?.len();
    let trailer_len = size_of::<BlocksTrailer>() as u64;
    if len < size_of::<BlocksHeader>() as u64 + trailer_len {
        return Err(BlockError::MalformedFile(format!(
            "{} is too short ({len} bytes)",
            file_path.display()
        )));
    }
    let mut head = [0u8; size_of::<BlocksHeader>()];
    file.read_exact(&mut head).map_err(&io)?;
    let header: BlocksHeader = bytemuck::pod_read_unaligned(&head);
    if header.magic != BLOCKS_MAGIC || u32::from_le(header.version_le) != BLOCKS_FORMAT_VERSION {
        return Err(BlockError::MalformedFile(format!(
            "{} has an unknown header",
            file_path.display()
        )));
    }

    file.seek(SeekFrom::End(-(trailer_len as i64))).map_err(&io)?;
    let mut tail = [0u8; size_of::<BlocksTrailer>()];
    file.read_exact(&mut tail).map_err(&io)?;
    let trailer: BlocksTrailer = bytemuck::pod_read_unaligned(&tail);
    let index_offset = u64::from_le(trailer.index_offset_le);
    let index_len = u64::from_le(trailer.index_len_le);
    let end = index_offset
        .checked_add(index_len)
        .and_then(|e| e.checked_add(trailer_len));
    if trailer.magic != BLOCKS_MAGIC || end != Some(len) {
        return Err(BlockError::MalformedFile(format!(
            "{} has an inconsistent trailer",
            file_path.display()
        )));
    }
    file.seek(SeekFrom::Start(index_offset)).map_err(&io)?;
    let mut buf = vec![0u8; index_len as usize];
    file.read_exact(&mut buf).map_err(&io)?;
    let index: Vec<IndexEntry> = bincode::deserialize(&buf)?;
    if index.len() as u64 != u64::from_le(trailer.count_le) {
        return Err(BlockError::MalformedFile(format!(
            "{}: index holds {} entries, trailer says {}",
            file_path.display(),
            index.len(),
            u64::from_le(trailer.count_le)
        )));
    }
    let records_start = size_of::<BlocksHeader>() as u64;
    for entry in &index {
        let end = entry.offset.checked_add(entry.len);
        if entry.offset < records_start || end.is_none_or(|e| e > index_offset) {
            return Err(BlockError::MalformedFile(format!(
                "{}: record of gid {} ({} bytes at {}) lies outside the record area",
                file_path.display(),
                entry.gid,
                entry.len,
                entry.offset
            )));
        }
    }
    Ok(index)
}

/// Add to `master` every block `assigner` gives this rank, reading it from
/// what [`write_blocks`] left under `path`. Neighbor ranks in the restored
/// links are recomputed with `assigner`.
///
/// Returns the stored domain, if one was written.
pub fn read_blocks<B, C, L, T>(
    path: impl AsRef<Path>,
    assigner: &dyn Assigner,
    master: &mut Master<B, C, L>,
    codec: &BlockCodec<B>,
) -> Result<Option<Bounds<T>>, BlockError>
where
    B: Send,
    C: Communicator,
    L: LinkTopology,
    T: Coordinate,
{
    let path = path.as_ref();
    let meta_file = meta_path(path);
    let meta_bytes = fs::read(&meta_file).map_err(io_at(&meta_file))?;
    let meta: BlocksMetadata<T> = serde_json::from_slice(&meta_bytes)?;
    if meta.version != BLOCKS_FORMAT_VERSION {
        return Err(BlockError::MalformedFile(format!(
            "{} has format version {}, expected {BLOCKS_FORMAT_VERSION}",
            meta_file.display(),
            meta.version
        )));
    }
    if assigner.nblocks() != meta.nblocks {
        return Err(BlockError::AssignmentMismatch(format!(
            "assigner knows {} blocks, {} were written",
            assigner.nblocks(),
            meta.nblocks
        )));
    }
    let rank = master.comm().rank();
    if assigner.size() != master.comm().size() {
        return Err(BlockError::AssignmentMismatch(format!(
            "assigner spans {} ranks, communicator has {}",
            assigner.size(),
            master.comm().size()
        )));
    }

    let mut wanted: BTreeSet<Gid> = assigner.local_gids(rank).into_iter().collect();
    let mut seen = 0usize;
    for writer in 0..meta.writers {
        if wanted.is_empty() {
            break;
        }
        let file_path = rank_path(path, writer);
        let io = io_at(&file_path);
        let mut file = File::open(&file_path).map_err(&io)?;
        for entry in read_index(&mut file, &file_path)? {
            let gid = Gid::new(entry.gid);
            assigner.rank(gid)?;
            if !wanted.remove(&gid) {
                continue;
            }
            file.seek(SeekFrom::Start(entry.offset)).map_err(&io)?;
            let mut buf = vec![0u8; entry.len as usize];
            file.read_exact(&mut buf).map_err(&io)?;
            let record: BlockRecord<L> = bincode::deserialize(&buf)?;
            if record.gid != entry.gid {
                return Err(BlockError::MalformedFile(format!(
                    "{}: index says gid {} but record holds {}",
                    file_path.display(),
                    entry.gid,
                    record.gid
                )));
            }
            let mut link = record.link;
            link.fix(assigner)?;
            master.add(gid, codec.load(&record.payload)?, link)?;
            seen += 1;
        }
    }
    if !wanted.is_empty() {
        return Err(BlockError::MalformedFile(format!(
            "no record for gids {:?} under {}",
            wanted,
            path.display()
        )));
    }
    log::info!("[rank {rank}] read {seen} blocks from {}", path.display());
    Ok(meta.domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::link::Link;

    #[test]
    fn corrupt_trailer_is_reported() {
        let dir = std::env::temp_dir().join(format!("blockpar-io-unit-{}", std::process::id()));
        let base = dir.join("corrupt");
        let mut m: Master<u8, NoComm> = Master::new(NoComm);
        m.add(Gid::new(0), 3, Link::new()).unwrap();
        write_blocks::<_, _, _, i64>(&base, &mut m, None, &BlockCodec::bincode()).unwrap();

        let file = rank_path(&base, 0);
        let mut bytes = fs::read(&file).unwrap();
        let n = bytes.len();
        bytes[n - 1] ^= 0xFF;
        fs::write(&file, bytes).unwrap();

        let assigner = crate::partitioning::assigner::ContiguousAssigner::new(1, 1).unwrap();
        let mut back: Master<u8, NoComm> = Master::new(NoComm);
        let err = read_blocks::<_, _, _, i64>(&base, &assigner, &mut back, &BlockCodec::bincode())
            .unwrap_err();
        assert!(matches!(err, BlockError::MalformedFile(_)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn index_entry_past_the_records_is_reported() {
        let dir = std::env::temp_dir().join(format!("blockpar-io-entry-{}", std::process::id()));
        let base = dir.join("entry");
        let mut m: Master<u8, NoComm> = Master::new(NoComm);
        m.add(Gid::new(0), 3, Link::new()).unwrap();
        write_blocks::<_, _, _, i64>(&base, &mut m, None, &BlockCodec::bincode()).unwrap();

        // One entry: u64 length prefix, then gid, offset and len.
        let file = rank_path(&base, 0);
        let mut bytes = fs::read(&file).unwrap();
        let trailer_at = bytes.len() - size_of::<BlocksTrailer>();
        let index_at = u64::from_le_bytes(bytes[trailer_at..trailer_at + 8].try_into().unwrap()) as usize;
        let len_at = index_at + 8 + 16;
        bytes[len_at..len_at + 8].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        fs::write(&file, &bytes).unwrap();

        let assigner = crate::partitioning::assigner::ContiguousAssigner::new(1, 1).unwrap();
        let mut back: Master<u8, NoComm> = Master::new(NoComm);
        let err = read_blocks::<_, _, _, i64>(&base, &assigner, &mut back, &BlockCodec::bincode())
            .unwrap_err();
        assert!(matches!(err, BlockError::MalformedFile(_)));

        let offset_at = index_at + 8 + 8;
        bytes[len_at..len_at + 8].copy_from_slice(&1u64.to_le_bytes());
        bytes[offset_at..offset_at + 8].copy_from_slice(&0u64.to_le_bytes());
        fs::write(&file, &bytes).unwrap();
        let err = read_blocks::<_, _, _, i64>(&base, &assigner, &mut back, &BlockCodec::bincode())
            .unwrap_err();
        assert!(matches!(err, BlockError::MalformedFile(_)));
        assert_eq!(back.size(), 0);
        let _ = fs::remove_dir_all(&dir);
    }
}
