//! Torrent metainfo structure and parsing.
use crate::bencode::{self, BencodeValue};
use crate::torrent::info_hash;

use super::{TorrentError, TorrentResult};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub length: Option<i64>,
    pub files: Vec<FileDict>,
    pub is_directory: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileDict {
    pub length: i64,
    pub path: Vec<String>,
}

/// One output file's overlap with a piece's byte range.
#[derive(Debug, PartialEq, Clone)]
pub struct FileOverlap {
    /// Path relative to the download root.
    pub path: PathBuf,
    /// Byte offset within the file where this overlap begins.
    pub file_offset: i64,
    /// Byte offset within the piece's data where this overlap begins.
    pub data_offset: usize,
    /// Number of bytes in this overlap.
    pub data_len: usize,
}

/// Splits the `pieces` byte string into one 20-byte SHA-1 hash per piece,
/// in piece-index order.
#[tracing::instrument(level = "trace")]
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let num_pieces = pieces_bytes.len() / 20;
    let mut hashes = Vec::with_capacity(num_pieces);
    for i in 0..num_pieces {
        let start = i * 20;
        let end = start + 20;
        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(&pieces_bytes[start..end]);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

fn parse_announce_list(value: BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = match value {
        BencodeValue::List(tiers) => tiers,
        _ => return Err(TorrentError::InvalidFormat("announce-list not a list".to_string())),
    };
    let mut result = Vec::new();
    for tier in tiers {
        let trackers = match tier {
            BencodeValue::List(trackers) => trackers,
            _ => return Err(TorrentError::InvalidFormat("announce tier not a list".to_string())),
        };
        let mut tier_vec = Vec::new();
        for tracker in trackers {
            match tracker {
                BencodeValue::String(s) => {
                    tier_vec.push(String::from_utf8(s).map_err(|e| {
                        TorrentError::InvalidFormat(format!("invalid tracker URL (not UTF-8): {}", e))
                    })?);
                }
                _ => return Err(TorrentError::InvalidFormat("tracker URL not a string".to_string())),
            }
        }
        result.push(tier_vec);
    }
    Ok(result)
}

fn parse_info_dict(value: BencodeValue) -> TorrentResult<InfoDict> {
    let dict = match value {
        BencodeValue::Dict(d) => d,
        _ => return Err(TorrentError::InvalidFormat("info is not a dictionary".to_string())),
    };

    let piece_length = match dict.get(b"piece length".as_slice()) {
        Some(BencodeValue::Integer(i)) => *i,
        _ => return Err(TorrentError::MissingField("piece length".to_string())),
    };

    let pieces_bytes = match dict.get(b"pieces".as_slice()) {
        Some(BencodeValue::String(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces".to_string())),
    };

    let private = matches!(dict.get(b"private".as_slice()), Some(BencodeValue::Integer(1)));

    let name = match dict.get(b"name".as_slice()) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("invalid name (not UTF-8): {}", e)))?,
        _ => return Err(TorrentError::MissingField("name".to_string())),
    };

    let length = match dict.get(b"length".as_slice()) {
        Some(BencodeValue::Integer(i)) => Some(*i),
        _ => None,
    };

    let files = match dict.get(b"files".as_slice()) {
        Some(BencodeValue::List(list)) => {
            let mut files_vec = Vec::new();
            for file_val in list {
                let file_dict = match file_val {
                    BencodeValue::Dict(d) => d,
                    _ => return Err(TorrentError::InvalidFormat("file entry not a dict".to_string())),
                };
                let length = match file_dict.get(b"length".as_slice()) {
                    Some(BencodeValue::Integer(i)) => *i,
                    _ => return Err(TorrentError::MissingField("file length".to_string())),
                };
                let path = match file_dict.get(b"path".as_slice()) {
                    Some(BencodeValue::List(path_list)) => {
                        let mut path_vec = Vec::new();
                        for p in path_list {
                            if let BencodeValue::String(s) = p {
                                path_vec.push(String::from_utf8(s.clone()).map_err(|e| {
                                    TorrentError::InvalidFormat(format!(
                                        "invalid file path (not UTF-8): {}",
                                        e
                                    ))
                                })?);
                            } else {
                                return Err(TorrentError::InvalidFormat(
                                    "file path component not a string".to_string(),
                                ));
                            }
                        }
                        path_vec
                    }
                    _ => return Err(TorrentError::MissingField("file path".to_string())),
                };
                files_vec.push(FileDict { length, path });
            }
            files_vec
        }
        _ => Vec::new(),
    };

    let is_directory = !files.is_empty();

    Ok(InfoDict {
        piece_length,
        pieces: pieces_bytes,
        private,
        name,
        length,
        files,
        is_directory,
    })
}

impl TorrentFile {
    /// Total length of all files described by this torrent.
    pub fn total_length(&self) -> i64 {
        if !self.info.is_directory {
            self.info.length.unwrap_or(0)
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    /// Size of piece `index`. The last piece is shorter than `piece_length`
    /// unless the total length happens to be an exact multiple of it, in
    /// which case it is a full piece.
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            let total_length = self.total_length();
            let full_pieces_length = (self.num_pieces() - 1) as i64 * self.info.piece_length;
            let last_piece_size = total_length - full_pieces_length;
            if last_piece_size == 0 && self.num_pieces() > 0 {
                self.info.piece_length
            } else {
                last_piece_size
            }
        }
    }

    /// File paths whose byte ranges overlap piece `index`.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        self.file_overlaps_for_piece(index).into_iter().map(|o| o.path).collect()
    }

    /// Computes, for piece `index`, every output file its byte range
    /// overlaps and the exact sub-ranges involved on both sides (the
    /// piece's data and the file's own byte offset). This is the single
    /// place that walks the file list against a piece's byte range; both
    /// [`Self::file_paths_for_piece`] and the on-disk piece writer build on
    /// it instead of independently re-deriving the same overlap math.
    pub fn file_overlaps_for_piece(&self, index: usize) -> Vec<FileOverlap> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = (index as i64) * self.info.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut current_data_position: i64 = 0;
        let mut overlaps = Vec::new();

        let entries: Vec<(PathBuf, i64)> = if !self.info.is_directory {
            vec![(PathBuf::from(&self.info.name), self.total_length())]
        } else {
            self.info
                .files
                .iter()
                .map(|file_info| {
                    let mut full_path = PathBuf::from(&self.info.name);
                    for component in &file_info.path {
                        full_path = full_path.join(component);
                    }
                    (full_path, file_info.length)
                })
                .collect()
        };

        for (path, length) in entries {
            let file_start = current_data_position;
            let file_end = file_start + length;
            if file_end > piece_start && file_start < piece_end {
                let overlap_start = piece_start.max(file_start);
                let overlap_end = piece_end.min(file_end);
                overlaps.push(FileOverlap {
                    path,
                    file_offset: overlap_start - file_start,
                    data_offset: (overlap_start - piece_start) as usize,
                    data_len: (overlap_end - overlap_start) as usize,
                });
            }
            current_data_position = file_end;
        }
        overlaps
    }

    /// Parses a `.torrent` file's raw bytes into a [`TorrentFile`].
    ///
    /// The info-hash is computed over the exact byte range of the `info`
    /// sub-dictionary as it appears in `bytes`, not over a re-encoding of
    /// the decoded value.
    #[tracing::instrument(skip(bytes), level = "debug")]
    pub fn parse(bytes: &[u8]) -> TorrentResult<TorrentFile> {
        let (value, info_range) = bencode::extract_info_slice(bytes)?;
        let info_hash = info_hash::hash_info_bytes(&bytes[info_range]);

        let mut dict = match value {
            BencodeValue::Dict(d) => d,
            _ => return Err(TorrentError::InvalidFormat("root is not a dictionary".to_string())),
        };

        let announce_bytes = dict
            .remove(b"announce".as_slice())
            .ok_or_else(|| TorrentError::MissingField("announce".to_string()))?;
        let announce = match announce_bytes {
            BencodeValue::String(s) => String::from_utf8(s).map_err(|e| {
                TorrentError::InvalidFormat(format!("invalid announce URL (not UTF-8): {}", e))
            })?,
            _ => return Err(TorrentError::InvalidFormat("announce not a string".to_string())),
        };

        let info_dict_value = dict
            .remove(b"info".as_slice())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info = parse_info_dict(info_dict_value)?;

        let announce_list = if let Some(announce_list_value) = dict.remove(b"announce-list".as_slice()) {
            parse_announce_list(announce_list_value)?
        } else {
            Vec::new()
        };

        let creation_date = if let Some(data_value) = dict.remove(b"creation date".as_slice()) {
            match data_value {
                BencodeValue::Integer(timestamp) => {
                    let secs: u64 = timestamp
                        .try_into()
                        .map_err(|_| TorrentError::DateParseError)?;
                    Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
                }
                _ => return Err(TorrentError::InvalidFormat("creation date not an integer".to_string())),
            }
        } else {
            None
        };

        let comment = match dict.remove(b"comment".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let created_by = match dict.remove(b"created by".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let encoding = match dict.remove(b"encoding".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };

        let pieces_hash = parse_pieces(&info.pieces)?;

        Ok(TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        b"d8:announce16:http://tracker/4:infod6:lengthi20e12:piece lengthi10e6:pieces40:\
aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbb4:name4:foo.ee".to_vec()
    }

    #[test]
    fn parses_single_file_torrent() {
        let torrent = TorrentFile::parse(&sample_bytes()).unwrap();
        assert_eq!(torrent.announce, "http://tracker/");
        assert_eq!(torrent.total_length(), 20);
        assert_eq!(torrent.num_pieces(), 2);
        assert_eq!(torrent.piece_size(0), 10);
        assert_eq!(torrent.piece_size(1), 10);
    }

    #[test]
    fn info_hash_is_stable_for_identical_bytes() {
        let a = TorrentFile::parse(&sample_bytes()).unwrap();
        let b = TorrentFile::parse(&sample_bytes()).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn file_paths_for_piece_matches_overlap_paths() {
        let torrent = TorrentFile::parse(&sample_bytes()).unwrap();
        assert_eq!(torrent.file_paths_for_piece(0), vec![PathBuf::from("foo.")]);
    }

    #[test]
    fn file_overlaps_cover_whole_piece_for_single_file_torrent() {
        let torrent = TorrentFile::parse(&sample_bytes()).unwrap();
        let overlaps = torrent.file_overlaps_for_piece(0);
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].path, PathBuf::from("foo."));
        assert_eq!(overlaps[0].file_offset, 0);
        assert_eq!(overlaps[0].data_offset, 0);
        assert_eq!(overlaps[0].data_len, 10);
    }

    #[test]
    fn last_piece_exact_multiple_is_full_length() {
        let bytes = b"d8:announce3:abc4:infod6:lengthi20e12:piece lengthi10e6:pieces40:\
aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbb4:name1:fe".to_vec();
        let torrent = TorrentFile::parse(&bytes).unwrap();
        assert_eq!(torrent.piece_size(1), 10);
    }
}
