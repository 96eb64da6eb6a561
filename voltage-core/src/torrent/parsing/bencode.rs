//! Bencode parsing logic and info hash calculation

use std::ops::Range;

use sha1::{Digest, Sha1};

use super::types::TorrentDescriptor;
use crate::torrent::{InfoHash, TorrentError};

// Type aliases for complex bencode types
pub(crate) type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
pub(super) type ParseResult<T> = Result<T, TorrentError>;
pub(super) type BytesResult<'a> = Result<&'a [u8], TorrentError>;
pub(super) type FilesResult = ParseResult<Vec<(Vec<String>, u64)>>;

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parse bencode data and build a validated torrent descriptor
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing, field extraction or
    ///   descriptor validation failed
    pub fn parse_bencode_data(torrent_bytes: &[u8]) -> Result<TorrentDescriptor, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            }
        })?;

        let Some(root) = parsed.first() else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Empty bencode data".to_string(),
            });
        };

        if let bencode_rs::Value::Dictionary(dict) = root {
            Self::extract_descriptor_from_dict(dict, torrent_bytes)
        } else {
            Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            })
        }
    }

    /// Extract torrent descriptor from the root bencode dictionary
    fn extract_descriptor_from_dict(
        dict: &BencodeDict<'_>,
        original_data: &[u8],
    ) -> ParseResult<TorrentDescriptor> {
        let info_dict =
            dict.get(b"info".as_slice())
                .ok_or_else(|| TorrentError::InvalidTorrentFile {
                    reason: "Missing 'info' field".to_string(),
                })?;

        let bencode_rs::Value::Dictionary(info_dict_map) = info_dict else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Info field must be dictionary".to_string(),
            });
        };

        let info_hash = Self::calculate_info_hash(original_data)?;

        let name = Self::extract_bytes_as_string(info_dict_map, b"name")?;
        let piece_length = Self::extract_integer(info_dict_map, b"piece length")?;
        let piece_length = u32::try_from(piece_length).map_err(|_| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Invalid piece length: {piece_length}"),
            }
        })?;

        let pieces_bytes = Self::extract_bytes(info_dict_map, b"pieces")?;
        if !pieces_bytes.len().is_multiple_of(20) {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid pieces length".to_string(),
            });
        }

        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = if let Ok(length) = Self::extract_integer(info_dict_map, b"length") {
            vec![(vec![name.clone()], Self::non_negative(length)?)]
        } else if let Some(bencode_rs::Value::List(files_list)) =
            info_dict_map.get(b"files".as_slice())
        {
            Self::extract_files_info(files_list)?
        } else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing 'files' or 'length' field".to_string(),
            });
        };

        let announce_urls = Self::extract_announce_urls(dict);

        TorrentDescriptor::new(
            info_hash,
            name,
            piece_length,
            piece_hashes,
            files,
            announce_urls,
        )
    }

    /// Calculate SHA1 hash over the raw bytes of the top-level info value
    fn calculate_info_hash(original_data: &[u8]) -> Result<InfoHash, TorrentError> {
        let span = Self::locate_info_span(original_data)?;

        let mut hasher = Sha1::new();
        hasher.update(&original_data[span]);
        let hash_result = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hash_result);

        Ok(InfoHash::new(hash))
    }

    /// Find the byte span of the `info` value inside the root dictionary.
    ///
    /// Walks the root dictionary key by key so that an `info` key nested in
    /// another value, or the bytes `4:info` inside a string, are never matched.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the root is malformed or has no `info` key
    pub fn locate_info_span(data: &[u8]) -> Result<Range<usize>, TorrentError> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Expected dictionary start".to_string(),
            });
        }

        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let key_start = pos;
            let key_end = Self::find_value_end(data, key_start)?;
            let key = Self::string_contents(data, key_start..key_end)?;

            let value_end = Self::find_value_end(data, key_end)?;
            if key == b"info" {
                return Ok(key_end..value_end);
            }
            pos = value_end;
        }

        Err(TorrentError::InvalidTorrentFile {
            reason: "Could not find info dictionary in data".to_string(),
        })
    }

    /// Find the end position of a bencode dictionary
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If invalid bencode dictionary format
    #[cfg(test)]
    fn find_bencode_dictionary_end(data: &[u8]) -> Result<usize, TorrentError> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Expected dictionary start".to_string(),
            });
        }

        Self::find_value_end(data, 0)
    }

    /// Returns the position just past the bencode value starting at `start`
    fn find_value_end(data: &[u8], start: usize) -> Result<usize, TorrentError> {
        let incomplete = || TorrentError::InvalidTorrentFile {
            reason: "Incomplete bencode value".to_string(),
        };

        match data.get(start).copied() {
            Some(b'i') => {
                let end = data[start..]
                    .iter()
                    .position(|&b| b == b'e')
                    .ok_or_else(incomplete)?;
                Ok(start + end + 1)
            }
            Some(b'l') | Some(b'd') => {
                let mut pos = start + 1;
                loop {
                    match data.get(pos) {
                        Some(b'e') => return Ok(pos + 1),
                        Some(_) => pos = Self::find_value_end(data, pos)?,
                        None => return Err(incomplete()),
                    }
                }
            }
            Some(b'0'..=b'9') => {
                let colon = data[start..]
                    .iter()
                    .position(|&b| b == b':')
                    .ok_or_else(|| TorrentError::InvalidTorrentFile {
                        reason: "Invalid string format".to_string(),
                    })?;
                let length: usize = std::str::from_utf8(&data[start..start + colon])
                    .ok()
                    .and_then(|digits| digits.parse().ok())
                    .ok_or_else(|| TorrentError::InvalidTorrentFile {
                        reason: "Invalid string length".to_string(),
                    })?;

                start
                    .checked_add(colon + 1)
                    .and_then(|body| body.checked_add(length))
                    .filter(|&end| end <= data.len())
                    .ok_or_else(incomplete)
            }
            Some(_) => Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid bencode character".to_string(),
            }),
            None => Err(incomplete()),
        }
    }

    fn string_contents(data: &[u8], span: Range<usize>) -> BytesResult<'_> {
        let raw = &data[span];
        let colon = raw.iter().position(|&b| b == b':').ok_or_else(|| {
            TorrentError::InvalidTorrentFile {
                reason: "Dictionary key must be a string".to_string(),
            }
        })?;
        Ok(&raw[colon + 1..])
    }

    /// Extract string from bencode dictionary
    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
        })
    }

    /// Extract bytes from bencode dictionary
    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> BytesResult<'a> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    /// Extract integer from bencode dictionary
    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid integer field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    fn non_negative(value: i64) -> ParseResult<u64> {
        u64::try_from(value).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Negative file length: {value}"),
        })
    }

    /// Extract files information from multi-file torrent
    fn extract_files_info(files_list: &[bencode_rs::Value<'_>]) -> FilesResult {
        let mut files = Vec::with_capacity(files_list.len());

        for file_value in files_list {
            let bencode_rs::Value::Dictionary(file_dict) = file_value else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Invalid file entry type".to_string(),
                });
            };

            let length = Self::non_negative(Self::extract_integer(file_dict, b"length")?)?;

            let Some(bencode_rs::Value::List(path_list)) = file_dict.get(b"path".as_slice())
            else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Missing or invalid path in file".to_string(),
                });
            };

            let mut path = Vec::with_capacity(path_list.len());
            for path_component in path_list {
                let bencode_rs::Value::Bytes(component) = path_component else {
                    return Err(TorrentError::InvalidTorrentFile {
                        reason: "Invalid path component type".to_string(),
                    });
                };
                let component = String::from_utf8(component.to_vec()).map_err(|_| {
                    TorrentError::InvalidTorrentFile {
                        reason: "Invalid UTF-8 in file path".to_string(),
                    }
                })?;
                path.push(component);
            }

            files.push((path, length));
        }

        Ok(files)
    }

    /// Extract announce URLs from `announce` and every `announce-list` tier,
    /// keeping first-seen order and dropping duplicates
    fn extract_announce_urls(dict: &BencodeDict<'_>) -> Vec<String> {
        let mut announce_urls: Vec<String> = Vec::new();
        let mut push_url = |url: String| {
            if !url.is_empty() && !announce_urls.contains(&url) {
                announce_urls.push(url);
            }
        };

        if let Ok(announce) = Self::extract_bytes_as_string(dict, b"announce") {
            push_url(announce);
        }

        if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice())
        {
            for tier in announce_list {
                match tier {
                    bencode_rs::Value::List(tier_urls) => {
                        for url_value in tier_urls {
                            if let bencode_rs::Value::Bytes(url_bytes) = url_value
                                && let Ok(url) = String::from_utf8(url_bytes.to_vec())
                            {
                                push_url(url);
                            }
                        }
                    }
                    bencode_rs::Value::Bytes(url_bytes) => {
                        if let Ok(url) = String::from_utf8(url_bytes.to_vec()) {
                            push_url(url);
                        }
                    }
                    _ => {}
                }
            }
        }

        announce_urls
    }
}
