//! Payload compression codecs for stored records.
//!
//! Records carry a one-byte version tag naming the codec that produced
//! them. Built-in codecs have fixed ids; id 127 marks an externally
//! registered codec, and such payloads embed the codec name so a reader
//! can resolve the implementation without out-of-band knowledge.
//!
//! Registration is process-global. `zstd` ships pre-registered as a
//! custom codec.

use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use parking_lot::RwLock;

use crate::error::{StorageError, StorageResult};

/// Wire id shared by all externally registered codecs.
pub const CUSTOM_CODEC_ID: u8 = 127;

/// Compression applied to record payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    /// RFC 1952 gzip.
    GZip,
    /// RFC 1950 zlib. The historical default.
    Zlib,
    /// Uncompressed passthrough.
    None,
    /// LZ4 block format with a prepended length.
    Lz4,
    /// Externally registered codec, resolved by name at decode time.
    Custom(String),
}

impl Default for Codec {
    fn default() -> Self {
        Self::Zlib
    }
}

impl Codec {
    /// Wire id stored in record version bytes.
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::GZip => 1,
            Self::Zlib => 2,
            Self::None => 3,
            Self::Lz4 => 4,
            Self::Custom(_) => CUSTOM_CODEC_ID,
        }
    }

    /// Parses a codec name as written in configuration files.
    ///
    /// Built-in names are fixed; any other name selects a custom codec,
    /// which must be registered before records are written or read.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "gzip" => Self::GZip,
            "zlib" => Self::Zlib,
            "none" => Self::None,
            "lz4" => Self::Lz4,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Name as written in configuration files.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::GZip => "gzip",
            Self::Zlib => "zlib",
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Custom(name) => name,
        }
    }

    /// Compresses `payload` into its on-disk form, including the name
    /// prefix for custom codecs.
    pub fn encode_payload(&self, payload: &[u8]) -> StorageResult<Vec<u8>> {
        match self {
            Self::GZip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(payload)?;
                Ok(encoder.finish()?)
            },
            Self::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(payload)?;
                Ok(encoder.finish()?)
            },
            Self::None => Ok(payload.to_vec()),
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
            Self::Custom(name) => {
                let codec = custom_codec(name)?;
                let compressed = codec.compress(payload)?;
                let name_bytes = name.as_bytes();
                if name_bytes.len() > usize::from(u16::MAX) {
                    return Err(StorageError::Codec {
                        codec: "custom",
                        detail: format!("codec name is {} bytes long", name_bytes.len()),
                    });
                }
                let mut out = Vec::with_capacity(2 + name_bytes.len() + compressed.len());
                out.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(name_bytes);
                out.extend_from_slice(&compressed);
                Ok(out)
            },
        }
    }
}

/// Decompresses a record payload tagged with wire id `id`.
pub fn decode_payload(id: u8, payload: &[u8]) -> StorageResult<Vec<u8>> {
    match id {
        1 => {
            let mut decoder = GzDecoder::new(payload);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        },
        2 => {
            let mut decoder = ZlibDecoder::new(payload);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        },
        3 => Ok(payload.to_vec()),
        4 => lz4_flex::decompress_size_prepended(payload).map_err(|err| StorageError::Codec {
            codec: "lz4",
            detail: err.to_string(),
        }),
        CUSTOM_CODEC_ID => {
            let (name, rest) = split_custom_prefix(payload)?;
            custom_codec(name)?.decompress(rest)
        },
        other => Err(StorageError::UnknownCodec(other)),
    }
}

/// A codec implementation resolved through the custom id.
pub trait CustomCodec: Send + Sync {
    /// Name embedded in payloads written with this codec.
    fn name(&self) -> &str;
    /// Compresses a raw payload.
    fn compress(&self, payload: &[u8]) -> StorageResult<Vec<u8>>;
    /// Decompresses a stored payload.
    fn decompress(&self, payload: &[u8]) -> StorageResult<Vec<u8>>;
}

/// Registers `codec` for records written and read with the custom id.
///
/// Re-registering a name replaces the previous implementation.
pub fn register_custom_codec(codec: Arc<dyn CustomCodec>) {
    let name = codec.name().to_string();
    custom_codecs().write().insert(name, codec);
}

/// Whether a custom codec with this name is currently registered.
#[must_use]
pub fn custom_codec_registered(name: &str) -> bool {
    custom_codecs().read().contains_key(name)
}

fn custom_codecs() -> &'static RwLock<AHashMap<String, Arc<dyn CustomCodec>>> {
    static TABLE: OnceLock<RwLock<AHashMap<String, Arc<dyn CustomCodec>>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: AHashMap<String, Arc<dyn CustomCodec>> = AHashMap::new();
        let zstd: Arc<dyn CustomCodec> = Arc::new(ZstdCodec);
        table.insert(zstd.name().to_string(), zstd);
        RwLock::new(table)
    })
}

fn custom_codec(name: &str) -> StorageResult<Arc<dyn CustomCodec>> {
    custom_codecs()
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| StorageError::UnregisteredCodec(name.to_string()))
}

fn split_custom_prefix(payload: &[u8]) -> StorageResult<(&str, &[u8])> {
    if payload.len() < 2 {
        return Err(StorageError::Codec {
            codec: "custom",
            detail: "payload too short for a codec name".to_string(),
        });
    }
    let len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
    let rest = &payload[2..];
    if rest.len() < len {
        return Err(StorageError::Codec {
            codec: "custom",
            detail: "codec name extends past the payload".to_string(),
        });
    }
    let name = std::str::from_utf8(&rest[..len]).map_err(|_| StorageError::Codec {
        codec: "custom",
        detail: "codec name is not valid UTF-8".to_string(),
    })?;
    Ok((name, &rest[len..]))
}

/// Built-in zstd, pre-registered under the custom id.
struct ZstdCodec;

impl CustomCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn compress(&self, payload: &[u8]) -> StorageResult<Vec<u8>> {
        zstd::stream::encode_all(payload, 0).map_err(|err| StorageError::Codec {
            codec: "zstd",
            detail: err.to_string(),
        })
    }

    fn decompress(&self, payload: &[u8]) -> StorageResult<Vec<u8>> {
        zstd::stream::decode_all(payload).map_err(|err| StorageError::Codec {
            codec: "zstd",
            detail: err.to_string(),
        })
    }
}
