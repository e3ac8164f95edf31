//! Response compression (§4.6): zstd, then brotli, then gzip, tried only
//! against an already fully-buffered body — there is no streaming variant,
//! since Inline and Compressed-stream modes hold the whole response in
//! memory before this runs.

use std::io::Write;

/// Minimum body size before compression is attempted at all.
pub const MIN_COMPRESSIBLE_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Zstd,
    Brotli,
    Gzip,
}

impl Encoding {
    pub fn wire_name(self) -> &'static str {
        match self {
            Encoding::Zstd => "zstd",
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
        }
    }
}

/// `text/*`, `application/json`, `application/javascript`, `application/xml`,
/// `application/xhtml+xml`, `image/svg+xml` (prefix match per the content-type
/// families named in the design, ignoring any `; charset=...` suffix).
pub fn is_compressible_content_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or("").trim();
    base.starts_with("text/")
        || base.starts_with("application/json")
        || base.starts_with("application/javascript")
        || base.starts_with("application/xml")
        || base.starts_with("application/xhtml")
        || base.starts_with("image/svg")
}

/// Pick the best encoding the client accepts, preferring zstd, then brotli,
/// then gzip.
pub fn negotiate(accept_encoding: &str) -> Option<Encoding> {
    let accept = accept_encoding.to_ascii_lowercase();
    if accept.contains("zstd") {
        Some(Encoding::Zstd)
    } else if accept.contains("br") {
        Some(Encoding::Brotli)
    } else if accept.contains("gzip") {
        Some(Encoding::Gzip)
    } else {
        None
    }
}

/// Compress `data`. A failure leaves the caller to fall back to the
/// uncompressed body (§4.6 step 5).
pub fn compress(encoding: Encoding, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Zstd => zstd::encode_all(data, 3),
        Encoding::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(data)?;
            }
            Ok(out)
        }
        Encoding::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(6));
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_content_types_match_expected_prefixes() {
        assert!(is_compressible_content_type("text/html; charset=utf-8"));
        assert!(is_compressible_content_type("application/json"));
        assert!(is_compressible_content_type("application/javascript"));
        assert!(is_compressible_content_type("image/svg+xml"));
        assert!(!is_compressible_content_type("image/png"));
        assert!(!is_compressible_content_type("application/octet-stream"));
    }

    #[test]
    fn negotiate_prefers_zstd_then_brotli_then_gzip() {
        assert_eq!(negotiate("gzip, br, zstd"), Some(Encoding::Zstd));
        assert_eq!(negotiate("gzip, br"), Some(Encoding::Brotli));
        assert_eq!(negotiate("gzip"), Some(Encoding::Gzip));
        assert_eq!(negotiate("identity"), None);
    }

    #[test]
    fn zstd_round_trips() {
        let data = b"hello world, compress me please, compress me please".repeat(50);
        let compressed = compress(Encoding::Zstd, &data).unwrap();
        let decompressed = zstd::decode_all(compressed.as_slice()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"hello world, compress me please, compress me please".repeat(50);
        let compressed = compress(Encoding::Gzip, &data).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut decompressed).unwrap();
        assert_eq!(decompressed, data);
    }
}
