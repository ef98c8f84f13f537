use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use maxminddb::geoip2;
use memmap2::Mmap;
use tracing::debug;

/// Country lookups against a MaxMind database, either a GeoLite2 country
/// database or a `sing-geoip` one whose records are bare country codes.
pub struct GeoIpReader {
    reader: maxminddb::Reader<Mmap>,
    code_records: bool,
}

impl GeoIpReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = maxminddb::Reader::open_mmap(path)
            .map_err(|e| anyhow!("open geoip database {}: {}", path.display(), e))?;
        let code_records = reader.metadata.database_type == "sing-geoip";
        debug!(
            "loaded geoip database {} ({})",
            path.display(),
            &reader.metadata.database_type
        );
        Ok(GeoIpReader {
            reader,
            code_records,
        })
    }

    /// Lower-case country code of `ip`.
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        if self.code_records {
            return self
                .reader
                .lookup::<&str>(ip)
                .ok()
                .map(|code| code.to_ascii_lowercase());
        }
        let country: geoip2::Country = self.reader.lookup(ip).ok()?;
        country
            .country
            .and_then(|c| c.iso_code)
            .map(|code| code.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeositeItemKind {
    Domain,
    DomainSuffix,
    DomainKeyword,
    DomainRegex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeositeItem {
    pub kind: GeositeItemKind,
    pub value: String,
}

/// Reader of the sing-box `geosite.db` format: a version byte, a code index
/// of `(code, offset, item count)` entries, then the item section the offsets
/// point into.
pub struct GeositeReader {
    data: Vec<u8>,
    items_start: usize,
    index: HashMap<String, (usize, usize)>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| anyhow!("unexpected end of geosite data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn uvarint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let b = self.byte()?;
            if shift >= 64 {
                return Err(anyhow!("geosite varint overflow"));
            }
            value |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn vstring(&mut self) -> Result<String> {
        let len = self.uvarint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| anyhow!("unexpected end of geosite data"))?;
        let s = std::str::from_utf8(&self.data[self.pos..end])
            .context("invalid geosite string")?
            .to_string();
        self.pos = end;
        Ok(s)
    }
}

impl GeositeReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("open geosite database {}", path.display()))?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let mut cursor = Cursor {
            data: &data,
            pos: 0,
        };
        let version = cursor.byte()?;
        if version != 0 {
            return Err(anyhow!("unknown geosite version: {}", version));
        }
        let count = cursor.uvarint()?;
        let mut index = HashMap::new();
        for _ in 0..count {
            let code = cursor.vstring()?;
            let offset = cursor.uvarint()? as usize;
            let len = cursor.uvarint()? as usize;
            index.insert(code.to_ascii_lowercase(), (offset, len));
        }
        let items_start = cursor.pos;
        Ok(GeositeReader {
            data,
            items_start,
            index,
        })
    }

    pub fn codes(&self) -> Vec<&str> {
        self.index.keys().map(String::as_str).collect()
    }

    pub fn load(&self, code: &str) -> Result<Vec<GeositeItem>> {
        let (offset, len) = self
            .index
            .get(&code.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| anyhow!("geosite code not found: {}", code))?;
        let pos = self
            .items_start
            .checked_add(offset)
            .filter(|pos| *pos <= self.data.len())
            .ok_or_else(|| anyhow!("geosite code {}: offset out of range", code))?;
        let mut cursor = Cursor {
            data: &self.data,
            pos,
        };
        // Every item takes at least two bytes.
        let mut items = Vec::with_capacity(len.min((self.data.len() - pos) / 2));
        for _ in 0..len {
            let kind = match cursor.byte()? {
                0 => GeositeItemKind::Domain,
                1 => GeositeItemKind::DomainSuffix,
                2 => GeositeItemKind::DomainKeyword,
                3 => GeositeItemKind::DomainRegex,
                t => return Err(anyhow!("unknown geosite item type: {}", t)),
            };
            let value = cursor.vstring()?;
            items.push(GeositeItem { kind, value });
        }
        Ok(items)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
        while v >= 0x80 {
            buf.push((v as u8) | 0x80);
            v >>= 7;
        }
        buf.push(v as u8);
    }

    fn put_vstring(buf: &mut Vec<u8>, s: &str) {
        put_uvarint(buf, s.len() as u64);
        buf.extend_from_slice(s.as_bytes());
    }

    /// Encodes a geosite database the way the sing-box writer lays it out.
    pub(crate) fn encode(codes: &[(&str, Vec<(u8, &str)>)]) -> Vec<u8> {
        let mut items = Vec::new();
        let mut index = Vec::new();
        for (code, entries) in codes {
            index.push((code.to_string(), items.len(), entries.len()));
            for (kind, value) in entries {
                items.push(*kind);
                put_vstring(&mut items, value);
            }
        }
        let mut buf = vec![0u8];
        put_uvarint(&mut buf, index.len() as u64);
        for (code, offset, len) in index {
            put_vstring(&mut buf, &code);
            put_uvarint(&mut buf, offset as u64);
            put_uvarint(&mut buf, len as u64);
        }
        buf.extend_from_slice(&items);
        buf
    }

    #[test]
    fn test_geosite_reader() {
        let data = encode(&[
            ("cn", vec![(1, "cn"), (0, "baidu.com")]),
            ("google", vec![(2, "google"), (3, "^g\\.co$")]),
        ]);
        let reader = GeositeReader::from_bytes(data).unwrap();
        let mut codes = reader.codes();
        codes.sort();
        assert_eq!(codes, vec!["cn", "google"]);

        let items = reader.load("GOOGLE").unwrap();
        assert_eq!(
            items,
            vec![
                GeositeItem {
                    kind: GeositeItemKind::DomainKeyword,
                    value: "google".to_string()
                },
                GeositeItem {
                    kind: GeositeItemKind::DomainRegex,
                    value: "^g\\.co$".to_string()
                },
            ]
        );
        assert_eq!(reader.load("cn").unwrap()[1].value, "baidu.com");
        assert!(reader.load("mars").is_err());
    }

    #[test]
    fn test_geosite_truncated() {
        let mut data = encode(&[("cn", vec![(1, "cn")])]);
        data.truncate(data.len() - 1);
        let reader = GeositeReader::from_bytes(data).unwrap();
        assert!(reader.load("cn").is_err());
        assert!(GeositeReader::from_bytes(vec![1]).is_err());
    }

    #[test]
    fn test_geosite_corrupt_index() {
        let mut data = vec![0u8];
        put_uvarint(&mut data, 2);
        put_vstring(&mut data, "far");
        put_uvarint(&mut data, u64::MAX);
        put_uvarint(&mut data, 1);
        put_vstring(&mut data, "many");
        put_uvarint(&mut data, 0);
        put_uvarint(&mut data, u64::MAX >> 1);
        data.extend_from_slice(&[0, 1, b'a']);
        let reader = GeositeReader::from_bytes(data).unwrap();
        assert!(reader.load("far").is_err());
        assert!(reader.load("many").is_err());
    }
}
