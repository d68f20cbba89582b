//! Byte-exact GNU tar header encoding.
//!
//! A header is assembled in a 512-byte array by small field writers, each of
//! which returns the offset just past the field it wrote.

use crate::{Error, Result};

pub const BLOCK_SIZE: usize = 512;
pub const NAME_LEN: usize = 100;
pub const LINK_NAME_LEN: usize = 100;

const MODE_LEN: usize = 8;
const UID_LEN: usize = 8;
const GID_LEN: usize = 8;
const SIZE_LEN: usize = 12;
const MTIME_LEN: usize = 12;
const CHECKSUM_OFFSET: usize = 148;
const CHECKSUM_LEN: usize = 8;
const USER_NAME_LEN: usize = 32;
const GROUP_NAME_LEN: usize = 32;
const DEV_LEN: usize = 8;

/// GNU magic ("ustar ") followed by the GNU version field (" \0").
const GNU_MAGIC: &[u8; 8] = b"ustar  \0";

/// Name carried by GNU long-name/long-link records.
pub const LONG_LINK_NAME: &str = "././@LongLink";

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TypeFlag {
    #[default]
    Regular = b'0',
    Link = b'1',
    Symlink = b'2',
    CharDevice = b'3',
    BlockDevice = b'4',
    Directory = b'5',
    Fifo = b'6',
    LongLink = b'K',
    LongName = b'L',
}

/// Field values of one header block.
#[derive(Clone, Debug, Default)]
pub struct Header {
    pub name: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: i64,
    pub type_flag: TypeFlag,
    pub link_name: String,
    pub user_name: String,
    pub group_name: String,
    pub dev_major: u64,
    pub dev_minor: u64,
}

impl Header {
    /// Header of a GNU `L`/`K` record whose payload is `len` bytes long.
    pub fn long_record(type_flag: TypeFlag, len: usize) -> Self {
        Self {
            name: LONG_LINK_NAME.to_string(),
            size: len as u64,
            type_flag,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];

        let at = put_str(&mut block, 0, self.name.as_bytes(), NAME_LEN);
        let at = put_numeric(&mut block, at, "mode", self.mode.into(), MODE_LEN)?;
        let at = put_numeric(&mut block, at, "uid", self.uid.into(), UID_LEN)?;
        let at = put_numeric(&mut block, at, "gid", self.gid.into(), GID_LEN)?;
        let at = put_numeric(&mut block, at, "size", self.size.into(), SIZE_LEN)?;
        let at = put_numeric(&mut block, at, "mtime", self.mtime.into(), MTIME_LEN)?;
        let at = fill(&mut block, at, b' ', CHECKSUM_LEN);
        let at = put_byte(&mut block, at, self.type_flag as u8);
        let at = put_str(&mut block, at, self.link_name.as_bytes(), LINK_NAME_LEN);
        let at = put_str(&mut block, at, GNU_MAGIC, GNU_MAGIC.len());
        let at = put_str(&mut block, at, self.user_name.as_bytes(), USER_NAME_LEN);
        let at = put_str(&mut block, at, self.group_name.as_bytes(), GROUP_NAME_LEN);
        let at = put_numeric(&mut block, at, "devmajor", self.dev_major.into(), DEV_LEN)?;
        put_numeric(&mut block, at, "devminor", self.dev_minor.into(), DEV_LEN)?;

        write_checksum(&mut block);
        Ok(block)
    }
}

/// Copies at most `width` bytes of `value`; the rest of the field stays zero.
fn put_str(block: &mut [u8], at: usize, value: &[u8], width: usize) -> usize {
    let len = value.len().min(width);
    block[at..at + len].copy_from_slice(&value[..len]);
    at + width
}

fn put_byte(block: &mut [u8], at: usize, value: u8) -> usize {
    block[at] = value;
    at + 1
}

fn fill(block: &mut [u8], at: usize, value: u8, count: usize) -> usize {
    block[at..at + count].fill(value);
    at + count
}

/// Zero-padded octal with a trailing NUL when the value fits in `width - 1`
/// digits, GNU base-256 otherwise.
fn put_numeric(
    block: &mut [u8],
    at: usize,
    field: &'static str,
    value: i128,
    width: usize,
) -> Result<usize> {
    let digits = width - 1;
    if (0..1i128 << (3 * digits)).contains(&value) {
        let text = format!("{value:0digits$o}");
        block[at..at + digits].copy_from_slice(text.as_bytes());
        block[at + digits] = 0;
        return Ok(at + width);
    }

    // Two's complement over the whole field; the first byte carries the
    // marker bit (0x80) and doubles as sign extension for negatives (0xff).
    let bound = 1i128 << (8 * digits);
    if value < -bound || value >= bound {
        return Err(Error::FieldOverflow {
            field,
            value,
            width,
        });
    }
    let bytes = value.to_be_bytes();
    block[at] = if value < 0 { 0xff } else { 0x80 };
    block[at + 1..at + width].copy_from_slice(&bytes[bytes.len() - digits..]);
    Ok(at + width)
}

/// Unsigned byte sum with the checksum field counted as spaces, stored as six
/// octal digits, NUL and space.
fn write_checksum(block: &mut [u8; BLOCK_SIZE]) {
    block[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].fill(b' ');
    let sum: u32 = block.iter().map(|&b| u32::from(b)).sum();
    let text = format!("{sum:06o}\0 ");
    block[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].copy_from_slice(text.as_bytes());
}

/// Zero bytes needed after `len` payload bytes to reach a block boundary.
pub fn padding(len: u64) -> usize {
    let rem = (len % BLOCK_SIZE as u64) as usize;
    if rem == 0 { 0 } else { BLOCK_SIZE - rem }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Decodes a numeric field the way GNU tar reads it.
    pub(crate) fn decode_numeric(field: &[u8]) -> i128 {
        if field[0] & 0x80 != 0 {
            let negative = field[0] == 0xff;
            let mut value: i128 = if negative { -1 } else { 0 };
            for &b in &field[1..] {
                value = (value << 8) | i128::from(b);
            }
            return value;
        }
        let text: String = field
            .iter()
            .take_while(|&&b| b != 0 && b != b' ')
            .map(|&b| b as char)
            .collect();
        i128::from_str_radix(text.trim(), 8).unwrap_or(0)
    }

    pub(crate) fn checksum_is_valid(block: &[u8]) -> bool {
        let mut copy = block.to_vec();
        copy[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].fill(b' ');
        let expected: u32 = copy.iter().map(|&b| u32::from(b)).sum();
        let stored = &block[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN];
        stored[6] == 0
            && stored[7] == b' '
            && u32::from_str_radix(std::str::from_utf8(&stored[..6]).unwrap(), 8).unwrap()
                == expected
    }

    fn sample() -> Header {
        Header {
            name: "./etc/hosts".to_string(),
            mode: 0o644,
            uid: 1000,
            gid: 100,
            size: 1234,
            mtime: 1_700_000_000,
            type_flag: TypeFlag::Regular,
            user_name: "alice".to_string(),
            group_name: "users".to_string(),
            ..Header::default()
        }
    }

    #[test]
    fn octal_fields_use_fixed_digits() {
        let block = sample().encode().unwrap();
        assert_eq!(&block[100..108], b"0000644\0");
        assert_eq!(&block[108..116], b"0001750\0");
        assert_eq!(&block[124..136], b"00000002322\0");
        assert_eq!(block[156], b'0');
        assert_eq!(&block[257..265], b"ustar  \0");
        assert_eq!(&block[265..270], b"alice");
        assert!(checksum_is_valid(&block));
    }

    #[test]
    fn reference_reader_parses_fields() {
        let block = sample().encode().unwrap();
        let parsed = tar::Header::from_byte_slice(&block);
        assert_eq!(parsed.path().unwrap().to_str(), Some("./etc/hosts"));
        assert_eq!(parsed.mode().unwrap(), 0o644);
        assert_eq!(parsed.uid().unwrap(), 1000);
        assert_eq!(parsed.gid().unwrap(), 100);
        assert_eq!(parsed.size().unwrap(), 1234);
        assert_eq!(parsed.mtime().unwrap(), 1_700_000_000);
        assert_eq!(parsed.entry_type(), tar::EntryType::Regular);
        assert_eq!(parsed.cksum().unwrap(), {
            let mut copy = block;
            copy[148..156].fill(b' ');
            copy.iter().map(|&b| u32::from(b)).sum::<u32>()
        });
    }

    #[test]
    fn large_size_switches_to_base256() {
        let size = 9 * 1024 * 1024 * 1024u64;
        let header = Header {
            size,
            ..sample()
        };
        let block = header.encode().unwrap();
        assert_eq!(block[124], 0x80);
        assert_eq!(decode_numeric(&block[124..136]), i128::from(size));
        assert_eq!(tar::Header::from_byte_slice(&block).size().unwrap(), size);
        assert!(checksum_is_valid(&block));
    }

    #[test]
    fn largest_octal_value_stays_octal() {
        let header = Header {
            size: 0o77777777777,
            ..sample()
        };
        let block = header.encode().unwrap();
        assert_eq!(&block[124..136], b"77777777777\0");

        let header = Header {
            size: 0o77777777777 + 1,
            ..sample()
        };
        let block = header.encode().unwrap();
        assert_eq!(block[124], 0x80);
        assert_eq!(decode_numeric(&block[124..136]), 0o77777777777 + 1);
    }

    #[test]
    fn negative_mtime_is_twos_complement() {
        for mtime in [-1i64, -86_400, i64::MIN] {
            let header = Header {
                mtime,
                ..sample()
            };
            let block = header.encode().unwrap();
            assert_eq!(block[136], 0xff);
            assert_eq!(decode_numeric(&block[136..148]), i128::from(mtime));
            assert!(checksum_is_valid(&block));
        }
    }

    #[test]
    fn eight_byte_fields_overflow() {
        let header = Header {
            uid: 1 << 56,
            ..sample()
        };
        match header.encode() {
            Err(Error::FieldOverflow { field, width, .. }) => {
                assert_eq!(field, "uid");
                assert_eq!(width, 8);
            }
            other => panic!("expected overflow, got {other:?}"),
        }

        let header = Header {
            uid: (1 << 56) - 1,
            ..sample()
        };
        let block = header.encode().unwrap();
        assert_eq!(decode_numeric(&block[108..116]), (1 << 56) - 1);
    }

    #[test]
    fn long_record_header() {
        let block = Header::long_record(TypeFlag::LongName, 150).encode().unwrap();
        assert_eq!(&block[..13], LONG_LINK_NAME.as_bytes());
        assert_eq!(block[156], b'L');
        assert_eq!(decode_numeric(&block[124..136]), 150);
        assert!(checksum_is_valid(&block));
    }

    #[test]
    fn padding_reaches_block_boundary() {
        for len in [0u64, 1, 511, 512, 513, 1024, 4097] {
            assert_eq!((len + padding(len) as u64) % BLOCK_SIZE as u64, 0);
        }
        assert_eq!(padding(0), 0);
        assert_eq!(padding(512), 0);
        assert_eq!(padding(1), 511);
    }
}
