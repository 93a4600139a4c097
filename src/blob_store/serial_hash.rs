//! The serial sector hash chain.
//!
//! `H_i = BLAKE2b-256(H_{i-1} ‖ S_i)` with `H_{-1} = 0`. The last link, `H_{sector_size-1}`, is the
//! blob's sector tip hash; a blob with no sectors has the zero tip. Because each link covers the
//! previous one, a verifier holding `H_{k-1}` can check sectors `k..n` against a signed tip without
//! re-reading sectors `0..k`.

use std::io::{self, Read};

use crate::types::{
    crypto_primitives::{CryptoHasher, Digest},
    data_types::{CryptoHash, Sector, SECTOR_LEN},
};

/// Extend the chain ending at `prev` by one sector.
pub fn chain(prev: &CryptoHash, sector: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(prev.bytes());
    hasher.update(sector);
    CryptoHash::new(hasher.finalize().into())
}

/// Read `n` sectors from `reader` and return their chain links, starting from `prev`.
pub fn serial_hash(reader: &mut impl Read, prev: CryptoHash, n: usize) -> io::Result<Vec<CryptoHash>> {
    let mut buf = vec![0u8; SECTOR_LEN];
    let mut hashes = Vec::with_capacity(n);
    let mut link = prev;
    for _ in 0..n {
        reader.read_exact(&mut buf)?;
        link = chain(&link, &buf);
        hashes.push(link);
    }
    Ok(hashes)
}

/// Chain links of `sectors`, starting from `prev`.
pub fn serial_hash_sectors(prev: CryptoHash, sectors: &[Sector]) -> Vec<CryptoHash> {
    let mut link = prev;
    sectors
        .iter()
        .map(|sector| {
            link = chain(&link, sector.bytes());
            link
        })
        .collect()
}

/// The tip of a chain whose links are `hashes`.
pub fn tip(hashes: &[CryptoHash]) -> CryptoHash {
    hashes.last().copied().unwrap_or(CryptoHash::ZERO)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sectors(n: u8) -> Vec<Sector> {
        (0..n).map(Sector::filled).collect()
    }

    #[test]
    fn reader_and_slice_agree() {
        let sectors = sectors(4);
        let bytes: Vec<u8> = sectors.iter().flat_map(|s| s.bytes().to_vec()).collect();
        let from_reader = serial_hash(&mut Cursor::new(bytes), CryptoHash::ZERO, 4).unwrap();
        assert_eq!(from_reader, serial_hash_sectors(CryptoHash::ZERO, &sectors));
    }

    #[test]
    fn chains_can_resume_from_any_link() {
        let sectors = sectors(6);
        let full = serial_hash_sectors(CryptoHash::ZERO, &sectors);
        let resumed = serial_hash_sectors(full[2], &sectors[3..]);
        assert_eq!(tip(&resumed), tip(&full));
    }

    #[test]
    fn any_byte_change_changes_the_tip() {
        let mut sectors = sectors(3);
        let original = tip(&serial_hash_sectors(CryptoHash::ZERO, &sectors));
        sectors[1].bytes_mut()[100] ^= 1;
        assert_ne!(tip(&serial_hash_sectors(CryptoHash::ZERO, &sectors)), original);
    }

    #[test]
    fn empty_chains_have_the_zero_tip() {
        assert_eq!(tip(&[]), CryptoHash::ZERO);
    }

    #[test]
    fn short_readers_fail() {
        let result = serial_hash(&mut Cursor::new(vec![0u8; 10]), CryptoHash::ZERO, 1);
        assert!(result.is_err());
    }
}
