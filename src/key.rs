//! The versioned internal-key codec and the total order over internal keys.
//!
//! `Key<T: AsRef<[u8]>>` is the teacher's generic byte-key wrapper
//! (`examples/CrystalAnalyst-Lsm/src/key.rs`), kept as the vehicle for the
//! block/table layers' prefix-compression code, which only ever needs raw
//! byte comparison and slicing. Layered on top is this crate's versioning:
//! every `Key` in this system wraps a fully-encoded internal key —
//!
//! ```text
//! | user_key (variable) | version: u64 LE | (seq << 8 | kind): u64 LE |
//! ```
//!
//! — so `Key::version`/`seq`/`kind`/`user_key` and the `Ord` impl (which
//! enforces the `VMAX` wildcard rule) are available generically, whether
//! `T` is `&[u8]`, `Vec<u8>`, or `Bytes`.
//!
//! A second, 8-byte-trailer form (`user_key | seq << 8 | kind`) is used only
//! inside the write-ahead log; [`decode_wal`] promotes it to the 16-byte
//! form with `version = 0` on replay.
//!
//! Grounded on `examples/original_source/leveldb/dbkey/key.go`
//! (`MakeInternalKeyWithVersion` / `ParseInternalKeyWithVersion` / the
//! legacy 8-byte `MakeInternalKey`) and `comparer.go`'s `iComparer.Compare`,
//! which special-cases `keyMaxSeq`/`VMAX` exactly as implemented below.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Sentinel version meaning "the latest version of this key". Never stored;
/// only legal inside a seek key built for a query.
pub const VMAX: u64 = u64::MAX;

/// High bit of the packed `seq<<8|kind` word is reserved for `kind`; 56 bits
/// remain for the sequence counter.
pub const MAX_SEQ: u64 = (1u64 << 56) - 1;

const FIXED_TAIL_LEN: usize = 16;
const LEGACY_TAIL_LEN: usize = 8;

/// Entry kind, packed into the low 8 bits of the sequence word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Tombstone: the key is logically deleted as of this `(version, seq)`.
    Del = 0,
    /// A live value.
    Val = 1,
}

impl EntryKind {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(EntryKind::Del),
            1 => Ok(EntryKind::Val),
            other => Err(Error::corrupted(
                None,
                format!("invalid entry kind byte {other:#x}"),
            )),
        }
    }
}

/// `Seek` is used only to build a query key; it sorts identically to `Val`
/// (the highest-numbered kind), so a forward seek lands on the newest real
/// entry rather than skipping past it.
pub const SEEK_KIND: EntryKind = EntryKind::Val;

fn pack_seq_kind(seq: u64, kind: EntryKind) -> u64 {
    debug_assert!(seq <= MAX_SEQ);
    (seq << 8) | kind as u64
}

fn unpack_seq_kind(word: u64) -> Result<(u64, EntryKind)> {
    let kind = EntryKind::from_u8((word & 0xff) as u8)?;
    Ok((word >> 8, kind))
}

/// Decodes a 16-byte-trailer internal key, failing with [`Error::Corrupted`]
/// on short input or an invalid kind byte.
pub fn decode_internal(bytes: &[u8]) -> Result<(&[u8], u64, u64, EntryKind)> {
    if bytes.len() < FIXED_TAIL_LEN {
        return Err(Error::corrupted(None, "internal key too short"));
    }
    let n = bytes.len();
    let tail = &bytes[n - FIXED_TAIL_LEN..];
    let version = u64::from_le_bytes(tail[0..8].try_into().unwrap());
    let word = u64::from_le_bytes(tail[8..16].try_into().unwrap());
    let (seq, kind) = unpack_seq_kind(word)?;
    Ok((&bytes[..n - FIXED_TAIL_LEN], version, seq, kind))
}

/// Total order over internal key bytes:
/// 1. user key ascending;
/// 2. version descending, with `VMAX` sorting *before* any concrete version
///    at the same user key (the wildcard rule that lets one forward seek
///    land on the newest version);
/// 3. seq descending.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    let (uk_a, v_a, s_a, _) = decode_internal(a).expect("internal key");
    let (uk_b, v_b, s_b, _) = decode_internal(b).expect("internal key");

    let uk_cmp = uk_a.cmp(uk_b);
    if uk_cmp != Ordering::Equal {
        return uk_cmp;
    }

    match (v_a == VMAX, v_b == VMAX) {
        (true, true) => s_a.cmp(&s_b).reverse(),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => v_b.cmp(&v_a).then_with(|| s_b.cmp(&s_a)),
    }
}

/// Generic byte-key wrapper, parameterized over the backing storage so the
/// same API serves borrowed block slices, owned builder scratch space, and
/// `Bytes` handles shared across table readers.
pub struct Key<T: AsRef<[u8]>>(T);

pub type KeySlice<'a> = Key<&'a [u8]>;
pub type KeyVec = Key<Vec<u8>>;
pub type KeyBytes = Key<Bytes>;

/// Every stored key in this system is a fully-encoded internal key; this
/// alias is used at call sites that care about that meaning rather than the
/// storage representation.
pub type InternalKey = KeyBytes;

impl<T: AsRef<[u8]>> Key<T> {
    pub fn raw_ref(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    pub fn len(&self) -> usize {
        self.raw_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_ref().is_empty()
    }

    pub fn user_key(&self) -> &[u8] {
        let raw = self.raw_ref();
        &raw[..raw.len() - FIXED_TAIL_LEN]
    }

    pub fn version(&self) -> u64 {
        let raw = self.raw_ref();
        let tail = &raw[raw.len() - FIXED_TAIL_LEN..];
        u64::from_le_bytes(tail[0..8].try_into().unwrap())
    }

    pub fn seq(&self) -> u64 {
        decode_internal(self.raw_ref())
            .expect("internal key validated at construction")
            .2
    }

    pub fn kind(&self) -> EntryKind {
        decode_internal(self.raw_ref())
            .expect("internal key validated at construction")
            .3
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind() == EntryKind::Del
    }
}

impl<T: AsRef<[u8]> + Clone> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: AsRef<[u8]> + Copy> Copy for Key<T> {}

impl<T: AsRef<[u8]>> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match decode_internal(self.raw_ref()) {
            Ok((uk, v, s, k)) => write!(f, "Key({uk:?}, v={v}, s={s}, {k:?})"),
            Err(_) => write!(f, "Key(<raw {} bytes>)", self.len()),
        }
    }
}

impl<T: AsRef<[u8]>> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw_ref() == other.raw_ref()
    }
}
impl<T: AsRef<[u8]>> Eq for Key<T> {}

impl<T: AsRef<[u8]>> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: AsRef<[u8]>> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self.raw_ref(), other.raw_ref())
    }
}

impl<T: AsRef<[u8]>> std::hash::Hash for Key<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw_ref().hash(state)
    }
}

impl KeyVec {
    pub fn new() -> Self {
        Key(Vec::new())
    }

    pub fn from_vec(v: Vec<u8>) -> Self {
        Key(v)
    }

    pub fn as_key_slice(&self) -> KeySlice<'_> {
        Key(self.0.as_slice())
    }

    pub fn to_key_bytes(self) -> KeyBytes {
        Key(Bytes::from(self.0))
    }

    pub fn append(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn set_from_slice(&mut self, slice: KeySlice<'_>) {
        self.0.clear();
        self.0.extend_from_slice(slice.raw_ref());
    }

    /// Builds the 16-byte-trailer form.
    pub fn encode(user_key: &[u8], version: u64, seq: u64, kind: EntryKind) -> Self {
        let mut v = Vec::with_capacity(user_key.len() + FIXED_TAIL_LEN);
        v.extend_from_slice(user_key);
        v.extend_from_slice(&version.to_le_bytes());
        v.extend_from_slice(&pack_seq_kind(seq, kind).to_le_bytes());
        Key(v)
    }

    /// Builds a wildcard seek key for "the latest version of `user_key`".
    pub fn seek_latest(user_key: &[u8], seq: u64) -> Self {
        Self::encode(user_key, VMAX, seq, SEEK_KIND)
    }

    /// Builds a seek key for "the entry at exactly `version`, as of `seq`".
    pub fn seek_at(user_key: &[u8], version: u64, seq: u64) -> Self {
        Self::encode(user_key, version, seq, SEEK_KIND)
    }
}

impl Default for KeyVec {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> KeySlice<'a> {
    pub fn from_slice(s: &'a [u8]) -> Self {
        Key(s)
    }

    pub fn to_key_vec(self) -> KeyVec {
        Key(self.0.to_vec())
    }
}

impl KeyBytes {
    pub fn from_bytes(b: Bytes) -> Result<Self> {
        if b.len() < FIXED_TAIL_LEN {
            return Err(Error::corrupted(None, "internal key shorter than trailer"));
        }
        let k = Key(b);
        decode_internal(k.raw_ref())?;
        Ok(k)
    }

    /// An empty, never-valid key used only as an iterator "exhausted"
    /// sentinel; `is_empty()` is `true` and no other accessor is called on
    /// it.
    pub fn empty() -> Self {
        Key(Bytes::new())
    }

    pub fn as_key_slice(&self) -> KeySlice<'_> {
        Key(self.0.as_ref())
    }
}

/// Decodes the WAL-only 8-byte-trailer form (`user_key || seq<<8|kind`),
/// promoting it to a full 16-byte-trailer key with `version = 0`.
pub fn decode_wal(bytes: &[u8]) -> Result<KeyVec> {
    if bytes.len() < LEGACY_TAIL_LEN {
        return Err(Error::corrupted(None, "wal key too short"));
    }
    let n = bytes.len();
    let word = u64::from_le_bytes(bytes[n - 8..].try_into().unwrap());
    let (seq, kind) = unpack_seq_kind(word)?;
    Ok(KeyVec::encode(&bytes[..n - LEGACY_TAIL_LEN], 0, seq, kind))
}

/// Encodes the WAL-only 8-byte-trailer form.
pub fn encode_wal(user_key: &[u8], seq: u64, kind: EntryKind) -> Bytes {
    let mut buf = BytesMut::with_capacity(user_key.len() + LEGACY_TAIL_LEN);
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&pack_seq_kind(seq, kind).to_le_bytes());
    buf.freeze()
}

/// The versioned user key `uk || version`, used as the Merkle leaf input so
/// a proof holder can validate by `(uk, version, value)` alone.
pub fn versioned_user_key(user_key: &[u8], version: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(user_key.len() + 8);
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&version.to_le_bytes());
    buf.freeze()
}

/// A pluggable comparator over *user* keys, defaulting to byte-lexicographic
/// order. Held as a trait object by the engine so a caller could swap in a
/// different order without touching the internal-key machinery above, which
/// always layers version/seq on top of whatever this returns.
pub trait UserKeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl UserKeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Produces the shortest internal key `c` such that `a <= c < b` by
/// shortening the user-key portion via `ucmp` and re-attaching `(VMAX,
/// MAX_SEQ, Val)`. Used by the table writer for block-index boundary
/// entries. Returns `None` when no shortening is possible.
pub fn separator(a: KeySlice<'_>, b: KeySlice<'_>, ucmp: &dyn UserKeyComparator) -> Option<KeyVec> {
    let ua = a.user_key();
    let ub = b.user_key();
    if ucmp.compare(ua, ub) != Ordering::Less {
        return None;
    }
    let shortened = shortest_separator(ua, ub);
    if shortened.len() < ua.len() && ucmp.compare(ua, &shortened) == Ordering::Less {
        return Some(KeyVec::encode(&shortened, VMAX, MAX_SEQ, SEEK_KIND));
    }
    None
}

/// Produces the shortest internal key `>= b`'s user key, re-attached with
/// `(VMAX, MAX_SEQ, Val)`.
pub fn successor(b: KeySlice<'_>, ucmp: &dyn UserKeyComparator) -> Option<KeyVec> {
    let ub = b.user_key();
    let shortened = shortest_successor(ub);
    if shortened.len() < ub.len() && ucmp.compare(ub, &shortened) == Ordering::Less {
        return Some(KeyVec::encode(&shortened, VMAX, MAX_SEQ, SEEK_KIND));
    }
    None
}

fn shortest_separator(a: &[u8], b: &[u8]) -> Vec<u8> {
    let min_len = a.len().min(b.len());
    let mut diff_at = 0;
    while diff_at < min_len && a[diff_at] == b[diff_at] {
        diff_at += 1;
    }
    if diff_at >= min_len || a[diff_at] == 0xff || a[diff_at] + 1 >= b[diff_at] {
        a.to_vec()
    } else {
        let mut out = a[..=diff_at].to_vec();
        out[diff_at] += 1;
        out
    }
}

fn shortest_successor(b: &[u8]) -> Vec<u8> {
    for i in 0..b.len() {
        if b[i] != 0xff {
            let mut out = b[..=i].to_vec();
            out[i] += 1;
            return out;
        }
    }
    b.to_vec()
}

/// Reads a length-prefixed (`u16` LE) byte string, as used by the block and
/// WAL framing.
pub fn get_length_prefixed(buf: &mut &[u8]) -> Bytes {
    let len = buf.get_u16_le() as usize;
    let bytes = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    bytes
}

pub fn put_length_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ik = KeyVec::encode(b"hello", 42, 7, EntryKind::Val);
        let (uk, v, s, k) = decode_internal(ik.raw_ref()).unwrap();
        assert_eq!(uk, b"hello");
        assert_eq!(v, 42);
        assert_eq!(s, 7);
        assert_eq!(k, EntryKind::Val);
    }

    #[test]
    fn wal_round_trip_assigns_version_zero() {
        let wal_bytes = encode_wal(b"k", 3, EntryKind::Del);
        let ik = decode_wal(&wal_bytes).unwrap();
        assert_eq!(ik.user_key(), b"k");
        assert_eq!(ik.version(), 0);
        assert_eq!(ik.seq(), 3);
        assert!(ik.is_tombstone());
    }

    #[test]
    fn order_is_total_and_antisymmetric() {
        let a = KeyVec::encode(b"a", 1, 1, EntryKind::Val);
        let b = KeyVec::encode(b"b", 1, 1, EntryKind::Val);
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(b.cmp(&a), Ordering::Greater);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn version_descending_within_same_user_key() {
        let newer = KeyVec::encode(b"k", 5, 1, EntryKind::Val);
        let older = KeyVec::encode(b"k", 3, 1, EntryKind::Val);
        assert_eq!(newer.cmp(&older), Ordering::Less);
    }

    #[test]
    fn vmax_sorts_before_any_concrete_version() {
        let seek = KeyVec::seek_latest(b"k", VMAX);
        let stored = KeyVec::encode(b"k", 3, 100, EntryKind::Val);
        assert_eq!(seek.cmp(&stored), Ordering::Less);
        assert_eq!(stored.cmp(&seek), Ordering::Greater);
    }

    #[test]
    fn seq_breaks_ties_descending() {
        let newer_seq = KeyVec::encode(b"k", 3, 200, EntryKind::Val);
        let older_seq = KeyVec::encode(b"k", 3, 100, EntryKind::Val);
        assert_eq!(newer_seq.cmp(&older_seq), Ordering::Less);
    }

    #[test]
    fn corrupted_on_short_input() {
        assert!(decode_internal(b"short").is_err());
    }

    #[test]
    fn separator_is_between_bounds() {
        let a = KeyVec::encode(b"apple", VMAX, MAX_SEQ, EntryKind::Val);
        let b = KeyVec::encode(b"banana", VMAX, MAX_SEQ, EntryKind::Val);
        let sep = separator(a.as_key_slice(), b.as_key_slice(), &BytewiseComparator).unwrap();
        assert!(sep.as_key_slice().cmp(&a.as_key_slice()) != Ordering::Less);
        assert_eq!(sep.as_key_slice().cmp(&b.as_key_slice()), Ordering::Less);
    }
}
