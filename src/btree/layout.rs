//! On-page node layout: a small fixed header, a tail-growing slot array
//! (the search vector) and head-growing key/value data, so that ordered
//! insertion doesn't require rewriting the whole page.
//!
//! Grounded on the teacher's `pages/header.rs` `TwoArrayTrailer` (two
//! counts describing two regions that grow toward each other) and
//! `crab-dads`' `page::traits::PageLayout` (key/value framing contract),
//! reimplemented over safe `&[u8]`/`&mut [u8]` slices per `SPEC_FULL.md`
//! §3 rather than the teacher's raw-pointer `VarPageIter`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::page::{read_page_id, write_page_id, PageId};

pub const HEADER_LEN: usize = 16;

const OFF_NODE_TYPE: usize = 0;
const OFF_FLAGS: usize = 1;
const OFF_KEY_COUNT: usize = 2;
const OFF_FREE_END: usize = 4;
const OFF_GARBAGE: usize = 6;
const OFF_LEFTMOST_CHILD: usize = 8; // 6 bytes, internal nodes only

pub const NODE_TYPE_LEAF: u8 = 1;
pub const NODE_TYPE_INTERNAL: u8 = 0;

/// Fraction of a node's usable payload above which a value is stored
/// fragmented instead of inline, per the specification (~0.75).
pub fn max_inline_value_size(page_size: usize) -> usize {
    (page_size - HEADER_LEN) * 3 / 4
}

fn slot_offset(i: usize) -> usize {
    HEADER_LEN + i * 2
}

/// A parsed view of a node page's header fields.
pub struct Header {
    pub node_type: u8,
    pub key_count: u16,
    pub free_end: u16,
    pub garbage: u16,
    /// Internal nodes only: the child covering keys less than `key_at(0)`.
    pub leftmost_child: PageId,
}

pub fn read_header(buf: &[u8]) -> Header {
    Header {
        node_type: buf[OFF_NODE_TYPE],
        key_count: LittleEndian::read_u16(&buf[OFF_KEY_COUNT..OFF_KEY_COUNT + 2]),
        free_end: LittleEndian::read_u16(&buf[OFF_FREE_END..OFF_FREE_END + 2]),
        garbage: LittleEndian::read_u16(&buf[OFF_GARBAGE..OFF_GARBAGE + 2]),
        leftmost_child: read_page_id(&buf[OFF_LEFTMOST_CHILD..OFF_LEFTMOST_CHILD + 6]),
    }
}

fn write_header(buf: &mut [u8], h: &Header) {
    buf[OFF_NODE_TYPE] = h.node_type;
    buf[OFF_FLAGS] = 0;
    LittleEndian::write_u16(&mut buf[OFF_KEY_COUNT..OFF_KEY_COUNT + 2], h.key_count);
    LittleEndian::write_u16(&mut buf[OFF_FREE_END..OFF_FREE_END + 2], h.free_end);
    LittleEndian::write_u16(&mut buf[OFF_GARBAGE..OFF_GARBAGE + 2], h.garbage);
    write_page_id(
        &mut buf[OFF_LEFTMOST_CHILD..OFF_LEFTMOST_CHILD + 6],
        h.leftmost_child,
    );
}

pub fn init_leaf(buf: &mut [u8]) {
    write_header(
        buf,
        &Header {
            node_type: NODE_TYPE_LEAF,
            key_count: 0,
            free_end: buf.len() as u16,
            garbage: 0,
            leftmost_child: 0,
        },
    );
}

pub fn init_internal(buf: &mut [u8], leftmost_child: PageId) {
    write_header(
        buf,
        &Header {
            node_type: NODE_TYPE_INTERNAL,
            key_count: 0,
            free_end: buf.len() as u16,
            garbage: 0,
            leftmost_child,
        },
    );
}

pub fn is_leaf(buf: &[u8]) -> bool {
    buf[OFF_NODE_TYPE] == NODE_TYPE_LEAF
}

pub fn key_count(buf: &[u8]) -> usize {
    LittleEndian::read_u16(&buf[OFF_KEY_COUNT..OFF_KEY_COUNT + 2]) as usize
}

fn slot(buf: &[u8], i: usize) -> usize {
    LittleEndian::read_u16(&buf[slot_offset(i)..slot_offset(i) + 2]) as usize
}

fn set_slot(buf: &mut [u8], i: usize, off: usize) {
    LittleEndian::write_u16(&mut buf[slot_offset(i)..slot_offset(i) + 2], off as u16);
}

/// Read the key at data offset `off` (leaf entry layout:
/// `[frag_flag:u8][key_len:u16][value_len:u32][key][value]`).
fn leaf_entry_key_len(buf: &[u8], off: usize) -> usize {
    LittleEndian::read_u16(&buf[off + 1..off + 3]) as usize
}

fn leaf_entry_value_len(buf: &[u8], off: usize) -> usize {
    LittleEndian::read_u32(&buf[off + 3..off + 7]) as usize
}

pub fn leaf_key_at(buf: &[u8], i: usize) -> &[u8] {
    let off = slot(buf, i);
    let klen = leaf_entry_key_len(buf, off);
    &buf[off + 7..off + 7 + klen]
}

pub fn leaf_fragmented_at(buf: &[u8], i: usize) -> bool {
    let off = slot(buf, i);
    buf[off] != 0
}

pub fn leaf_value_at(buf: &[u8], i: usize) -> &[u8] {
    let off = slot(buf, i);
    let klen = leaf_entry_key_len(buf, off);
    let vlen = leaf_entry_value_len(buf, off);
    &buf[off + 7 + klen..off + 7 + klen + vlen]
}

fn leaf_entry_size(key: &[u8], value: &[u8]) -> usize {
    7 + key.len() + value.len()
}

/// Binary search for `key` among this node's sorted entries. `Ok(i)` means
/// an exact match at slot `i`; `Err(i)` means `key` would sort at slot `i`.
pub fn search(buf: &[u8], key: &[u8], is_leaf_node: bool) -> std::result::Result<usize, usize> {
    let n = key_count(buf);
    let key_at = |i: usize| -> &[u8] {
        if is_leaf_node {
            leaf_key_at(buf, i)
        } else {
            internal_key_at(buf, i)
        }
    };
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match key_at(mid).cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

fn used_low(buf: &[u8]) -> usize {
    HEADER_LEN + key_count(buf) * 2
}

fn free_bytes(buf: &[u8]) -> usize {
    let h = read_header(buf);
    (h.free_end as usize).saturating_sub(used_low(buf))
}

/// Rewrite the node, dropping garbage bytes from deleted/updated entries.
fn compact_leaf(buf: &mut [u8]) {
    let n = key_count(buf);
    let mut entries: Vec<(u8, Vec<u8>, Vec<u8>)> = Vec::with_capacity(n);
    for i in 0..n {
        let off = slot(buf, i);
        let flag = buf[off];
        let klen = leaf_entry_key_len(buf, off);
        let vlen = leaf_entry_value_len(buf, off);
        let key = buf[off + 7..off + 7 + klen].to_vec();
        let value = buf[off + 7 + klen..off + 7 + klen + vlen].to_vec();
        entries.push((flag, key, value));
    }
    let page_len = buf.len();
    let mut write_at = page_len;
    let mut new_slots = vec![0u16; n];
    for (i, (flag, key, value)) in entries.iter().enumerate() {
        let size = leaf_entry_size(key, value);
        write_at -= size;
        let off = write_at;
        buf[off] = *flag;
        LittleEndian::write_u16(&mut buf[off + 1..off + 3], key.len() as u16);
        LittleEndian::write_u32(&mut buf[off + 3..off + 7], value.len() as u32);
        buf[off + 7..off + 7 + key.len()].copy_from_slice(key);
        buf[off + 7 + key.len()..off + 7 + key.len() + value.len()].copy_from_slice(value);
        new_slots[i] = off as u16;
    }
    for (i, off) in new_slots.into_iter().enumerate() {
        set_slot(buf, i, off as usize);
    }
    let mut h = read_header(buf);
    h.free_end = write_at as u16;
    h.garbage = 0;
    write_header(buf, &h);
}

/// Insert (or replace) a leaf entry, returning `Err(PageError::OutofSpace)`
/// (via [`Error::InvalidArgument`] unused; callers check free space first)
/// if the node must be split before this insert can proceed.
pub fn leaf_try_insert(buf: &mut [u8], key: &[u8], value: &[u8], fragmented: bool) -> Result<bool> {
    let needed = leaf_entry_size(key, value);
    match search(buf, key, true) {
        Ok(i) => {
            // Replace in place: mark old bytes as garbage, append new entry,
            // repoint the slot. A compaction later reclaims the garbage.
            let old_off = slot(buf, i);
            let old_size = leaf_entry_size(
                leaf_key_at(buf, i),
                leaf_value_at(buf, i),
            );
            if free_bytes(buf) < needed {
                compact_leaf(buf);
            }
            if free_bytes(buf) < needed {
                return Ok(false);
            }
            let mut h = read_header(buf);
            let new_off = h.free_end as usize - needed;
            buf[new_off] = if fragmented { 1 } else { 0 };
            LittleEndian::write_u16(&mut buf[new_off + 1..new_off + 3], key.len() as u16);
            LittleEndian::write_u32(&mut buf[new_off + 3..new_off + 7], value.len() as u32);
            buf[new_off + 7..new_off + 7 + key.len()].copy_from_slice(key);
            buf[new_off + 7 + key.len()..new_off + 7 + key.len() + value.len()]
                .copy_from_slice(value);
            set_slot(buf, i, new_off);
            h.free_end = new_off as u16;
            h.garbage += old_size as u16;
            write_header(buf, &h);
            let _ = old_off;
            Ok(true)
        }
        Err(i) => {
            if free_bytes(buf) < needed + 2 {
                compact_leaf(buf);
            }
            if free_bytes(buf) < needed + 2 {
                return Ok(false);
            }
            let mut h = read_header(buf);
            let new_off = h.free_end as usize - needed;
            buf[new_off] = if fragmented { 1 } else { 0 };
            LittleEndian::write_u16(&mut buf[new_off + 1..new_off + 3], key.len() as u16);
            LittleEndian::write_u32(&mut buf[new_off + 3..new_off + 7], value.len() as u32);
            buf[new_off + 7..new_off + 7 + key.len()].copy_from_slice(key);
            buf[new_off + 7 + key.len()..new_off + 7 + key.len() + value.len()]
                .copy_from_slice(value);
            // Shift slots at and beyond `i` up by one to make room.
            let n = h.key_count as usize;
            for j in (i..n).rev() {
                let v = slot(buf, j);
                set_slot(buf, j + 1, v);
            }
            set_slot(buf, i, new_off);
            h.key_count += 1;
            h.free_end = new_off as u16;
            write_header(buf, &h);
            Ok(true)
        }
    }
}

pub fn leaf_delete(buf: &mut [u8], key: &[u8]) -> Result<bool> {
    match search(buf, key, true) {
        Err(_) => Ok(false),
        Ok(i) => {
            let size = leaf_entry_size(leaf_key_at(buf, i), leaf_value_at(buf, i));
            let n = key_count(buf);
            for j in i..n - 1 {
                let v = slot(buf, j + 1);
                set_slot(buf, j, v);
            }
            let mut h = read_header(buf);
            h.key_count -= 1;
            h.garbage += size as u16;
            write_header(buf, &h);
            Ok(true)
        }
    }
}

/// Split a full leaf in half by entry count, moving the upper half into
/// `right`. Returns the median key, which the caller inserts into the
/// parent separating `buf` (left) from `right`.
pub fn leaf_split(buf: &mut [u8], right: &mut [u8]) -> Vec<u8> {
    init_leaf(right);
    let n = key_count(buf);
    let mid = n / 2;
    let moved: Vec<(u8, Vec<u8>, Vec<u8>)> = (mid..n)
        .map(|i| {
            (
                leaf_fragmented_at(buf, i) as u8,
                leaf_key_at(buf, i).to_vec(),
                leaf_value_at(buf, i).to_vec(),
            )
        })
        .collect();
    for (flag, key, value) in &moved {
        leaf_try_insert(right, key, value, *flag != 0).expect("right sibling has room");
    }
    let median = moved[0].1.clone();
    for i in (mid..n).rev() {
        leaf_delete(buf, &leaf_key_at(buf, i).to_vec()).ok();
    }
    median
}

pub fn leaf_is_empty(buf: &[u8]) -> bool {
    key_count(buf) == 0
}

pub fn leaf_iter(buf: &[u8]) -> impl Iterator<Item = (Vec<u8>, Vec<u8>, bool)> + '_ {
    (0..key_count(buf)).map(move |i| {
        (
            leaf_key_at(buf, i).to_vec(),
            leaf_value_at(buf, i).to_vec(),
            leaf_fragmented_at(buf, i),
        )
    })
}

// --- internal node entries: [right_child:6][key_len:u16][key] ---
//
// Entry `i` is `(key_i, child_i)` where `child_i` covers keys `>= key_i`
// up to (but excluding) `key_{i+1}`. The header's `leftmost_child` covers
// keys `< key_0`. This makes promoting a split's median trivial: the new
// `(median, right_sibling_id)` pair is just inserted as a new entry: the
// child that used to occupy that gap is untouched, since every entry owns
// its own right-side pointer independently.

fn internal_entry_key_len(buf: &[u8], off: usize) -> usize {
    LittleEndian::read_u16(&buf[off + 6..off + 8]) as usize
}

pub fn internal_key_at(buf: &[u8], i: usize) -> &[u8] {
    let off = slot(buf, i);
    let klen = internal_entry_key_len(buf, off);
    &buf[off + 8..off + 8 + klen]
}

fn internal_entry_child_at(buf: &[u8], i: usize) -> PageId {
    let off = slot(buf, i);
    read_page_id(&buf[off..off + 6])
}

/// `child_at(0..key_count)` is entry `i`'s right child; `child_at(key_count)`
/// is undefined for internal nodes here — use [`internal_leftmost_child`]
/// for the gap before `key_0`. Kept for leaf/internal-agnostic callers that
/// already know `i <= key_count - 1`, plus the boundary case `i == key_count`
/// used by `descend_rightmost`, which this resolves to the last entry.
pub fn internal_child_at(buf: &[u8], i: usize) -> PageId {
    let n = key_count(buf);
    if n == 0 {
        return read_header(buf).leftmost_child;
    }
    if i >= n {
        internal_entry_child_at(buf, n - 1)
    } else if i == 0 {
        read_header(buf).leftmost_child
    } else {
        internal_entry_child_at(buf, i - 1)
    }
}

pub fn internal_leftmost_child(buf: &[u8]) -> PageId {
    read_header(buf).leftmost_child
}

fn internal_entry_size(key: &[u8]) -> usize {
    8 + key.len()
}

/// Resolve the child to descend into for `key`.
pub fn internal_child_for_key(buf: &[u8], key: &[u8]) -> PageId {
    match search(buf, key, false) {
        Ok(i) => internal_entry_child_at(buf, i),
        Err(0) => read_header(buf).leftmost_child,
        Err(i) => internal_entry_child_at(buf, i - 1),
    }
}

/// Same resolution as [`internal_child_for_key`], expressed as an index
/// into `internal_child_at` (0 meaning the leftmost-child gap).
pub fn internal_child_index_for(buf: &[u8], key: &[u8]) -> usize {
    match search(buf, key, false) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

/// Insert a new `(key, right_child)` separator. Used both for ordinary
/// internal-node growth and to promote a child split's median upward.
pub fn internal_try_insert(buf: &mut [u8], key: &[u8], right_child: PageId) -> bool {
    let needed = internal_entry_size(key);
    if free_bytes(buf) < needed + 2 {
        return false;
    }
    let Err(i) = search(buf, key, false) else {
        return false; // separator keys are unique by construction
    };
    let mut h = read_header(buf);
    let new_off = h.free_end as usize - needed;
    write_page_id(&mut buf[new_off..new_off + 6], right_child);
    LittleEndian::write_u16(&mut buf[new_off + 6..new_off + 8], key.len() as u16);
    buf[new_off + 8..new_off + 8 + key.len()].copy_from_slice(key);
    let n = h.key_count as usize;
    for j in (i..n).rev() {
        let v = slot(buf, j);
        set_slot(buf, j + 1, v);
    }
    set_slot(buf, i, new_off);
    h.key_count += 1;
    h.free_end = new_off as u16;
    write_header(buf, &h);
    true
}

pub fn internal_remove_at(buf: &mut [u8], i: usize) {
    let n = key_count(buf);
    for j in i..n - 1 {
        let v = slot(buf, j + 1);
        set_slot(buf, j, v);
    }
    let mut h = read_header(buf);
    h.key_count -= 1;
    write_header(buf, &h);
}

pub fn internal_iter(buf: &[u8]) -> impl Iterator<Item = (Vec<u8>, PageId)> + '_ {
    (0..key_count(buf)).map(move |i| (internal_key_at(buf, i).to_vec(), internal_entry_child_at(buf, i)))
}

/// Split a full internal node. The middle key is promoted out (returned,
/// along with the new right sibling's id is the caller's concern) rather
/// than duplicated into either side.
pub fn internal_split(buf: &mut [u8], right: &mut [u8]) -> Vec<u8> {
    let n = key_count(buf);
    let mid = n / 2;
    let median = internal_key_at(buf, mid).to_vec();
    let entries: Vec<(Vec<u8>, PageId)> = (mid + 1..n)
        .map(|i| (internal_key_at(buf, i).to_vec(), internal_entry_child_at(buf, i)))
        .collect();
    let right_leftmost = internal_entry_child_at(buf, mid);
    init_internal(right, right_leftmost);
    for (key, child) in &entries {
        internal_try_insert(right, key, *child);
    }
    let mut h = read_header(buf);
    h.key_count = mid as u16;
    write_header(buf, &h);
    median
}

pub fn has_room_for_leaf_entry(page_size: usize, buf: &[u8], key: &[u8], value: &[u8]) -> bool {
    free_bytes(buf) >= leaf_entry_size(key, value) + 2 || {
        let _ = page_size;
        false
    }
}

/// Conservative "should split before inserting" thresholds used by the
/// preemptive-split writer, so a node is never found completely full only
/// after descending into it.
pub fn leaf_needs_split(page_size: usize, buf: &[u8], key: &[u8], value: &[u8]) -> bool {
    !has_room_for_leaf_entry(page_size, buf, key, value)
}

pub fn internal_needs_split(page_size: usize, buf: &[u8]) -> bool {
    free_bytes(buf) < page_size / 4
}

/// Repoint a child pointer after the child was copy-on-write dirtied and
/// given a fresh page id. Exactly one of `leftmost_child` or an entry's
/// child must match `old_id`.
pub fn internal_repoint(buf: &mut [u8], old_id: PageId, new_id: PageId) {
    let mut h = read_header(buf);
    if h.leftmost_child == old_id {
        h.leftmost_child = new_id;
        write_header(buf, &h);
        return;
    }
    let n = key_count(buf);
    for i in 0..n {
        if internal_entry_child_at(buf, i) == old_id {
            let off = slot(buf, i);
            write_page_id(&mut buf[off..off + 6], new_id);
            return;
        }
    }
}

pub fn validate(buf: &[u8]) -> Result<()> {
    let h = read_header(buf);
    if used_low(buf) > h.free_end as usize || h.free_end as usize > buf.len() {
        return Err(Error::CorruptStore("b+tree node layout bounds violated".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_insert_find_delete() {
        let mut buf = vec![0u8; 4096];
        init_leaf(&mut buf);
        assert!(leaf_try_insert(&mut buf, b"b", b"2", false).unwrap());
        assert!(leaf_try_insert(&mut buf, b"a", b"1", false).unwrap());
        assert!(leaf_try_insert(&mut buf, b"c", b"3", false).unwrap());
        assert_eq!(key_count(&buf), 3);
        assert_eq!(leaf_key_at(&buf, 0), b"a");
        assert_eq!(leaf_key_at(&buf, 1), b"b");
        assert_eq!(leaf_key_at(&buf, 2), b"c");
        assert_eq!(leaf_value_at(&buf, 1), b"2");
        assert!(leaf_delete(&mut buf, b"b").unwrap());
        assert_eq!(key_count(&buf), 2);
        assert!(search(&buf, b"b", true).is_err());
    }

    #[test]
    fn leaf_replace_updates_value() {
        let mut buf = vec![0u8; 4096];
        init_leaf(&mut buf);
        leaf_try_insert(&mut buf, b"k", b"v1", false).unwrap();
        leaf_try_insert(&mut buf, b"k", b"v2-longer", false).unwrap();
        assert_eq!(key_count(&buf), 1);
        assert_eq!(leaf_value_at(&buf, 0), b"v2-longer");
    }

    #[test]
    fn leaf_split_moves_upper_half() {
        let mut left = vec![0u8; 512];
        init_leaf(&mut left);
        for i in 0..10u8 {
            leaf_try_insert(&mut left, &[i], &[i], false).unwrap();
        }
        let mut right = vec![0u8; 512];
        let median = leaf_split(&mut left, &mut right);
        assert!(key_count(&left) < 10);
        assert!(key_count(&right) > 0);
        assert_eq!(median, vec![5u8]);
    }

    #[test]
    fn internal_insert_and_child_lookup() {
        // leftmost covers < "g"; "g" covers [g, m); "m" covers [m, inf)
        let mut buf = vec![0u8; 4096];
        init_internal(&mut buf, 1 /* leftmost child */);
        internal_try_insert(&mut buf, b"m", 10);
        internal_try_insert(&mut buf, b"g", 5);
        assert_eq!(internal_child_for_key(&buf, b"a"), 1);
        assert_eq!(internal_child_for_key(&buf, b"g"), 5);
        assert_eq!(internal_child_for_key(&buf, b"h"), 5);
        assert_eq!(internal_child_for_key(&buf, b"m"), 10);
        assert_eq!(internal_child_for_key(&buf, b"z"), 10);
    }

    #[test]
    fn internal_split_promotes_median() {
        let mut left = vec![0u8; 512];
        init_internal(&mut left, 1);
        for i in 0..10u8 {
            internal_try_insert(&mut left, &[i], (i + 2) as PageId);
        }
        let mut right = vec![0u8; 512];
        let median = internal_split(&mut left, &mut right);
        assert_eq!(median, vec![5u8]);
        assert!(key_count(&left) < 10);
        assert!(key_count(&right) > 0);
    }
}
