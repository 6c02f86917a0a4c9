use crate::suffix::SuffixArray;

/// A match must beat the running score of the current alignment by more than this
/// many bytes before a new block is started.
const MATCH_SLACK: isize = 8;

/// One bsdiff instruction: add `copy_len` diff bytes onto old data, append `extra_len`
/// literal bytes, then move the old cursor by `seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub copy_len: i64,
    pub extra_len: i64,
    pub seek: i64,
}

/// Owned output of one diff run.
#[derive(Debug, Default)]
pub struct Delta {
    pub controls: Vec<Control>,
    /// Byte-wise `new - old` (wrapping) for every copied region, concatenated.
    pub diff: Vec<u8>,
    /// Literal bytes for every extra region, concatenated.
    pub extra: Vec<u8>,
}

/// Compute the bsdiff control stream that turns `old` into `new`.
///
/// Scans `new` with the suffix array of `old`, extends each match forwards and
/// backwards with approximate (byte-wise difference) matching, and trims overlapping
/// extensions so every byte of `new` is covered exactly once.
pub fn compute_diff(old: &[u8], new: &[u8]) -> Delta {
    let index = SuffixArray::new(old);
    let mut delta = Delta::default();

    let old_len = old.len() as isize;
    let new_len = new.len() as isize;
    let old_at = |i: isize| old[i as usize];
    let new_at = |i: isize| new[i as usize];
    // Does new[i] agree with old[i + offset]?
    let agrees = |i: isize, offset: isize| {
        let o = i + offset;
        o >= 0 && o < old_len && old_at(o) == new_at(i)
    };

    let mut scan: isize = 0;
    let mut pos: isize = 0;
    let mut len: isize = 0;
    let mut last_scan: isize = 0;
    let mut last_pos: isize = 0;
    let mut last_offset: isize = 0;

    while scan < new_len {
        let mut old_score: isize = 0;
        scan += len;
        let mut scsc = scan;

        while scan < new_len {
            let (p, l) = index.longest_match(old, &new[scan as usize..]);
            pos = p as isize;
            len = l as isize;

            while scsc < scan + len {
                if agrees(scsc, last_offset) {
                    old_score += 1;
                }
                scsc += 1;
            }

            if (len == old_score && len != 0) || len > old_score + MATCH_SLACK {
                break;
            }

            if agrees(scan, last_offset) {
                old_score -= 1;
            }
            scan += 1;
        }

        if len == old_score && scan != new_len {
            continue;
        }

        // Forward extension from the previous block.
        let mut len_f: isize = 0;
        {
            let (mut s, mut best, mut i) = (0isize, 0isize, 0isize);
            while last_scan + i < scan && last_pos + i < old_len {
                if old_at(last_pos + i) == new_at(last_scan + i) {
                    s += 1;
                }
                i += 1;
                if s * 2 - i > best * 2 - len_f {
                    best = s;
                    len_f = i;
                }
            }
        }

        // Backward extension from the new match.
        let mut len_b: isize = 0;
        if scan < new_len {
            let (mut s, mut best, mut i) = (0isize, 0isize, 1isize);
            while scan >= last_scan + i && pos >= i {
                if old_at(pos - i) == new_at(scan - i) {
                    s += 1;
                }
                if s * 2 - i > best * 2 - len_b {
                    best = s;
                    len_b = i;
                }
                i += 1;
            }
        }

        // Resolve overlap: pick the split that keeps the most matching bytes.
        if last_scan + len_f > scan - len_b {
            let overlap = (last_scan + len_f) - (scan - len_b);
            let (mut s, mut best, mut len_s) = (0isize, 0isize, 0isize);
            for i in 0..overlap {
                if new_at(last_scan + len_f - overlap + i) == old_at(last_pos + len_f - overlap + i) {
                    s += 1;
                }
                if new_at(scan - len_b + i) == old_at(pos - len_b + i) {
                    s -= 1;
                }
                if s > best {
                    best = s;
                    len_s = i + 1;
                }
            }
            len_f += len_s - overlap;
            len_b -= len_s;
        }

        let copy_new = last_scan as usize;
        let copy_old = last_pos as usize;
        delta.diff.extend(
            new[copy_new..copy_new + len_f as usize]
                .iter()
                .zip(&old[copy_old..copy_old + len_f as usize])
                .map(|(n, o)| n.wrapping_sub(*o)),
        );

        let extra_start = (last_scan + len_f) as usize;
        let extra_len = (scan - len_b) - (last_scan + len_f);
        delta
            .extra
            .extend_from_slice(&new[extra_start..extra_start + extra_len as usize]);

        delta.controls.push(Control {
            copy_len: len_f as i64,
            extra_len: extra_len as i64,
            seek: ((pos - len_b) - (last_pos + len_f)) as i64,
        });

        last_scan = scan - len_b;
        last_pos = pos - len_b;
        last_offset = pos - scan;
    }

    delta
}
