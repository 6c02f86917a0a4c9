//! Suffix array construction (Larsson-Sadakane rank doubling) and longest-match search.
//!
//! `index[k]` holds the start offset of the suffix ranked `k`. Slot 0 is always the
//! empty suffix at `old.len()`, which sorts before everything else.

use std::cmp::Ordering;

/// Groups smaller than this are refined with a selection pass instead of partitioning.
const SMALL_GROUP: usize = 16;

pub struct SuffixArray {
    index: Vec<isize>,
}

/// Pending refinement work for one rank-doubling pass.
enum Pending {
    /// A run of suffixes sharing a rank that still needs partitioning.
    Group { start: usize, len: usize },
    /// The equal band `[lo, hi)` of a partitioned group, finalized once the
    /// lower partition has been refined. `end` is one past the whole group.
    Band { lo: usize, hi: usize, end: usize },
}

impl SuffixArray {
    /// Sort every suffix of `old`.
    pub fn new(old: &[u8]) -> Self {
        let n = old.len();
        let mut buckets = [0isize; 256];
        for &b in old {
            buckets[b as usize] += 1;
        }
        for i in 1..256 {
            buckets[i] += buckets[i - 1];
        }
        for i in (1..256).rev() {
            buckets[i] = buckets[i - 1];
        }
        buckets[0] = 0;

        let mut index = vec![0isize; n + 1];
        for (i, &b) in old.iter().enumerate() {
            buckets[b as usize] += 1;
            index[buckets[b as usize] as usize] = i as isize;
        }
        index[0] = n as isize;

        let mut rank = vec![0isize; n + 1];
        for (i, &b) in old.iter().enumerate() {
            rank[i] = buckets[b as usize];
        }
        rank[n] = 0;

        for i in 1..256 {
            if buckets[i] == buckets[i - 1] + 1 {
                index[buckets[i] as usize] = -1;
            }
        }
        index[0] = -1;

        // Negative entries are runs of finished suffixes; a single run covering the
        // whole array means every rank is unique.
        let total = n as isize + 1;
        let mut h = 1usize;
        while index[0] != -total {
            let mut run = 0isize;
            let mut i = 0isize;
            while i < total {
                let entry = index[i as usize];
                if entry < 0 {
                    run -= entry;
                    i -= entry;
                } else {
                    if run != 0 {
                        index[(i - run) as usize] = -run;
                    }
                    let len = rank[entry as usize] + 1 - i;
                    split(&mut index, &mut rank, i as usize, len as usize, h);
                    i += len;
                    run = 0;
                }
            }
            if run != 0 {
                index[(i - run) as usize] = -run;
            }
            h += h;
        }

        for (pos, &r) in rank.iter().enumerate() {
            index[r as usize] = pos as isize;
        }

        Self { index }
    }

    /// Suffix start offsets in sorted order, including the empty suffix in slot 0.
    pub fn as_slice(&self) -> &[isize] {
        &self.index
    }

    /// Find the old suffix sharing the longest prefix with `target`.
    ///
    /// Returns `(old_offset, match_len)`.
    pub fn longest_match(&self, old: &[u8], target: &[u8]) -> (usize, usize) {
        self.search(old, target, 0, old.len())
    }

    /// Binary search over the inclusive rank range `[start, end]`.
    ///
    /// Keeps `suffix(start) < target <= suffix(end)`, so the longest common prefix is
    /// found at one of the two boundaries once they are adjacent. Ties go to `start`.
    pub fn search(
        &self,
        old: &[u8],
        target: &[u8],
        mut start: usize,
        mut end: usize,
    ) -> (usize, usize) {
        while end - start >= 2 {
            let mid = start + (end - start) / 2;
            if old[self.offset(mid)..].cmp(target) == Ordering::Less {
                start = mid;
            } else {
                end = mid;
            }
        }

        let lo = self.offset(start);
        let hi = self.offset(end);
        let lo_len = common_prefix_len(&old[lo..], target);
        let hi_len = common_prefix_len(&old[hi..], target);
        if lo_len >= hi_len {
            (lo, lo_len)
        } else {
            (hi, hi_len)
        }
    }

    fn offset(&self, rank: usize) -> usize {
        self.index[rank] as usize
    }
}

pub fn common_prefix_len(left: &[u8], right: &[u8]) -> usize {
    left.iter().zip(right).take_while(|(a, b)| a == b).count()
}

/// Refine one group of equal-ranked suffixes by the rank `h` positions further on.
///
/// Runs off an explicit worklist: low-entropy inputs produce groups close to `n` in
/// size, and the lower partition must be finished before the equal band is ranked.
fn split(index: &mut [isize], rank: &mut [isize], start: usize, len: usize, h: usize) {
    let mut pending = vec![Pending::Group { start, len }];
    while let Some(task) = pending.pop() {
        match task {
            Pending::Group { start, len } if len < SMALL_GROUP => {
                let end = start + len;
                let mut k = start;
                while k < end {
                    let mut j = 1;
                    let mut x = sort_key(index, rank, k, h);
                    for i in 1..end - k {
                        let v = sort_key(index, rank, k + i, h);
                        if v < x {
                            x = v;
                            j = 0;
                        }
                        if v == x {
                            index.swap(k + j, k + i);
                            j += 1;
                        }
                    }
                    for i in 0..j {
                        rank[index[k + i] as usize] = (k + j - 1) as isize;
                    }
                    if j == 1 {
                        index[k] = -1;
                    }
                    k += j;
                }
            }
            Pending::Group { start, len } => {
                let end = start + len;
                let pivot = sort_key(index, rank, start + len / 2, h);

                let mut below = 0;
                let mut equal = 0;
                for k in start..end {
                    match sort_key(index, rank, k, h).cmp(&pivot) {
                        Ordering::Less => below += 1,
                        Ordering::Equal => equal += 1,
                        Ordering::Greater => {}
                    }
                }
                let lo = start + below;
                let hi = lo + equal;

                let mut i = start;
                let mut j = 0;
                let mut k = 0;
                while i < lo {
                    match sort_key(index, rank, i, h).cmp(&pivot) {
                        Ordering::Less => i += 1,
                        Ordering::Equal => {
                            index.swap(i, lo + j);
                            j += 1;
                        }
                        Ordering::Greater => {
                            index.swap(i, hi + k);
                            k += 1;
                        }
                    }
                }
                while lo + j < hi {
                    if sort_key(index, rank, lo + j, h) == pivot {
                        j += 1;
                    } else {
                        index.swap(lo + j, hi + k);
                        k += 1;
                    }
                }

                if lo > start {
                    pending.push(Pending::Band { lo, hi, end });
                    pending.push(Pending::Group { start, len: lo - start });
                    continue;
                }
                finish_band(index, rank, lo, hi);
                if end > hi {
                    pending.push(Pending::Group { start: hi, len: end - hi });
                }
            }
            Pending::Band { lo, hi, end } => {
                finish_band(index, rank, lo, hi);
                if end > hi {
                    pending.push(Pending::Group { start: hi, len: end - hi });
                }
            }
        }
    }
}

fn sort_key(index: &[isize], rank: &[isize], k: usize, h: usize) -> isize {
    rank[index[k] as usize + h]
}

fn finish_band(index: &mut [isize], rank: &mut [isize], lo: usize, hi: usize) {
    for i in lo..hi {
        rank[index[i] as usize] = (hi - 1) as isize;
    }
    if lo == hi - 1 {
        index[lo] = -1;
    }
}
