// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Derivation of neighbouring macroblocks and blocks for frames without
//! macroblock-adaptive frame/field coding, clauses 6.4.8 to 6.4.12.

/// Which neighbour to look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neighbor {
    /// Left, `(xD, yD) = (-1, 0)`.
    A,
    /// Above, `(xD, yD) = (0, -1)`.
    B,
}

impl Neighbor {
    fn delta(self) -> (i32, i32) {
        match self {
            Neighbor::A => (-1, 0),
            Neighbor::B => (0, -1),
        }
    }
}

/// Addresses of the macroblocks around `CurrMbAddr`, see clause 6.4.9.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbNeighbors {
    pub a: Option<usize>,
    pub b: Option<usize>,
    pub c: Option<usize>,
    pub d: Option<usize>,
}

/// A neighbouring location, clause 6.4.12: the macroblock covering it and
/// the position relative to that macroblock's upper-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub mb_addr: usize,
    pub xw: i32,
    pub yw: i32,
}

/// Locates neighbours inside the macroblock grid of one slice.
///
/// A macroblock is only available if it was already decoded as part of the
/// current slice, i.e. its address lies in `first_mb..=CurrMbAddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbLocator {
    pic_width_in_mbs: usize,
    first_mb: usize,
}

impl MbLocator {
    pub fn new(pic_width_in_mbs: usize, first_mb: usize) -> Self {
        Self {
            pic_width_in_mbs: pic_width_in_mbs.max(1),
            first_mb,
        }
    }

    /// Clause 6.4.8.
    fn available(&self, addr: Option<usize>, curr: usize) -> Option<usize> {
        addr.filter(|addr| *addr >= self.first_mb && *addr <= curr)
    }

    fn is_left_column(&self, curr: usize) -> bool {
        curr % self.pic_width_in_mbs == 0
    }

    fn is_right_column(&self, curr: usize) -> bool {
        (curr + 1) % self.pic_width_in_mbs == 0
    }

    pub fn mb_a(&self, curr: usize) -> Option<usize> {
        if self.is_left_column(curr) {
            return None;
        }

        self.available(curr.checked_sub(1), curr)
    }

    pub fn mb_b(&self, curr: usize) -> Option<usize> {
        self.available(curr.checked_sub(self.pic_width_in_mbs), curr)
    }

    pub fn mb_c(&self, curr: usize) -> Option<usize> {
        if self.is_right_column(curr) {
            return None;
        }

        self.available((curr + 1).checked_sub(self.pic_width_in_mbs), curr)
    }

    pub fn mb_d(&self, curr: usize) -> Option<usize> {
        if self.is_left_column(curr) {
            return None;
        }

        self.available(curr.checked_sub(self.pic_width_in_mbs + 1), curr)
    }

    pub fn neighbors(&self, curr: usize) -> MbNeighbors {
        MbNeighbors {
            a: self.mb_a(curr),
            b: self.mb_b(curr),
            c: self.mb_c(curr),
            d: self.mb_d(curr),
        }
    }

    /// Neighbouring location `(xN, yN)` relative to the upper-left corner of
    /// `curr`, for a `max_w` x `max_h` array of samples. Table 6-3.
    pub fn location(
        &self,
        curr: usize,
        xn: i32,
        yn: i32,
        max_w: i32,
        max_h: i32,
    ) -> Option<Location> {
        if yn >= max_h {
            return None;
        }

        let mb_addr = match (xn, yn) {
            (x, y) if x < 0 && y < 0 => self.mb_d(curr),
            (x, _) if x < 0 => self.mb_a(curr),
            (x, y) if x < max_w && y < 0 => self.mb_b(curr),
            (x, _) if x < max_w => Some(curr),
            (_, y) if y < 0 => self.mb_c(curr),
            _ => None,
        }?;

        Some(Location {
            mb_addr,
            xw: (xn + max_w) % max_w,
            yw: (yn + max_h) % max_h,
        })
    }

    /// Neighbouring 4x4 luma block, clause 6.4.11.4. Returns the macroblock
    /// address and `luma4x4BlkIdxN`.
    ///
    /// Also used for the Cb and Cr blocks when `ChromaArrayType` is 3.
    pub fn luma4x4(&self, curr: usize, blk: usize, n: Neighbor) -> Option<(usize, usize)> {
        let (x, y) = luma4x4_position(blk);
        let (xd, yd) = n.delta();
        let loc = self.location(curr, x + xd, y + yd, 16, 16)?;

        Some((loc.mb_addr, luma4x4_index(loc.xw, loc.yw)))
    }

    /// Neighbouring 8x8 luma block, clause 6.4.11.2. Returns the macroblock
    /// address and `luma8x8BlkIdxN`.
    pub fn luma8x8(&self, curr: usize, blk: usize, n: Neighbor) -> Option<(usize, usize)> {
        let x = 8 * (blk % 2) as i32;
        let y = 8 * (blk / 2) as i32;
        let (xd, yd) = n.delta();
        let loc = self.location(curr, x + xd, y + yd, 16, 16)?;

        Some((loc.mb_addr, (2 * (loc.yw / 8) + loc.xw / 8) as usize))
    }

    /// Neighbouring 4x4 chroma block for `ChromaArrayType` 1 and 2, clause
    /// 6.4.11.5. `mb_width_c` x `mb_height_c` is the chroma macroblock size.
    pub fn chroma4x4(
        &self,
        curr: usize,
        blk: usize,
        n: Neighbor,
        mb_width_c: i32,
        mb_height_c: i32,
    ) -> Option<(usize, usize)> {
        let x = 4 * (blk % 2) as i32;
        let y = 4 * (blk / 2) as i32;
        let (xd, yd) = n.delta();
        let loc = self.location(curr, x + xd, y + yd, mb_width_c, mb_height_c)?;

        Some((loc.mb_addr, (2 * (loc.yw / 4) + loc.xw / 4) as usize))
    }
}

/// Upper-left luma sample of a 4x4 block, clause 6.4.3.
pub fn luma4x4_position(blk: usize) -> (i32, i32) {
    let blk = blk as i32;
    let x = 8 * ((blk / 4) % 2) + 4 * ((blk % 4) % 2);
    let y = 8 * ((blk / 4) / 2) + 4 * ((blk % 4) / 2);
    (x, y)
}

/// 4x4 luma block covering a luma location, clause 6.4.13.1.
pub fn luma4x4_index(x: i32, y: i32) -> usize {
    (8 * (y / 8) + 4 * (x / 8) + 2 * ((y % 8) / 4) + ((x % 8) / 4)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picture_edges() {
        // 3x2 macroblocks, single slice.
        let locator = MbLocator::new(3, 0);

        assert_eq!(locator.neighbors(0), MbNeighbors::default());

        let n = locator.neighbors(2);
        assert_eq!(n.a, Some(1));
        assert_eq!(n.b, None);
        assert_eq!(n.c, None);
        assert_eq!(n.d, None);

        // Leftmost column of the second row.
        let n = locator.neighbors(3);
        assert_eq!(n.a, None);
        assert_eq!(n.b, Some(0));
        assert_eq!(n.c, Some(1));
        assert_eq!(n.d, None);

        // Rightmost column of the second row.
        let n = locator.neighbors(5);
        assert_eq!(n.a, Some(4));
        assert_eq!(n.b, Some(2));
        assert_eq!(n.c, None);
        assert_eq!(n.d, Some(1));
    }

    #[test]
    fn macroblocks_of_other_slices() {
        let locator = MbLocator::new(3, 4);
        let n = locator.neighbors(5);
        assert_eq!(n.a, Some(4));
        assert_eq!(n.b, None);
        assert_eq!(n.d, None);

        let n = locator.neighbors(4);
        assert_eq!(n.a, None);
        assert_eq!(n.c, None);
    }

    #[test]
    fn single_column_picture() {
        let locator = MbLocator::new(1, 0);
        let n = locator.neighbors(2);
        assert_eq!(n.a, None);
        assert_eq!(n.b, Some(1));
        assert_eq!(n.c, None);
        assert_eq!(n.d, None);
    }

    #[test]
    fn neighbouring_locations() {
        let locator = MbLocator::new(3, 0);

        assert_eq!(
            locator.location(4, -1, -1, 16, 16),
            Some(Location {
                mb_addr: 0,
                xw: 15,
                yw: 15
            })
        );
        assert_eq!(
            locator.location(4, 16, -1, 16, 16),
            Some(Location {
                mb_addr: 2,
                xw: 0,
                yw: 15
            })
        );
        assert_eq!(
            locator.location(4, 3, 7, 16, 16),
            Some(Location {
                mb_addr: 4,
                xw: 3,
                yw: 7
            })
        );
        // Right and below the current macroblock are never available.
        assert_eq!(locator.location(4, 16, 0, 16, 16), None);
        assert_eq!(locator.location(4, 0, 16, 16, 16), None);
    }

    #[test]
    fn luma_blocks() {
        let locator = MbLocator::new(3, 0);

        assert_eq!(locator.luma4x4(4, 0, Neighbor::A), Some((3, 5)));
        assert_eq!(locator.luma4x4(4, 0, Neighbor::B), Some((1, 10)));
        assert_eq!(locator.luma4x4(4, 5, Neighbor::A), Some((4, 4)));
        assert_eq!(locator.luma4x4(4, 5, Neighbor::B), Some((1, 15)));
        assert_eq!(locator.luma4x4(4, 15, Neighbor::A), Some((4, 14)));
        assert_eq!(locator.luma4x4(4, 15, Neighbor::B), Some((4, 13)));

        assert_eq!(locator.luma4x4(0, 0, Neighbor::A), None);
        assert_eq!(locator.luma4x4(0, 0, Neighbor::B), None);

        assert_eq!(locator.luma8x8(4, 3, Neighbor::A), Some((4, 2)));
        assert_eq!(locator.luma8x8(4, 0, Neighbor::B), Some((1, 2)));
        assert_eq!(locator.luma8x8(4, 1, Neighbor::A), Some((4, 0)));
        assert_eq!(locator.luma8x8(3, 2, Neighbor::A), None);
    }

    #[test]
    fn chroma_blocks() {
        let locator = MbLocator::new(3, 0);

        // 4:2:0
        assert_eq!(locator.chroma4x4(4, 1, Neighbor::A, 8, 8), Some((4, 0)));
        assert_eq!(locator.chroma4x4(4, 0, Neighbor::A, 8, 8), Some((3, 1)));
        assert_eq!(locator.chroma4x4(4, 0, Neighbor::B, 8, 8), Some((1, 2)));
        assert_eq!(locator.chroma4x4(4, 3, Neighbor::B, 8, 8), Some((4, 1)));

        // 4:2:2
        assert_eq!(locator.chroma4x4(4, 0, Neighbor::B, 8, 16), Some((1, 6)));
        assert_eq!(locator.chroma4x4(4, 7, Neighbor::B, 8, 16), Some((4, 5)));
    }

    #[test]
    fn block_scan_is_consistent() {
        for blk in 0..16 {
            let (x, y) = luma4x4_position(blk);
            assert_eq!(luma4x4_index(x, y), blk);
            assert_eq!(luma4x4_index(x + 3, y + 3), blk);
        }
    }
}
